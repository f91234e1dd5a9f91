//! Slot arena for chunk handles with index-linked intrusive lists.
//!
//! Handles live in a `Vec` of slots with a free list; stable `SlotId`s
//! carry a generation counter so a reused slot never satisfies a stale
//! reference. List membership is expressed as prev/next indices on the
//! slot, giving O(1) moves between the global lists (LRU, stale,
//! pending-stale) and the per-directory lists (live, evacuating), whose
//! heads live in the owning [`ChunkDirInfo`](crate::chunk_dir::ChunkDirInfo).

use crate::chunk_handle::{ChunkInfoHandle, DirListKind, GlobalListKind};
use crate::die;

const NIL: u32 = u32::MAX;

/// Stable reference to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    idx: u32,
    gen: u32,
}

/// Head/tail of one intrusive list.
#[derive(Debug, Clone, Copy)]
pub struct ListHead {
    head: u32,
    tail: u32,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ListHead {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot {
    gen: u32,
    handle: Option<ChunkInfoHandle>,
    g_prev: u32,
    g_next: u32,
    d_prev: u32,
    d_next: u32,
    free_next: u32,
}

/// Arena of chunk handles plus the global lists.
pub struct ChunkArena {
    slots: Vec<Slot>,
    free_head: u32,
    len: usize,
    pub lru: ListHead,
    pub stale: ListHead,
    pub pending_stale: ListHead,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            len: 0,
            lru: ListHead::new(),
            stale: ListHead::new(),
            pending_stale: ListHead::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, handle: ChunkInfoHandle) -> SlotId {
        self.len += 1;
        if self.free_head != NIL {
            let idx = self.free_head;
            let slot = &mut self.slots[idx as usize];
            self.free_head = slot.free_next;
            slot.handle = Some(handle);
            slot.g_prev = NIL;
            slot.g_next = NIL;
            slot.d_prev = NIL;
            slot.d_next = NIL;
            return SlotId {
                idx,
                gen: slot.gen,
            };
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            gen: 0,
            handle: Some(handle),
            g_prev: NIL,
            g_next: NIL,
            d_prev: NIL,
            d_next: NIL,
            free_next: NIL,
        });
        SlotId { idx, gen: 0 }
    }

    /// Free a slot and return its handle. The handle must already be off
    /// every list; membership here means corrupted bookkeeping.
    pub fn free(&mut self, id: SlotId) -> ChunkInfoHandle {
        let Some(handle) = self.slot_mut(id).and_then(|s| s.handle.take()) else {
            die("chunk arena: freeing invalid slot");
        };
        if handle.global_list != GlobalListKind::None || handle.dir_list != DirListKind::None {
            die("chunk arena: freeing handle still on a list");
        }
        let slot = &mut self.slots[id.idx as usize];
        slot.gen = slot.gen.wrapping_add(1);
        slot.free_next = self.free_head;
        self.free_head = id.idx;
        self.len -= 1;
        handle
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        let slot = self.slots.get(id.idx as usize)?;
        (slot.gen == id.gen && slot.handle.is_some()).then_some(slot)
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        (slot.gen == id.gen && slot.handle.is_some()).then_some(slot)
    }

    pub fn get(&self, id: SlotId) -> Option<&ChunkInfoHandle> {
        self.slot(id).and_then(|s| s.handle.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut ChunkInfoHandle> {
        self.slot_mut(id).and_then(|s| s.handle.as_mut())
    }

    // -- global lists -------------------------------------------------------

    fn global_head_mut(&mut self, kind: GlobalListKind) -> &mut ListHead {
        match kind {
            GlobalListKind::Lru => &mut self.lru,
            GlobalListKind::Stale => &mut self.stale,
            GlobalListKind::PendingStale => &mut self.pending_stale,
            GlobalListKind::None => die("chunk arena: no list head for None"),
        }
    }

    /// Detach from the current global list (if any) and append to `kind`
    /// (unless `None`).
    pub fn set_global_list(&mut self, id: SlotId, kind: GlobalListKind) {
        let Some(current) = self.get(id).map(|h| h.global_list) else {
            die("chunk arena: set_global_list on invalid slot");
        };
        if current != GlobalListKind::None {
            self.global_detach(id, current);
        }
        if kind != GlobalListKind::None {
            self.global_push_back(id, kind);
        }
        self.get_mut(id).unwrap().global_list = kind;
    }

    fn global_detach(&mut self, id: SlotId, kind: GlobalListKind) {
        let idx = id.idx;
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.g_prev, slot.g_next)
        };
        if prev != NIL {
            self.slots[prev as usize].g_next = next;
        }
        if next != NIL {
            self.slots[next as usize].g_prev = prev;
        }
        let list = self.global_head_mut(kind);
        if list.head == idx {
            list.head = next;
        }
        if list.tail == idx {
            list.tail = prev;
        }
        list.len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.g_prev = NIL;
        slot.g_next = NIL;
    }

    fn global_push_back(&mut self, id: SlotId, kind: GlobalListKind) {
        let idx = id.idx;
        let tail = self.global_head_mut(kind).tail;
        {
            let slot = &mut self.slots[idx as usize];
            slot.g_prev = tail;
            slot.g_next = NIL;
        }
        if tail != NIL {
            self.slots[tail as usize].g_next = idx;
        }
        let list = self.global_head_mut(kind);
        if list.head == NIL {
            list.head = idx;
        }
        list.tail = idx;
        list.len += 1;
    }

    /// Move an LRU member to the back (most recently used).
    pub fn lru_touch(&mut self, id: SlotId) {
        let Some(h) = self.get(id) else { return };
        if h.global_list != GlobalListKind::Lru {
            return;
        }
        self.global_detach(id, GlobalListKind::Lru);
        self.global_push_back(id, GlobalListKind::Lru);
    }

    pub fn global_front(&self, kind: GlobalListKind) -> Option<SlotId> {
        let list = match kind {
            GlobalListKind::Lru => &self.lru,
            GlobalListKind::Stale => &self.stale,
            GlobalListKind::PendingStale => &self.pending_stale,
            GlobalListKind::None => return None,
        };
        (list.head != NIL).then(|| SlotId {
            idx: list.head,
            gen: self.slots[list.head as usize].gen,
        })
    }

    /// Snapshot of a global list front to back. A `Vec` of stable ids is
    /// returned so callers can mutate while iterating.
    pub fn global_ids(&self, kind: GlobalListKind) -> Vec<SlotId> {
        let list = match kind {
            GlobalListKind::Lru => &self.lru,
            GlobalListKind::Stale => &self.stale,
            GlobalListKind::PendingStale => &self.pending_stale,
            GlobalListKind::None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(list.len);
        let mut cur = list.head;
        while cur != NIL {
            out.push(SlotId {
                idx: cur,
                gen: self.slots[cur as usize].gen,
            });
            cur = self.slots[cur as usize].g_next;
        }
        out
    }

    // -- directory lists ----------------------------------------------------

    /// Detach from the current directory list and append to another. The
    /// caller supplies the list heads because they live on the directory.
    pub fn dir_move(
        &mut self,
        id: SlotId,
        from: Option<&mut ListHead>,
        to: Option<(&mut ListHead, DirListKind)>,
    ) {
        let Some(current) = self.get(id).map(|h| h.dir_list) else {
            die("chunk arena: dir_move on invalid slot");
        };
        match (current, from) {
            (DirListKind::None, _) => {}
            (_, Some(list)) => self.dir_detach(id, list),
            (_, None) => die("chunk arena: dir_move without source list"),
        }
        let kind = match to {
            Some((list, kind)) => {
                self.dir_push_back(id, list);
                kind
            }
            None => DirListKind::None,
        };
        self.get_mut(id).unwrap().dir_list = kind;
    }

    fn dir_detach(&mut self, id: SlotId, list: &mut ListHead) {
        let idx = id.idx;
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.d_prev, slot.d_next)
        };
        if prev != NIL {
            self.slots[prev as usize].d_next = next;
        }
        if next != NIL {
            self.slots[next as usize].d_prev = prev;
        }
        if list.head == idx {
            list.head = next;
        }
        if list.tail == idx {
            list.tail = prev;
        }
        list.len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.d_prev = NIL;
        slot.d_next = NIL;
    }

    fn dir_push_back(&mut self, id: SlotId, list: &mut ListHead) {
        let idx = id.idx;
        {
            let slot = &mut self.slots[idx as usize];
            slot.d_prev = list.tail;
            slot.d_next = NIL;
        }
        if list.tail != NIL {
            self.slots[list.tail as usize].d_next = idx;
        }
        if list.head == NIL {
            list.head = idx;
        }
        list.tail = idx;
        list.len += 1;
    }

    pub fn dir_front(&self, list: &ListHead) -> Option<SlotId> {
        (list.head != NIL).then(|| SlotId {
            idx: list.head,
            gen: self.slots[list.head as usize].gen,
        })
    }

    /// Snapshot of a directory list front to back.
    pub fn dir_ids(&self, list: &ListHead) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(list.len);
        let mut cur = list.head;
        while cur != NIL {
            out.push(SlotId {
                idx: cur,
                gen: self.slots[cur as usize].gen,
            });
            cur = self.slots[cur as usize].d_next;
        }
        out
    }
}

impl Default for ChunkArena {
    fn default() -> Self {
        Self::new()
    }
}
