//! Outstanding write reservations (write-ids).
//!
//! A client that intends to push bytes first allocates a write-id bound to
//! a (chunk, version) pair; follow-up writes reference the id. The table
//! keeps a FIFO by enqueue time so idle reservations can be scavenged, and
//! reservations are dropped wholesale when their chunk stabilizes or goes
//! stale.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use nimbus_types::{ChunkId, ChunkVersion, WriteId};

#[derive(Debug, Clone)]
pub struct WriteReservation {
    pub write_id: WriteId,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub offset: u64,
    pub num_bytes: u64,
    pub enqueue_time: Instant,
    /// Status of the most recent write against this id.
    pub status: i32,
}

#[derive(Debug, Default)]
pub struct PendingWriteTable {
    by_id: HashMap<WriteId, WriteReservation>,
    // FIFO of ids in enqueue order; entries may be stale after deletes.
    fifo: VecDeque<WriteId>,
    chunk_write_counts: HashMap<ChunkId, usize>,
}

impl PendingWriteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn insert(&mut self, reservation: WriteReservation) {
        *self
            .chunk_write_counts
            .entry(reservation.chunk_id)
            .or_insert(0) += 1;
        self.fifo.push_back(reservation.write_id);
        self.by_id.insert(reservation.write_id, reservation);
    }

    pub fn find(&self, write_id: WriteId) -> Option<&WriteReservation> {
        self.by_id.get(&write_id)
    }

    /// Refresh the enqueue time of a reservation that saw new traffic.
    pub fn touch(&mut self, write_id: WriteId) -> bool {
        if let Some(res) = self.by_id.get_mut(&write_id) {
            res.enqueue_time = Instant::now();
            self.fifo.push_back(write_id);
            true
        } else {
            false
        }
    }

    pub fn set_status(&mut self, write_id: WriteId, status: i32) -> bool {
        if let Some(res) = self.by_id.get_mut(&write_id) {
            res.status = status;
            true
        } else {
            false
        }
    }

    pub fn get_status(&self, write_id: WriteId) -> Option<i32> {
        self.by_id.get(&write_id).map(|r| r.status)
    }

    pub fn is_write_pending(&self, chunk_id: ChunkId) -> bool {
        self.chunk_write_counts
            .get(&chunk_id)
            .map(|&n| n > 0)
            .unwrap_or(false)
    }

    /// Number of distinct chunks with at least one reservation.
    pub fn chunk_id_count(&self) -> usize {
        self.chunk_write_counts.len()
    }

    fn remove_entry(&mut self, write_id: WriteId) -> Option<WriteReservation> {
        let res = self.by_id.remove(&write_id)?;
        if let Some(count) = self.chunk_write_counts.get_mut(&res.chunk_id) {
            *count -= 1;
            if *count == 0 {
                self.chunk_write_counts.remove(&res.chunk_id);
            }
        }
        Some(res)
    }

    /// Drop every reservation for the given (chunk, version); used on
    /// make-stable and stale eviction. Returns false only if a matching
    /// chunk entry exists with a mismatched version, which the caller
    /// treats as corrupted bookkeeping.
    pub fn delete(&mut self, chunk_id: ChunkId, version: ChunkVersion) -> bool {
        let ids: Vec<WriteId> = self
            .by_id
            .values()
            .filter(|r| r.chunk_id == chunk_id)
            .map(|r| r.write_id)
            .collect();
        for id in ids {
            let res = &self.by_id[&id];
            if res.version != version {
                return false;
            }
            self.remove_entry(id);
        }
        true
    }

    /// Retire reservations whose enqueue time is older than the TTL.
    /// Returns the chunks that lost reservations, for idle-close checks.
    pub fn scavenge(&mut self, now: Instant, ttl: std::time::Duration) -> Vec<ChunkId> {
        let mut expired_chunks = Vec::new();
        while let Some(&front_id) = self.fifo.front() {
            match self.by_id.get(&front_id) {
                None => {
                    // Stale FIFO entry for an already-deleted or re-touched id.
                    self.fifo.pop_front();
                }
                Some(res) => {
                    if now.duration_since(res.enqueue_time) < ttl {
                        break;
                    }
                    let chunk_id = res.chunk_id;
                    self.fifo.pop_front();
                    // A touched reservation has a newer FIFO entry; only
                    // drop it if this entry reflects its current time.
                    if self
                        .by_id
                        .get(&front_id)
                        .map(|r| now.duration_since(r.enqueue_time) >= ttl)
                        .unwrap_or(false)
                    {
                        self.remove_entry(front_id);
                        expired_chunks.push(chunk_id);
                    }
                }
            }
        }
        expired_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reservation(write_id: u64, chunk_id: u64, version: u64) -> WriteReservation {
        WriteReservation {
            write_id: WriteId(write_id),
            chunk_id: ChunkId(chunk_id),
            version: ChunkVersion(version),
            offset: 0,
            num_bytes: 0,
            enqueue_time: Instant::now(),
            status: 0,
        }
    }

    #[test]
    fn test_insert_find() {
        let mut table = PendingWriteTable::new();
        table.insert(reservation(1, 10, 1));
        assert_eq!(table.len(), 1);
        assert!(table.find(WriteId(1)).is_some());
        assert!(table.find(WriteId(2)).is_none());
        assert!(table.is_write_pending(ChunkId(10)));
        assert!(!table.is_write_pending(ChunkId(11)));
    }

    #[test]
    fn test_delete_by_chunk_and_version() {
        let mut table = PendingWriteTable::new();
        table.insert(reservation(1, 10, 1));
        table.insert(reservation(2, 10, 1));
        table.insert(reservation(3, 20, 1));

        assert!(table.delete(ChunkId(10), ChunkVersion(1)));
        assert_eq!(table.len(), 1);
        assert!(!table.is_write_pending(ChunkId(10)));
        assert!(table.is_write_pending(ChunkId(20)));

        // Deleting a chunk with no reservations succeeds.
        assert!(table.delete(ChunkId(99), ChunkVersion(1)));
    }

    #[test]
    fn test_delete_version_mismatch_fails() {
        let mut table = PendingWriteTable::new();
        table.insert(reservation(1, 10, 2));
        assert!(!table.delete(ChunkId(10), ChunkVersion(1)));
    }

    #[test]
    fn test_scavenge_expires_old_entries() {
        let mut table = PendingWriteTable::new();
        let mut old = reservation(1, 10, 1);
        old.enqueue_time = Instant::now() - Duration::from_secs(600);
        table.insert(old);
        table.insert(reservation(2, 20, 1));

        let expired = table.scavenge(Instant::now(), Duration::from_secs(300));
        assert_eq!(expired, vec![ChunkId(10)]);
        assert_eq!(table.len(), 1);
        assert!(table.find(WriteId(2)).is_some());
    }

    #[test]
    fn test_touch_defers_scavenge() {
        let mut table = PendingWriteTable::new();
        let mut res = reservation(1, 10, 1);
        res.enqueue_time = Instant::now() - Duration::from_secs(600);
        table.insert(res);
        assert!(table.touch(WriteId(1)));

        let expired = table.scavenge(Instant::now(), Duration::from_secs(300));
        assert!(expired.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_status_plumbing() {
        let mut table = PendingWriteTable::new();
        table.insert(reservation(1, 10, 1));
        assert_eq!(table.get_status(WriteId(1)), Some(0));
        assert!(table.set_status(WriteId(1), -5));
        assert_eq!(table.get_status(WriteId(1)), Some(-5));
        assert!(!table.set_status(WriteId(9), 0));
    }

    #[test]
    fn test_chunk_id_count() {
        let mut table = PendingWriteTable::new();
        table.insert(reservation(1, 10, 1));
        table.insert(reservation(2, 10, 1));
        table.insert(reservation(3, 20, 1));
        assert_eq!(table.chunk_id_count(), 2);
    }
}
