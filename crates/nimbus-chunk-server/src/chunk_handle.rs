//! Per-chunk in-memory state: identity, stability, in-flight I/O counts,
//! and the FIFO queue of metadata-mutation ops.
//!
//! The handle is a pure state machine; disk submission and completion are
//! driven by the chunk manager, which owns the locking discipline. The
//! ordering contract lives here: a metadata op may not start while data
//! writes are in flight, ops run strictly one at a time per handle, and a
//! rename commits the in-memory version and stability only on completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use nimbus_types::{ChunkVersion, Result};

use crate::chunk_info::ChunkInfo;
use crate::disk_io::ChunkFile;

/// Which global list currently holds a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalListKind {
    None,
    Lru,
    Stale,
    PendingStale,
}

/// Which of its directory's lists currently holds a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirListKind {
    None,
    Live,
    Evacuating,
}

/// One queued metadata mutation.
#[derive(Debug)]
pub enum MetaOpKind {
    /// Rewrite the header region with a pre-serialized image. `None`
    /// carries no bytes and acts purely as an ordering barrier behind
    /// already-queued ops.
    WriteHeader { header: Option<Vec<u8>> },
    /// Move the file to the path encoding the target state and commit the
    /// in-memory version/stability on success.
    Rename {
        target_version: ChunkVersion,
        target_stable: bool,
    },
}

pub struct MetaOp {
    pub kind: MetaOpKind,
    /// Completion channel; `None` for fire-and-forget ops.
    pub done: Option<oneshot::Sender<Result<()>>>,
}

impl std::fmt::Debug for MetaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MetaOpKind::WriteHeader { header } => {
                write!(
                    f,
                    "MetaOp::WriteHeader({} bytes)",
                    header.as_ref().map(Vec::len).unwrap_or(0)
                )
            }
            MetaOpKind::Rename {
                target_version,
                target_stable,
            } => write!(f, "MetaOp::Rename(v{} stable={})", target_version, target_stable),
        }
    }
}

/// In-memory record of one hosted chunk.
pub struct ChunkInfoHandle {
    pub info: ChunkInfo,
    /// Index of the owning chunk directory.
    pub dir_index: usize,
    /// Shared open file handle; `None` while closed.
    pub data_file: Option<Arc<ChunkFile>>,
    pub last_io_time: Instant,
    /// False while open for write; true once stabilized.
    pub stable: bool,
    pub being_replicated: bool,
    pub appender_owns: bool,
    /// In-memory metadata differs from the on-disk header.
    pub meta_dirty: bool,
    pub writes_in_flight: u32,
    pub renames_in_flight: u32,
    /// A metadata op reached the front while data writes were in flight;
    /// the last completing write restarts the queue.
    pub wait_for_writes: bool,
    /// Handle is doomed; freed once its meta queue drains.
    pub delete_pending: bool,
    /// Removed from the chunk table; awaiting stale disposal.
    pub stale: bool,
    /// Stale disposal renames into the stale-chunks dir instead of
    /// unlinking.
    pub keep_on_stale: bool,
    pub meta_op_running: bool,
    pub meta_op_queue: VecDeque<MetaOp>,
    /// One header read at a time; later callers wait on the first.
    pub read_meta_in_flight: bool,
    pub read_meta_waiters: Vec<oneshot::Sender<Result<()>>>,
    pub global_list: GlobalListKind,
    pub dir_list: DirListKind,
}

impl ChunkInfoHandle {
    pub fn new(info: ChunkInfo, dir_index: usize, stable: bool) -> Self {
        Self {
            info,
            dir_index,
            data_file: None,
            last_io_time: Instant::now(),
            stable,
            being_replicated: false,
            appender_owns: false,
            meta_dirty: false,
            writes_in_flight: 0,
            renames_in_flight: 0,
            wait_for_writes: false,
            delete_pending: false,
            stale: false,
            keep_on_stale: false,
            meta_op_running: false,
            meta_op_queue: VecDeque::new(),
            read_meta_in_flight: false,
            read_meta_waiters: Vec::new(),
            global_list: GlobalListKind::None,
            dir_list: DirListKind::None,
        }
    }

    pub fn is_file_open(&self) -> bool {
        self.data_file.is_some()
    }

    /// Stable id of the currently open file, for stale-completion checks.
    pub fn open_file_id(&self) -> Option<u64> {
        self.data_file.as_ref().map(|f| f.id())
    }

    pub fn is_rename_in_flight(&self) -> bool {
        self.renames_in_flight > 0
    }

    pub fn has_meta_ops(&self) -> bool {
        self.meta_op_running || !self.meta_op_queue.is_empty()
    }

    /// The state the chunk is transitioning into: the last queued rename's
    /// target, or the committed state when nothing is queued.
    pub fn target_state(&self) -> (bool, ChunkVersion) {
        for op in self.meta_op_queue.iter().rev() {
            if let MetaOpKind::Rename {
                target_version,
                target_stable,
            } = op.kind
            {
                return (target_stable, target_version);
            }
        }
        (self.stable, self.info.version)
    }

    /// Whether this handle holds, or will hold after queued renames
    /// commit, the given version.
    pub fn can_have_version(&self, version: ChunkVersion) -> bool {
        if self.info.version == version {
            return true;
        }
        self.meta_op_queue.iter().any(|op| {
            matches!(
                op.kind,
                MetaOpKind::Rename { target_version, .. } if target_version == version
            )
        })
    }

    /// Whether the version argument of an operation matches either the
    /// committed version or the in-flight rename target.
    pub fn version_matches(&self, version: ChunkVersion) -> bool {
        if self.is_rename_in_flight() {
            let (_, target) = self.target_state();
            target == version
        } else {
            self.info.version == version
        }
    }

    /// Whether a rename to the target state needs a disk rename at all.
    /// Unstable files always carry version zero in their name, so a
    /// version-only change of an unstable chunk has no on-disk effect.
    pub fn rename_needed(&self, target_stable: bool, target_version: ChunkVersion) -> bool {
        (self.stable && self.info.version != target_version) || self.stable != target_stable
    }

    pub fn push_meta_op(&mut self, op: MetaOp) {
        if matches!(op.kind, MetaOpKind::Rename { .. }) {
            self.renames_in_flight += 1;
        }
        self.meta_op_queue.push_back(op);
    }

    /// Commit the effects of a completed rename.
    pub fn commit_rename(&mut self, target_stable: bool, target_version: ChunkVersion) {
        self.stable = target_stable;
        self.info.version = target_version;
        if self.stable {
            self.appender_owns = false;
        }
    }

    pub fn touch(&mut self) {
        self.last_io_time = Instant::now();
    }
}

impl std::fmt::Debug for ChunkInfoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkInfoHandle")
            .field("chunk_id", &self.info.chunk_id)
            .field("version", &self.info.version)
            .field("size", &self.info.size)
            .field("stable", &self.stable)
            .field("writes_in_flight", &self.writes_in_flight)
            .field("renames_in_flight", &self.renames_in_flight)
            .field("queued_meta_ops", &self.meta_op_queue.len())
            .field("stale", &self.stale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_types::{ChunkId, FileId};

    fn handle() -> ChunkInfoHandle {
        ChunkInfoHandle::new(
            ChunkInfo::new(FileId(1), ChunkId(2), ChunkVersion(1)),
            0,
            false,
        )
    }

    fn rename_op(version: u64, stable: bool) -> MetaOp {
        MetaOp {
            kind: MetaOpKind::Rename {
                target_version: ChunkVersion(version),
                target_stable: stable,
            },
            done: None,
        }
    }

    #[test]
    fn test_target_state_without_queue() {
        let h = handle();
        assert_eq!(h.target_state(), (false, ChunkVersion(1)));
    }

    #[test]
    fn test_target_state_uses_last_rename() {
        let mut h = handle();
        h.push_meta_op(MetaOp {
            kind: MetaOpKind::WriteHeader { header: None },
            done: None,
        });
        h.push_meta_op(rename_op(2, true));
        h.push_meta_op(rename_op(3, true));
        assert_eq!(h.target_state(), (true, ChunkVersion(3)));
        assert_eq!(h.renames_in_flight, 2);
    }

    #[test]
    fn test_can_have_version() {
        let mut h = handle();
        assert!(h.can_have_version(ChunkVersion(1)));
        assert!(!h.can_have_version(ChunkVersion(2)));
        h.push_meta_op(rename_op(2, true));
        assert!(h.can_have_version(ChunkVersion(2)));
    }

    #[test]
    fn test_version_matches_prefers_target_when_rename_queued() {
        let mut h = handle();
        assert!(h.version_matches(ChunkVersion(1)));
        h.push_meta_op(rename_op(5, true));
        assert!(h.version_matches(ChunkVersion(5)));
        assert!(!h.version_matches(ChunkVersion(1)));
    }

    #[test]
    fn test_rename_needed() {
        let mut h = handle();
        // Unstable to unstable, version change only: no disk rename.
        assert!(!h.rename_needed(false, ChunkVersion(9)));
        // Unstable to stable: rename.
        assert!(h.rename_needed(true, ChunkVersion(1)));

        h.stable = true;
        // Stable, same version: nothing to do.
        assert!(!h.rename_needed(true, ChunkVersion(1)));
        // Stable, version change: rename.
        assert!(h.rename_needed(true, ChunkVersion(2)));
        // Stable back to unstable: rename.
        assert!(h.rename_needed(false, ChunkVersion(1)));
    }

    #[test]
    fn test_commit_rename_clears_appender() {
        let mut h = handle();
        h.appender_owns = true;
        h.commit_rename(true, ChunkVersion(4));
        assert!(h.stable);
        assert_eq!(h.info.version, ChunkVersion(4));
        assert!(!h.appender_owns);
    }
}
