//! Chunk-server-to-meta-server op types.
//!
//! These are the notifications and requests the storage engine emits toward
//! the cluster meta server: corrupt/lost chunk events, evacuation batches,
//! and the hosted-chunks inventory report.

use serde::{Deserialize, Serialize};

use nimbus_types::{ChunkId, ChunkVersion, FileId};

/// Upper bound on the number of chunk ids carried by one evacuate batch.
pub const MAX_CHUNK_IDS: usize = 32;

/// Notify the meta server that a chunk is corrupted or lost, or that a
/// directory came back into use (`dir` set, ids empty).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorruptChunkReq {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    /// Directory the event refers to, when relevant (lost dir, dir in use).
    pub dir: Option<String>,
    /// Lost (no longer present) as opposed to corrupted-in-place.
    pub is_lost: bool,
    /// The directory is being (re-)announced as usable.
    pub dir_ok: bool,
    /// Additional chunk ids coalesced into the same notification.
    pub batch: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorruptChunkRsp {}

/// Space counters attached to the first evacuate batch of a directory so
/// the meta server can update its placement view before re-replicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirSpaceStats {
    pub total_space: i64,
    pub total_fs_space: i64,
    pub used_space: i64,
    pub chunk_dirs: i32,
    pub writable_chunk_dirs: i32,
    pub evacuate_in_flight_count: i32,
    pub evacuate_chunks: i32,
    pub evacuate_byte_count: i64,
}

impl DirSpaceStats {
    /// Stats placeholder for follow-up batches; negative counters mean
    /// "unchanged since the previous batch".
    pub fn unchanged() -> Self {
        Self {
            total_space: -1,
            total_fs_space: -1,
            used_space: -1,
            chunk_dirs: -1,
            writable_chunk_dirs: -1,
            evacuate_in_flight_count: -1,
            evacuate_chunks: -1,
            evacuate_byte_count: -1,
        }
    }
}

/// Ask the meta server to re-replicate a batch of chunks off this node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvacuateChunksReq {
    pub stats: DirSpaceStats,
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvacuateChunksRsp {
    /// Number of chunk ids the meta server accepted this round.
    pub num_accepted: i32,
}

/// One hosted chunk as reported to the meta server. Rename-in-flight
/// entries carry the target version, not the committed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedChunkEntry {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub size: u64,
}

/// Hosted-chunks inventory, partitioned by stability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedChunksReport {
    pub stable: Vec<HostedChunkEntry>,
    pub not_stable: Vec<HostedChunkEntry>,
    pub not_stable_append: Vec<HostedChunkEntry>,
}

impl HostedChunksReport {
    pub fn total(&self) -> usize {
        self.stable.len() + self.not_stable.len() + self.not_stable_append.len()
    }
}
