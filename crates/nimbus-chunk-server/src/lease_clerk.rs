//! Minimal lease bookkeeping.
//!
//! The full lease protocol lives with the meta-server client; the engine
//! only needs to know whether a chunk currently has a valid write lease
//! (such handles are skipped by fd cleanup) and to drop leases when a
//! chunk is closed or evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nimbus_types::ChunkId;

const LEASE_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct LeaseClerk {
    leases: HashMap<ChunkId, Instant>,
}

impl LeaseClerk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chunk_id: ChunkId) {
        self.leases.insert(chunk_id, Instant::now() + LEASE_DURATION);
    }

    pub fn is_lease_valid(&self, chunk_id: ChunkId) -> bool {
        self.leases
            .get(&chunk_id)
            .map(|&expiry| Instant::now() < expiry)
            .unwrap_or(false)
    }

    pub fn unregister(&mut self, chunk_id: ChunkId) {
        self.leases.remove(&chunk_id);
    }

    /// Give up the lease voluntarily, e.g. when closing an idle chunk.
    pub fn relinquish(&mut self, chunk_id: ChunkId) {
        self.leases.remove(&chunk_id);
    }

    /// Drop expired leases.
    pub fn timeout(&mut self) {
        let now = Instant::now();
        self.leases.retain(|_, &mut expiry| now < expiry);
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
