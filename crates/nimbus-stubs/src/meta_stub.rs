//! Meta server stub trait and mock implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use nimbus_proto::{
    CorruptChunkReq, CorruptChunkRsp, EvacuateChunksReq, EvacuateChunksRsp,
};
use nimbus_types::Result;

/// Client-side stub for the meta-server ops the storage engine emits.
///
/// The meta server is the cluster-wide authority for file and chunk
/// metadata; the chunk server notifies it of corrupted or lost chunks and
/// asks it to re-replicate chunks away from evacuating directories.
#[async_trait]
pub trait IMetaServerStub: Send + Sync {
    async fn corrupt_chunk(&self, req: CorruptChunkReq) -> Result<CorruptChunkRsp>;
    async fn evacuate_chunks(&self, req: EvacuateChunksReq) -> Result<EvacuateChunksRsp>;

    /// Whether a meta-server connection currently exists. Lost-chunk
    /// notifications are skipped while disconnected; inventory resync on
    /// reconnect covers them.
    fn is_connected(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

type Handler<Req, Rsp> = Box<dyn Fn(Req) -> Result<Rsp> + Send + Sync>;

/// A configurable mock for [`IMetaServerStub`].
///
/// Each op can be overridden with a closure; without one the mock records
/// the request and returns a default (success) response.
pub struct MockMetaServerStub {
    pub corrupt_chunk_handler: Mutex<Option<Handler<CorruptChunkReq, CorruptChunkRsp>>>,
    pub evacuate_chunks_handler: Mutex<Option<Handler<EvacuateChunksReq, EvacuateChunksRsp>>>,
    pub corrupt_chunk_reqs: Mutex<Vec<CorruptChunkReq>>,
    pub evacuate_chunks_reqs: Mutex<Vec<EvacuateChunksReq>>,
    pub connected: Mutex<bool>,
}

impl MockMetaServerStub {
    pub fn new() -> Self {
        Self {
            corrupt_chunk_handler: Mutex::new(None),
            evacuate_chunks_handler: Mutex::new(None),
            corrupt_chunk_reqs: Mutex::new(Vec::new()),
            evacuate_chunks_reqs: Mutex::new(Vec::new()),
            connected: Mutex::new(true),
        }
    }

    /// Wrap in an `Arc` for convenient sharing.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn on_corrupt_chunk(
        &self,
        f: impl Fn(CorruptChunkReq) -> Result<CorruptChunkRsp> + Send + Sync + 'static,
    ) {
        *self.corrupt_chunk_handler.lock() = Some(Box::new(f));
    }

    pub fn on_evacuate_chunks(
        &self,
        f: impl Fn(EvacuateChunksReq) -> Result<EvacuateChunksRsp> + Send + Sync + 'static,
    ) {
        *self.evacuate_chunks_handler.lock() = Some(Box::new(f));
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    /// Requests seen so far, for test assertions.
    pub fn corrupt_chunk_requests(&self) -> Vec<CorruptChunkReq> {
        self.corrupt_chunk_reqs.lock().clone()
    }

    pub fn evacuate_chunks_requests(&self) -> Vec<EvacuateChunksReq> {
        self.evacuate_chunks_reqs.lock().clone()
    }
}

impl Default for MockMetaServerStub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IMetaServerStub for MockMetaServerStub {
    async fn corrupt_chunk(&self, req: CorruptChunkReq) -> Result<CorruptChunkRsp> {
        self.corrupt_chunk_reqs.lock().push(req.clone());
        let guard = self.corrupt_chunk_handler.lock();
        match guard.as_ref() {
            Some(f) => f(req),
            None => Ok(CorruptChunkRsp {}),
        }
    }

    async fn evacuate_chunks(&self, req: EvacuateChunksReq) -> Result<EvacuateChunksRsp> {
        self.evacuate_chunks_reqs.lock().push(req.clone());
        let guard = self.evacuate_chunks_handler.lock();
        match guard.as_ref() {
            Some(f) => f(req),
            None => Ok(EvacuateChunksRsp {
                num_accepted: req.chunk_ids.len() as i32,
            }),
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

/// Blanket implementation: `Arc<T>` delegates to `T`.
#[async_trait]
impl<T: IMetaServerStub + ?Sized> IMetaServerStub for Arc<T> {
    async fn corrupt_chunk(&self, req: CorruptChunkReq) -> Result<CorruptChunkRsp> {
        (**self).corrupt_chunk(req).await
    }
    async fn evacuate_chunks(&self, req: EvacuateChunksReq) -> Result<EvacuateChunksRsp> {
        (**self).evacuate_chunks(req).await
    }
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
