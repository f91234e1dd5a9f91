//! Shared helpers for the engine tests: a small on-disk cluster with a
//! mock meta server and test-friendly geometry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nimbus_stubs::MockMetaServerStub;

use crate::chunk_manager::ChunkManager;
use crate::config::ChunkServerConfig;

pub(crate) struct TestCluster {
    pub manager: Arc<ChunkManager>,
    pub meta: Arc<MockMetaServerStub>,
    pub root: PathBuf,
    pub dirs: Vec<PathBuf>,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Geometry small enough for tests: 1 MiB chunks, 64 KiB blocks.
pub(crate) fn test_config(dirs: &[PathBuf]) -> ChunkServerConfig {
    let mut config = ChunkServerConfig::default();
    config.chunk_dirs = dirs.to_vec();
    config.chunk_size = 1 << 20;
    config.checksum_block_size = 64 << 10;
    config.chunk_header_size = 16 << 10;
    config.min_fs_available_space = 4096;
    config.max_space_utilization_threshold = 0.0;
    config.disk_op_timeout_secs = 30;
    config
}

pub(crate) fn make_dirs(name: &str, count: usize) -> (PathBuf, Vec<PathBuf>) {
    let root = std::env::temp_dir().join(format!("nimbus-cm-{}", name));
    let _ = std::fs::remove_dir_all(&root);
    let dirs: Vec<PathBuf> = (0..count).map(|i| root.join(format!("chunks{}", i))).collect();
    for dir in &dirs {
        std::fs::create_dir_all(dir).unwrap();
    }
    (root, dirs)
}

pub(crate) async fn start_cluster(name: &str, num_dirs: usize) -> TestCluster {
    start_cluster_with(name, num_dirs, |_| {}).await
}

pub(crate) async fn start_cluster_with(
    name: &str,
    num_dirs: usize,
    tweak: impl FnOnce(&mut ChunkServerConfig),
) -> TestCluster {
    let (root, dirs) = make_dirs(name, num_dirs);
    let mut config = test_config(&dirs);
    tweak(&mut config);
    let meta = MockMetaServerStub::new().into_arc();
    let manager = ChunkManager::new(config, meta.clone()).unwrap();
    manager.start().await.unwrap();
    TestCluster {
        manager,
        meta,
        root,
        dirs,
    }
}

/// Poll until `cond` holds or the timeout elapses; background work in the
/// engine (stale deletions, evacuation batches) completes asynchronously.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic payload for read-back assertions.
pub(crate) fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
