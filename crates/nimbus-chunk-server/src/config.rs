//! Chunk server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nimbus_types::{make_error_msg, Result, StatusCode};

use crate::chunk_info::record_len;

/// Configuration of the storage engine. Field defaults match a production
/// deployment with one chunk directory per physical disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkServerConfig {
    /// Directories hosting chunks, one per physical disk.
    #[serde(default)]
    pub chunk_dirs: Vec<PathBuf>,

    /// Node capacity ceiling in bytes.
    #[serde(default = "default_total_space")]
    pub total_space: i64,

    /// Chunk payload capacity in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Checksum block size in bytes; reads and writes are internally
    /// aligned to it.
    #[serde(default = "default_checksum_block_size")]
    pub checksum_block_size: u64,

    /// Fixed chunk file header size in bytes.
    #[serde(default = "default_chunk_header_size")]
    pub chunk_header_size: u64,

    /// Free-space floor per directory for placement.
    #[serde(default = "default_min_fs_available_space")]
    pub min_fs_available_space: i64,

    /// Per-directory utilization ceiling for placement.
    #[serde(default = "default_max_space_utilization_threshold")]
    pub max_space_utilization_threshold: f64,

    /// Pending-I/O pressure weights in placement.
    #[serde(default)]
    pub chunk_placement_pending_read_weight: f64,
    #[serde(default)]
    pub chunk_placement_pending_write_weight: f64,

    /// Weighted-random skew toward emptier directories.
    #[serde(default = "default_max_placement_space_ratio")]
    pub max_placement_space_ratio: f64,

    /// Minimum pending-I/O budget in bytes.
    #[serde(default = "default_min_pending_io_threshold")]
    pub min_pending_io_threshold: i64,

    /// Write-id TTL in seconds.
    #[serde(default = "default_max_pending_write_lru_secs")]
    pub max_pending_write_lru_secs: u64,

    /// Idle-handle TTL in seconds.
    #[serde(default = "default_inactive_fds_cleanup_interval_secs")]
    pub inactive_fds_cleanup_interval_secs: u64,

    /// fd budget, derived from the OS limit at deployment time.
    #[serde(default = "default_max_open_chunk_files")]
    pub max_open_chunk_files: i64,
    #[serde(default = "default_max_open_fds")]
    pub max_open_fds: i64,
    #[serde(default = "default_fds_per_chunk")]
    pub fds_per_chunk: i64,

    /// Strictness flags.
    #[serde(default)]
    pub abort_on_checksum_mismatch: bool,
    #[serde(default)]
    pub require_chunk_header_checksum: bool,

    /// Stale-disposal policy.
    #[serde(default)]
    pub force_delete_stale_chunks: bool,
    #[serde(default)]
    pub keep_evacuated_chunks: bool,

    /// Delete concurrency.
    #[serde(default = "default_max_stale_chunk_ops_in_flight")]
    pub max_stale_chunk_ops_in_flight: i32,

    /// Failure thresholds.
    #[serde(default = "default_max_dir_check_disk_timeouts")]
    pub max_dir_check_disk_timeouts: i32,
    #[serde(default = "default_max_evacuate_io_errors")]
    pub max_evacuate_io_errors: i32,

    /// Path names.
    #[serde(default = "default_evacuate_file_name")]
    pub evacuate_file_name: String,
    #[serde(default = "default_evacuate_done_file_name")]
    pub evacuate_done_file_name: String,
    #[serde(default = "default_stale_chunks_dir")]
    pub stale_chunks_dir: String,
    #[serde(default = "default_dirty_chunks_dir")]
    pub dirty_chunks_dir: String,
    #[serde(default = "default_dir_lock_name")]
    pub dir_lock_name: String,

    /// Timer intervals in seconds.
    #[serde(default = "default_evacuation_inactivity_timeout")]
    pub evacuation_inactivity_timeout: u64,
    #[serde(default = "default_dir_recheck_interval_secs")]
    pub dir_recheck_interval_secs: u64,
    #[serde(default = "default_get_fs_space_available_interval_secs")]
    pub get_fs_space_available_interval_secs: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_chunk_dirs_check_interval_secs")]
    pub chunk_dirs_check_interval_secs: u64,

    /// Behavior toggles.
    #[serde(default)]
    pub buffered_io: bool,
    #[serde(default = "default_true")]
    pub allow_sparse_chunks: bool,
    #[serde(default = "default_true")]
    pub cleanup_chunk_dirs: bool,
    #[serde(default)]
    pub read_checksum_mismatch_max_retry_count: u32,

    /// Per-op disk timeout in seconds; zero disables.
    #[serde(default = "default_disk_op_timeout_secs")]
    pub disk_op_timeout_secs: u64,
}

fn default_total_space() -> i64 {
    i64::MAX / 2
}
fn default_chunk_size() -> u64 {
    64 << 20
}
fn default_checksum_block_size() -> u64 {
    64 << 10
}
fn default_chunk_header_size() -> u64 {
    16 << 10
}
fn default_min_fs_available_space() -> i64 {
    (default_chunk_size() + default_chunk_header_size()) as i64
}
fn default_max_space_utilization_threshold() -> f64 {
    0.05
}
fn default_max_placement_space_ratio() -> f64 {
    0.2
}
fn default_min_pending_io_threshold() -> i64 {
    8 << 20
}
fn default_max_pending_write_lru_secs() -> u64 {
    300
}
fn default_inactive_fds_cleanup_interval_secs() -> u64 {
    300
}
fn default_max_open_chunk_files() -> i64 {
    (64 << 10) - 8
}
fn default_max_open_fds() -> i64 {
    1 << 10
}
fn default_fds_per_chunk() -> i64 {
    1
}
fn default_max_stale_chunk_ops_in_flight() -> i32 {
    4
}
fn default_max_dir_check_disk_timeouts() -> i32 {
    4
}
fn default_max_evacuate_io_errors() -> i32 {
    2
}
fn default_evacuate_file_name() -> String {
    "evacuate".into()
}
fn default_evacuate_done_file_name() -> String {
    "evacuate.done".into()
}
fn default_stale_chunks_dir() -> String {
    "lost+found".into()
}
fn default_dirty_chunks_dir() -> String {
    "dirty".into()
}
fn default_dir_lock_name() -> String {
    "lock".into()
}
fn default_evacuation_inactivity_timeout() -> u64 {
    300
}
fn default_dir_recheck_interval_secs() -> u64 {
    180
}
fn default_get_fs_space_available_interval_secs() -> u64 {
    25
}
fn default_checkpoint_interval_secs() -> u64 {
    120
}
fn default_chunk_dirs_check_interval_secs() -> u64 {
    120
}
fn default_disk_op_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        // Round-trip through serde so every field picks up its default fn.
        toml::from_str("").expect("default config must deserialize")
    }
}

impl ChunkServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            nimbus_types::Status::with_message(
                StatusCode::IO_ERROR,
                format!("read {}: {}", path.as_ref().display(), e),
            )
        })?;
        let config: ChunkServerConfig = toml::from_str(&content).map_err(|e| {
            nimbus_types::Status::with_message(
                StatusCode::CONFIG_PARSE_ERROR,
                format!("parse {}: {}", path.as_ref().display(), e),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Number of checksum blocks per chunk.
    pub fn max_blocks(&self) -> usize {
        (self.chunk_size / self.checksum_block_size) as usize
    }

    pub fn disk_op_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_op_timeout_secs)
    }

    /// Open-chunk budget derived from the fd limits.
    pub fn open_chunk_budget(&self) -> i64 {
        (self.max_open_fds / self.fds_per_chunk.max(1)).min(self.max_open_chunk_files)
    }

    pub fn validate(&self) -> Result<()> {
        if self.checksum_block_size == 0 || self.chunk_size % self.checksum_block_size != 0 {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "chunk size {} must be a nonzero multiple of checksum block size {}",
                    self.chunk_size, self.checksum_block_size
                ),
            );
        }
        let needed = record_len(self.max_blocks()) + 8;
        if (self.chunk_header_size as usize) < needed {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "chunk header size {} below serialized record size {}",
                    self.chunk_header_size, needed
                ),
            );
        }
        for name in [
            &self.evacuate_file_name,
            &self.evacuate_done_file_name,
            &self.stale_chunks_dir,
            &self.dirty_chunks_dir,
            &self.dir_lock_name,
        ] {
            if name.is_empty() || name.contains('/') {
                return make_error_msg(
                    StatusCode::INVALID_CONFIG,
                    format!("invalid special file name: {:?}", name),
                );
            }
        }
        // Two directories where one is a path prefix of the other would
        // silently share chunks; diagnose instead.
        for (i, a) in self.chunk_dirs.iter().enumerate() {
            for b in self.chunk_dirs.iter().skip(i + 1) {
                if a == b || a.starts_with(b) || b.starts_with(a) {
                    return make_error_msg(
                        StatusCode::INVALID_CONFIG,
                        format!(
                            "chunk dirs overlap: {} and {}",
                            a.display(),
                            b.display()
                        ),
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChunkServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 64 << 20);
        assert_eq!(config.checksum_block_size, 64 << 10);
        assert_eq!(config.chunk_header_size, 16 << 10);
        assert_eq!(config.max_blocks(), 1024);
        assert_eq!(config.stale_chunks_dir, "lost+found");
        assert_eq!(config.dirty_chunks_dir, "dirty");
        assert!(config.allow_sparse_chunks);
        assert!(config.cleanup_chunk_dirs);
        assert!(!config.abort_on_checksum_mismatch);
    }

    #[test]
    fn test_parse_overrides() {
        let config: ChunkServerConfig = toml::from_str(
            r#"
            chunk_dirs = ["/data/0", "/data/1"]
            chunk_size = 1048576
            checksum_block_size = 65536
            max_pending_write_lru_secs = 60
            keep_evacuated_chunks = true
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_dirs.len(), 2);
        assert_eq!(config.chunk_size, 1 << 20);
        assert_eq!(config.max_blocks(), 16);
        assert_eq!(config.max_pending_write_lru_secs, 60);
        assert!(config.keep_evacuated_chunks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_block_geometry() {
        let mut config = ChunkServerConfig::default();
        config.checksum_block_size = 0;
        assert!(config.validate().is_err());

        let mut config = ChunkServerConfig::default();
        config.chunk_size = (64 << 10) + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_header() {
        let mut config = ChunkServerConfig::default();
        config.chunk_header_size = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_prefix_dirs() {
        let mut config = ChunkServerConfig::default();
        config.chunk_dirs = vec![PathBuf::from("/data"), PathBuf::from("/data/0")];
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), StatusCode::INVALID_CONFIG);
    }

    #[test]
    fn test_validate_rejects_slash_in_names() {
        let mut config = ChunkServerConfig::default();
        config.dirty_chunks_dir = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_open_chunk_budget() {
        let mut config = ChunkServerConfig::default();
        config.max_open_fds = 100;
        config.fds_per_chunk = 2;
        assert_eq!(config.open_chunk_budget(), 50);
    }
}
