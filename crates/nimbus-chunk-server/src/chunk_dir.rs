//! In-memory record of one on-disk chunk directory.
//!
//! A directory owns two intrusive chunk lists (live and evacuating), its
//! disk queue, space counters, and the evacuation state machine flags.
//! `available_space < 0` marks a directory that is not in use (lost, or
//! never admitted); most state transitions ignore such directories.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use nimbus_types::DeviceId;

use crate::chunk_table::ListHead;
use crate::dir_checker::DirLock;
use crate::die;
use crate::disk_io::DiskQueue;

#[derive(Debug)]
pub struct ChunkDirInfo {
    pub dirname: PathBuf,
    pub used_space: i64,
    /// Negative while the directory is not in use.
    pub available_space: i64,
    pub total_space: i64,
    pub chunk_count: i64,
    pub corrupted_chunks_count: i64,
    pub disk_timeout_count: i32,
    pub evacuate_check_io_errors_count: i32,

    pub disk_queue: Option<Arc<DiskQueue>>,
    pub device_id: DeviceId,
    pub dir_lock: Option<DirLock>,

    /// At most one directory per device counts its file-system space
    /// toward the node totals.
    pub count_fs_space_available: bool,
    pub fs_space_avail_in_flight: bool,
    pub check_dir_readable_in_flight: bool,
    pub check_evacuate_file_in_flight: bool,

    pub evacuate_flag: bool,
    pub evacuate_started: bool,
    pub evacuate_done: bool,
    pub evacuate_chunks_op_in_flight: bool,
    pub evacuate_file_rename_in_flight: bool,
    pub evacuate_in_flight_count: i32,
    pub reschedule_evacuate_threshold: i32,
    pub evacuate_start_chunk_count: i64,
    pub evacuate_start_byte_count: i64,
    pub last_evacuation_activity_time: Instant,

    /// Scratch flag used by the placement pass.
    pub placement_skip: bool,

    pub live: ListHead,
    pub evacuating: ListHead,
}

impl ChunkDirInfo {
    pub fn new(dirname: PathBuf) -> Self {
        Self {
            dirname,
            used_space: 0,
            available_space: -1,
            total_space: 0,
            chunk_count: 0,
            corrupted_chunks_count: 0,
            disk_timeout_count: 0,
            evacuate_check_io_errors_count: 0,
            disk_queue: None,
            device_id: DeviceId(0),
            dir_lock: None,
            count_fs_space_available: false,
            fs_space_avail_in_flight: false,
            check_dir_readable_in_flight: false,
            check_evacuate_file_in_flight: false,
            evacuate_flag: false,
            evacuate_started: false,
            evacuate_done: false,
            evacuate_chunks_op_in_flight: false,
            evacuate_file_rename_in_flight: false,
            evacuate_in_flight_count: 0,
            reschedule_evacuate_threshold: 0,
            evacuate_start_chunk_count: -1,
            evacuate_start_byte_count: -1,
            last_evacuation_activity_time: Instant::now(),
            placement_skip: false,
            live: ListHead::new(),
            evacuating: ListHead::new(),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.available_space >= 0
    }

    /// Mark evacuation as started and latch the progress baselines.
    pub fn set_evacuate_started(&mut self) {
        self.evacuate_started = true;
        self.evacuate_start_chunk_count = self.evacuate_start_chunk_count.max(self.chunk_count);
        self.evacuate_start_byte_count = self.evacuate_start_byte_count.max(self.used_space);
    }

    pub fn evacuate_done_chunk_count(&self) -> i64 {
        self.evacuate_start_chunk_count.max(self.chunk_count) - self.chunk_count
    }

    pub fn evacuate_done_byte_count(&self) -> i64 {
        self.evacuate_start_byte_count.max(self.used_space) - self.used_space
    }

    pub fn update_last_evacuation_activity_time(&mut self) {
        self.last_evacuation_activity_time = Instant::now();
    }

    /// One evacuating chunk left this node. Returns true when enough acks
    /// accumulated that the next batch should be scheduled.
    pub fn chunk_evacuate_done(&mut self) -> bool {
        self.update_last_evacuation_activity_time();
        if self.evacuate_in_flight_count > 0 {
            self.evacuate_in_flight_count -= 1;
            return self.evacuate_in_flight_count <= self.reschedule_evacuate_threshold;
        }
        false
    }

    /// Take the directory out of service. Both chunk lists must have been
    /// drained by the caller.
    pub fn stop(&mut self) {
        if !self.live.is_empty() || !self.evacuating.is_empty() {
            die("chunk dir stop: chunk list is not empty");
        }
        if self.chunk_count != 0 {
            die("chunk dir stop: invalid chunk count");
        }
        self.disk_queue = None;
        self.dir_lock = None;
        self.device_id = DeviceId(0);
        self.available_space = -1;
        self.total_space = 0;
        self.used_space = 0;
        self.reschedule_evacuate_threshold = 0;
        self.evacuate_flag = false;
        self.evacuate_started = false;
        self.evacuate_done = false;
        self.evacuate_in_flight_count = 0;
        self.disk_timeout_count = 0;
        self.count_fs_space_available = false;
        self.evacuate_start_chunk_count = -1;
        self.evacuate_start_byte_count = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_dir_is_not_in_use() {
        let dir = ChunkDirInfo::new(PathBuf::from("/data/0"));
        assert!(!dir.is_in_use());
        assert_eq!(dir.available_space, -1);
    }

    #[test]
    fn test_set_evacuate_started_latches_baselines() {
        let mut dir = ChunkDirInfo::new(PathBuf::from("/data/0"));
        dir.chunk_count = 10;
        dir.used_space = 1000;
        dir.set_evacuate_started();
        assert!(dir.evacuate_started);
        assert_eq!(dir.evacuate_start_chunk_count, 10);
        assert_eq!(dir.evacuate_start_byte_count, 1000);

        // Baselines only grow.
        dir.chunk_count = 5;
        dir.used_space = 400;
        dir.set_evacuate_started();
        assert_eq!(dir.evacuate_start_chunk_count, 10);
        assert_eq!(dir.evacuate_done_chunk_count(), 5);
        assert_eq!(dir.evacuate_done_byte_count(), 600);
    }

    #[test]
    fn test_chunk_evacuate_done_thresholds() {
        let mut dir = ChunkDirInfo::new(PathBuf::from("/data/0"));
        dir.evacuate_in_flight_count = 3;
        dir.reschedule_evacuate_threshold = 1;

        assert!(!dir.chunk_evacuate_done()); // 2 left
        assert!(dir.chunk_evacuate_done()); // 1 left: at threshold
        assert!(dir.chunk_evacuate_done()); // 0 left
        assert!(!dir.chunk_evacuate_done()); // nothing in flight
    }

    #[test]
    fn test_stop_resets_state() {
        let mut dir = ChunkDirInfo::new(PathBuf::from("/data/0"));
        dir.available_space = 500;
        dir.total_space = 1000;
        dir.evacuate_flag = true;
        dir.count_fs_space_available = true;
        dir.stop();
        assert!(!dir.is_in_use());
        assert!(!dir.evacuate_flag);
        assert!(!dir.count_fs_space_available);
        assert_eq!(dir.used_space, 0);
    }
}
