//! Periodic maintenance: the timer tick and everything it drives.
//!
//! The tick scavenges expired write reservations, closes idle file
//! handles (more aggressively under fd pressure), re-checks directory
//! health, and refreshes per-directory free-space numbers, which is also
//! where the evacuate sentinel is probed.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use nimbus_proto::CorruptChunkReq;
use nimbus_types::{ChunkCode, ChunkId};

use crate::chunk_handle::GlobalListKind;
use crate::chunk_manager::ChunkManager;
use crate::disk_io::DiskQueue;

impl ChunkManager {
    /// Timer tick; drive from a periodic task.
    pub async fn timeout(self: &Arc<Self>) {
        let now = Instant::now();
        let (do_checkpoint, do_dirs, do_space) = {
            let st = &mut *self.state.lock();
            let do_checkpoint = now >= st.next_checkpoint;
            if do_checkpoint {
                st.next_checkpoint =
                    now + Duration::from_secs(self.config.checkpoint_interval_secs);
            }
            let do_dirs = now >= st.next_dirs_check;
            if do_dirs {
                st.next_dirs_check =
                    now + Duration::from_secs(self.config.chunk_dirs_check_interval_secs);
            }
            let do_space = now >= st.next_space_check;
            if do_space {
                st.next_space_check =
                    now + Duration::from_secs(self.config.get_fs_space_available_interval_secs);
            }
            st.leases.timeout();
            (do_checkpoint, do_dirs, do_space)
        };
        if do_checkpoint {
            self.scavenge_pending_writes(now).await;
            self.cleanup_inactive_fds(true).await;
        }
        if do_dirs {
            self.check_chunk_dirs().await;
        }
        if do_space {
            self.get_fs_space_available().await;
        }
    }

    /// Retire write reservations past their TTL; close their chunks when
    /// those have also gone idle.
    pub(crate) async fn scavenge_pending_writes(self: &Arc<Self>, now: Instant) {
        let idle_cutoff = Duration::from_secs(self.config.inactive_fds_cleanup_interval_secs);
        let flush: Vec<ChunkId> = {
            let st = &mut *self.state.lock();
            let ttl = Duration::from_secs(self.config.max_pending_write_lru_secs);
            let expired = st.pending_writes.scavenge(now, ttl);
            let mut flush = Vec::new();
            for chunk_id in expired {
                debug!(%chunk_id, "retiring idle write reservation");
                let Some(&slot) = st.table.get(&chunk_id) else {
                    continue;
                };
                let Some(h) = st.arena.get(slot) else { continue };
                if !h.is_file_open()
                    || now.duration_since(h.last_io_time) < idle_cutoff
                    || h.writes_in_flight > 0
                    || h.has_meta_ops()
                {
                    continue;
                }
                if h.meta_dirty {
                    flush.push(chunk_id);
                } else {
                    self.release_handle(st, slot);
                }
            }
            flush
        };
        for chunk_id in flush {
            // Flush dirty metadata now; the close happens on a later pass.
            if let Err(e) = self.write_chunk_metadata(chunk_id, false).await {
                warn!(%chunk_id, error = %e, "metadata flush for idle chunk failed");
            }
        }
    }

    /// Close handles idle past the threshold, front (oldest) first.
    /// `periodic` passes honor the scheduled time; pressure passes run
    /// with a shortened threshold whenever the open-fd budget is near.
    pub(crate) async fn cleanup_inactive_fds(self: &Arc<Self>, periodic: bool) {
        let now = Instant::now();
        let interval = Duration::from_secs(self.config.inactive_fds_cleanup_interval_secs);
        let flush: Vec<ChunkId> = {
            let st = &mut *self.state.lock();
            if periodic {
                if now < st.next_inactive_fd_cleanup {
                    return;
                }
            } else {
                let open = self.open_chunk_count.load(Ordering::Relaxed);
                if open < self.config.open_chunk_budget() {
                    return;
                }
            }
            let threshold = if periodic {
                interval
            } else {
                // Out of fds: shorten the idle threshold.
                Duration::from_secs((self.config.inactive_fds_cleanup_interval_secs + 2) / 3)
            };
            let mut flush = Vec::new();
            for slot in st.arena.global_ids(GlobalListKind::Lru) {
                let Some(h) = st.arena.get(slot) else { continue };
                if now.duration_since(h.last_io_time) < threshold {
                    // The list is ordered by last use; the rest is newer.
                    break;
                }
                if !h.is_file_open() || h.being_replicated {
                    st.arena.set_global_list(slot, GlobalListKind::None);
                    continue;
                }
                let chunk_id = h.info.chunk_id;
                let file_in_use = h
                    .data_file
                    .as_ref()
                    .map(|f| Arc::strong_count(f) > 1)
                    .unwrap_or(false)
                    || h.writes_in_flight > 0
                    || h.has_meta_ops();
                if file_in_use
                    || st.leases.is_lease_valid(chunk_id)
                    || st.pending_writes.is_write_pending(chunk_id)
                {
                    debug!(%chunk_id, "skipping busy entry in chunk lru");
                    continue;
                }
                if h.meta_dirty {
                    flush.push(chunk_id);
                    continue;
                }
                self.release_handle(st, slot);
            }
            let front_io = st
                .arena
                .global_front(GlobalListKind::Lru)
                .and_then(|slot| st.arena.get(slot))
                .map(|h| h.last_io_time);
            st.next_inactive_fd_cleanup = match front_io {
                Some(t) if t + threshold > now => t + interval,
                _ => now + interval,
            };
            flush
        };
        for chunk_id in flush {
            if let Err(e) = self.write_chunk_metadata(chunk_id, false).await {
                warn!(%chunk_id, error = %e, "metadata flush before close failed");
            }
        }
    }

    /// Admit directories the prober brought back and probe the health of
    /// the ones in use.
    pub(crate) async fn check_chunk_dirs(self: &Arc<Self>) {
        debug!("checking chunk dirs");
        let mut newly = self.checker.get_newly_available();
        let mut admitted = false;
        let mut probes: Vec<(usize, Arc<DiskQueue>)> = Vec::new();
        let mut announce: Vec<PathBuf> = Vec::new();
        {
            let st = &mut *self.state.lock();
            for dir_index in 0..st.dirs.len() {
                if !st.dirs[dir_index].is_in_use() {
                    let dirname = st.dirs[dir_index].dirname.clone();
                    if let Some(avail) = newly.remove(&dirname) {
                        self.admit_dir(st, dir_index, avail);
                        st.update_count_fs_space_flags();
                        admitted = true;
                        announce.push(dirname);
                    }
                    continue;
                }
                if !st.dirs[dir_index].check_dir_readable_in_flight {
                    if let Some(queue) = st.dirs[dir_index].disk_queue.clone() {
                        st.dirs[dir_index].check_dir_readable_in_flight = true;
                        probes.push((dir_index, queue));
                    }
                }
            }
        }
        for dirname in announce {
            info!(dir = %dirname.display(), "chunk directory back in use");
            self.send_corrupt_notification(CorruptChunkReq {
                dir: Some(dirname.display().to_string()),
                dir_ok: true,
                ..Default::default()
            });
        }
        for (dir_index, queue) in probes {
            let res = queue.check_dir_readable().await;
            {
                let st = &mut *self.state.lock();
                st.dirs[dir_index].check_dir_readable_in_flight = false;
                if res.is_ok() {
                    st.dirs[dir_index].disk_timeout_count = 0;
                }
            }
            if let Err(e) = res {
                self.dir_error(dir_index, &e).await;
            }
        }
        if admitted {
            self.get_fs_space_available().await;
        }
    }

    /// Refresh free-space numbers and probe the evacuate sentinel; also
    /// the hook for the evacuation inactivity restart.
    pub(crate) async fn get_fs_space_available(self: &Arc<Self>) {
        struct Probe {
            dir_index: usize,
            queue: Arc<DiskQueue>,
            evacuate_path: Option<PathBuf>,
            /// This probe owns the directory's space-probe in-flight flag.
            space: bool,
        }
        let mut probes: Vec<Probe> = Vec::new();
        let mut restarts: Vec<usize> = Vec::new();
        {
            let st = &mut *self.state.lock();
            let inactivity = Duration::from_secs(self.config.evacuation_inactivity_timeout);
            for dir_index in 0..st.dirs.len() {
                let dir = &st.dirs[dir_index];
                if !dir.is_in_use() {
                    continue;
                }
                let Some(queue) = dir.disk_queue.clone() else {
                    continue;
                };
                let mut evacuate_path = None;
                if !dir.evacuate_flag && !dir.check_evacuate_file_in_flight {
                    evacuate_path = Some(dir.dirname.join(&self.config.evacuate_file_name));
                    st.dirs[dir_index].check_evacuate_file_in_flight = true;
                }
                let dir = &st.dirs[dir_index];
                if dir.evacuate_started
                    && self.config.evacuation_inactivity_timeout > 0
                    && !dir.evacuate_chunks_op_in_flight
                    && dir.evacuate_in_flight_count > 0
                    && dir.last_evacuation_activity_time.elapsed() > inactivity
                {
                    restarts.push(dir_index);
                }
                let space = !dir.fs_space_avail_in_flight;
                if space {
                    st.dirs[dir_index].fs_space_avail_in_flight = true;
                }
                if space || evacuate_path.is_some() {
                    probes.push(Probe {
                        dir_index,
                        queue,
                        evacuate_path,
                        space,
                    });
                }
            }
        }

        for probe in probes {
            if let Some(path) = probe.evacuate_path {
                let res = probe.queue.file_exists(path).await;
                let schedule = {
                    let st = &mut *self.state.lock();
                    let dir = &mut st.dirs[probe.dir_index];
                    dir.check_evacuate_file_in_flight = false;
                    match &res {
                        Ok(true) if dir.is_in_use() && !dir.evacuate_flag => {
                            info!(dir = %dir.dirname.display(), "evacuate sentinel found");
                            dir.disk_timeout_count = 0;
                            dir.evacuate_flag = true;
                            true
                        }
                        Ok(_) => {
                            dir.evacuate_check_io_errors_count = 0;
                            false
                        }
                        Err(e) => {
                            if e.code() == ChunkCode::IO_ERROR {
                                dir.evacuate_check_io_errors_count += 1;
                            }
                            false
                        }
                    }
                };
                if schedule {
                    self.spawn_schedule_evacuate(probe.dir_index, -1);
                }
                if let Err(e) = res {
                    let over = {
                        let st = self.state.lock();
                        st.dirs[probe.dir_index].evacuate_check_io_errors_count
                            >= self.config.max_evacuate_io_errors
                    };
                    if over {
                        self.dir_error(probe.dir_index, &e).await;
                    }
                }
            }

            if !probe.space {
                continue;
            }
            let res = probe.queue.stat_fs().await;
            {
                let st = &mut *self.state.lock();
                let dir = &mut st.dirs[probe.dir_index];
                dir.fs_space_avail_in_flight = false;
                if let Ok(space) = &res {
                    if dir.is_in_use() {
                        debug!(
                            dir = %dir.dirname.display(),
                            available = space.available,
                            total = space.total,
                            used = dir.used_space,
                            "fs space"
                        );
                        dir.available_space = space.available.max(0);
                        dir.total_space = space.total.max(0);
                        dir.disk_timeout_count = 0;
                    }
                }
            }
            if let Err(e) = res {
                self.dir_error(probe.dir_index, &e).await;
            }
        }

        for dir_index in restarts {
            self.restart_evacuation(dir_index);
        }
    }

    /// Drain stale deletions (bounded), drop pending writes, close every
    /// handle, and release directory locks.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.run_stale_queue(false);
        for _ in 0..1000 {
            if self.state.lock().stale_ops_in_flight <= 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let st = &mut *self.state.lock();
        if st.stale_ops_in_flight > 0 {
            warn!(
                in_flight = st.stale_ops_in_flight,
                "shutdown: pending stale deletions timed out"
            );
        }
        for slot in st.arena.global_ids(GlobalListKind::Stale) {
            st.free_handle(slot);
        }
        for slot in st.arena.global_ids(GlobalListKind::PendingStale) {
            st.free_handle(slot);
        }
        let now = Instant::now() + Duration::from_secs(2 * self.config.max_pending_write_lru_secs);
        st.pending_writes
            .scavenge(now, Duration::from_secs(self.config.max_pending_write_lru_secs));
        let slots: Vec<_> = st.table.values().copied().collect();
        for slot in slots {
            self.release_handle(st, slot);
            st.free_handle(slot);
        }
        st.table.clear();
        for dir in &mut st.dirs {
            if dir.is_in_use() {
                // Lists were drained with the table above.
                dir.stop();
            }
        }
        info!("chunk manager shut down");
    }
}
