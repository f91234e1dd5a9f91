//! Directory evacuation driving.
//!
//! An operator requests evacuation by touching the evacuate sentinel in a
//! chunk directory. The engine then asks the meta server to re-replicate
//! the directory's chunks in batches; acknowledged chunks move to the
//! evacuating list and leave via the normal stale path once re-replicated.
//! When both lists drain, the sentinel is renamed to its `.done`
//! counterpart and the directory is retired.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use nimbus_proto::{DirSpaceStats, EvacuateChunksReq, EvacuateChunksRsp, MAX_CHUNK_IDS};
use nimbus_types::{ChunkId, MetaCode, Result};

use crate::chunk_manager::ChunkManager;
use crate::die;
use crate::disk_io::DiskQueue;

enum EvacuateAction {
    RenameSentinel(Arc<DiskQueue>, PathBuf, PathBuf),
    SendBatch(DirSpaceStats, Vec<ChunkId>),
}

impl ChunkManager {
    pub(crate) fn spawn_schedule_evacuate(self: &Arc<Self>, dir_index: usize, max_chunks: i32) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.schedule_evacuate(dir_index, max_chunks).await });
    }

    /// Advance the evacuation state machine of one directory.
    pub(crate) async fn schedule_evacuate(self: &Arc<Self>, dir_index: usize, max_chunks: i32) {
        let action = {
            let st = &mut *self.state.lock();
            let dir = &st.dirs[dir_index];
            if !dir.is_in_use() || dir.evacuate_chunks_op_in_flight || !dir.evacuate_flag {
                return;
            }
            if dir.evacuate_started && dir.live.is_empty() {
                if dir.evacuate_in_flight_count > 0 || !dir.evacuating.is_empty() {
                    return;
                }
                if dir.evacuate_done || dir.evacuate_file_rename_in_flight {
                    return;
                }
                let src = dir.dirname.join(&self.config.evacuate_file_name);
                let dst = dir.dirname.join(&self.config.evacuate_done_file_name);
                let Some(queue) = dir.disk_queue.clone() else {
                    return;
                };
                st.dirs[dir_index].evacuate_file_rename_in_flight = true;
                EvacuateAction::RenameSentinel(queue, src, dst)
            } else if dir.evacuate_started {
                let max_count = if max_chunks > 0 {
                    (max_chunks as usize).min(MAX_CHUNK_IDS)
                } else {
                    MAX_CHUNK_IDS
                };
                let ids: Vec<ChunkId> = st
                    .arena
                    .dir_ids(&dir.live)
                    .into_iter()
                    .take(max_count)
                    .filter_map(|slot| st.arena.get(slot).map(|h| h.info.chunk_id))
                    .collect();
                let dir = &mut st.dirs[dir_index];
                dir.evacuate_chunks_op_in_flight = true;
                dir.update_last_evacuation_activity_time();
                EvacuateAction::SendBatch(DirSpaceStats::unchanged(), ids)
            } else {
                info!(dir = %dir.dirname.display(), "evacuate starting");
                // First batch carries the node's space counters computed
                // as if this directory were already out of placement, so
                // the meta server stops allocating onto it.
                let update_flag = dir.count_fs_space_available;
                st.dirs[dir_index].set_evacuate_started();
                if update_flag {
                    st.update_count_fs_space_flags();
                }
                let space = st.total_space_info(&self.config);
                st.dirs[dir_index].evacuate_started = false;
                if update_flag {
                    st.update_count_fs_space_flags();
                }
                let stats = DirSpaceStats {
                    total_space: space.total_space,
                    total_fs_space: space.total_fs_space,
                    used_space: space.used_space,
                    chunk_dirs: space.chunk_dirs,
                    writable_chunk_dirs: space.writable_chunk_dirs,
                    evacuate_in_flight_count: space.evacuate_in_flight_count,
                    evacuate_chunks: space.evacuate_chunks,
                    evacuate_byte_count: space.evacuate_byte_count,
                };
                let dir = &mut st.dirs[dir_index];
                dir.evacuate_chunks_op_in_flight = true;
                dir.update_last_evacuation_activity_time();
                // Submitted with no ids: the response turns evacuation on
                // and the follow-up batch carries the chunk list.
                EvacuateAction::SendBatch(stats, Vec::new())
            }
        };

        match action {
            EvacuateAction::RenameSentinel(queue, src, dst) => {
                let res = queue.rename(src, dst).await;
                {
                    let st = &mut *self.state.lock();
                    st.dirs[dir_index].evacuate_file_rename_in_flight = false;
                    if !st.dirs[dir_index].is_in_use() {
                        return;
                    }
                    if res.is_ok() {
                        let dir = &mut st.dirs[dir_index];
                        dir.disk_timeout_count = 0;
                        dir.evacuate_done = true;
                        info!(dir = %dir.dirname.display(), "evacuation done");
                    }
                }
                match res {
                    Ok(()) => self.notify_chunks_lost(dir_index).await,
                    Err(e) => self.dir_error(dir_index, &e).await,
                }
            }
            EvacuateAction::SendBatch(stats, ids) => {
                let req = EvacuateChunksReq {
                    stats,
                    chunk_ids: ids.clone(),
                };
                let res = self.meta.evacuate_chunks(req).await;
                self.evacuate_chunks_done(dir_index, res, ids).await;
            }
        }
    }

    async fn evacuate_chunks_done(
        self: &Arc<Self>,
        dir_index: usize,
        result: Result<EvacuateChunksRsp>,
        ids: Vec<ChunkId>,
    ) {
        let reschedule = {
            let st = &mut *self.state.lock();
            st.dirs[dir_index].evacuate_chunks_op_in_flight = false;
            if !st.dirs[dir_index].is_in_use() || !st.dirs[dir_index].evacuate_flag {
                return;
            }
            st.dirs[dir_index].update_last_evacuation_activity_time();
            match result {
                Err(e) => {
                    let try_again = e.code() == MetaCode::TRY_AGAIN;
                    if !st.dirs[dir_index].evacuate_started && try_again {
                        st.dirs[dir_index].set_evacuate_started();
                    }
                    let dir = &st.dirs[dir_index];
                    if !dir.evacuate_started
                        || (dir.evacuate_in_flight_count <= 0
                            && (!try_again || ids.len() <= 1))
                    {
                        if !dir.evacuating.is_empty() {
                            die("non empty evacuate list");
                        }
                        let dirname = dir.dirname.clone();
                        let dir = &mut st.dirs[dir_index];
                        dir.evacuate_started = false;
                        dir.evacuate_flag = false;
                        warn!(
                            dir = %dirname.display(),
                            error = %e,
                            "evacuate failed, restarting from sentinel check"
                        );
                    }
                    if st.dirs[dir_index].evacuate_started
                        == st.dirs[dir_index].count_fs_space_available
                    {
                        st.update_count_fs_space_flags();
                    }
                    let dir = &mut st.dirs[dir_index];
                    dir.reschedule_evacuate_threshold =
                        (dir.evacuate_in_flight_count - ids.len() as i32).max(0);
                    // Degrade to one chunk at a time on try-again with
                    // nothing in flight.
                    (dir.evacuate_in_flight_count <= 0 && dir.evacuate_started).then_some(1)
                }
                Ok(_rsp) => {
                    st.dirs[dir_index].set_evacuate_started();
                    if st.dirs[dir_index].count_fs_space_available {
                        st.update_count_fs_space_flags();
                    }
                    for chunk_id in &ids {
                        if let Some(&slot) = st.table.get(chunk_id) {
                            if st.arena.get(slot).map(|h| h.dir_index) == Some(dir_index) {
                                st.set_evacuate(slot, true);
                            }
                        }
                    }
                    Some(-1)
                }
            }
        };
        if let Some(batch) = reschedule {
            self.spawn_schedule_evacuate(dir_index, batch);
        }
    }

    /// Pull every evacuating chunk back onto the live list and start a
    /// fresh batch; used on meta reconnect and on inactivity timeout.
    pub(crate) fn restart_evacuation(self: &Arc<Self>, dir_index: usize) {
        {
            let st = &mut *self.state.lock();
            let dir = &st.dirs[dir_index];
            if !dir.is_in_use() || !dir.evacuate_started {
                return;
            }
            warn!(
                dir = %dir.dirname.display(),
                in_flight = dir.evacuate_in_flight_count,
                "evacuation restarting"
            );
            loop {
                let slot = st.arena.dir_front(&st.dirs[dir_index].evacuating);
                let Some(slot) = slot else { break };
                st.set_evacuate(slot, false);
            }
            st.dirs[dir_index].evacuate_in_flight_count = 0;
        }
        self.spawn_schedule_evacuate(dir_index, -1);
    }

    /// The meta server connection dropped: take evacuating directories
    /// out of placement immediately and requeue their batches on
    /// reconnect.
    pub fn meta_server_connection_lost(self: &Arc<Self>) {
        let restart: Vec<usize> = {
            let st = &mut *self.state.lock();
            let mut restart = Vec::new();
            for dir_index in 0..st.dirs.len() {
                let dir = &st.dirs[dir_index];
                if !dir.is_in_use() || !dir.evacuate_flag {
                    continue;
                }
                st.dirs[dir_index].set_evacuate_started();
                if st.dirs[dir_index].count_fs_space_available {
                    st.update_count_fs_space_flags();
                }
                restart.push(dir_index);
            }
            restart
        };
        for dir_index in restart {
            self.restart_evacuation(dir_index);
        }
    }
}

#[cfg(test)]
mod evacuation_tests {
    use super::*;
    use crate::test_support::*;
    use nimbus_types::{make_error, ChunkVersion, FileId};
    use std::time::Duration;

    async fn stable_chunk(cluster: &TestCluster, chunk_id: u64) {
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(chunk_id), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(chunk_id), ChunkVersion(1), 0, vec![7u8; 4096])
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(chunk_id), ChunkVersion(1), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_evacuation_end_to_end() {
        let cluster = start_cluster("evac-flow", 1).await;
        let mgr = &cluster.manager;
        for chunk_id in 1..=3u64 {
            stable_chunk(&cluster, chunk_id).await;
        }
        let dir0_chunks: Vec<ChunkId> = {
            let st = mgr.state.lock();
            st.arena
                .dir_ids(&st.dirs[0].live)
                .into_iter()
                .filter_map(|slot| st.arena.get(slot).map(|h| h.info.chunk_id))
                .collect()
        };

        // Operator touches the sentinel; the next probe starts evacuation.
        std::fs::write(cluster.dirs[0].join("evacuate"), b"").unwrap();
        mgr.get_fs_space_available().await;

        // First op announces space counters, the follow-up carries ids.
        assert!(
            wait_until(
                || {
                    cluster
                        .meta
                        .evacuate_chunks_requests()
                        .iter()
                        .any(|req| req.chunk_ids.len() == dir0_chunks.len())
                },
                Duration::from_secs(5)
            )
            .await
        );
        assert!(
            wait_until(
                || {
                    let st = mgr.state.lock();
                    st.dirs[0].evacuating.len() == dir0_chunks.len()
                        && st.dirs[0].live.is_empty()
                },
                Duration::from_secs(5)
            )
            .await
        );
        {
            let st = mgr.state.lock();
            assert!(st.dirs[0].evacuate_started);
            assert_eq!(
                st.dirs[0].evacuate_in_flight_count,
                dir0_chunks.len() as i32
            );
        }

        // New allocations never land on the evacuating directory.
        for _ in 0..50 {
            let st = &mut *mgr.state.lock();
            assert_ne!(mgr.get_dir_for_chunk(st), Some(0));
        }

        // The meta server re-replicates and deletes each chunk.
        for chunk_id in &dir0_chunks {
            mgr.stale_chunk(*chunk_id, true, true).await.unwrap();
        }

        // Drained: the sentinel is renamed and the directory retires.
        assert!(
            wait_until(
                || cluster.dirs[0].join("evacuate.done").exists(),
                Duration::from_secs(5)
            )
            .await
        );
        assert!(
            wait_until(
                || !mgr.state.lock().dirs[0].is_in_use(),
                Duration::from_secs(5)
            )
            .await
        );

        // The prober refuses to re-admit while the done sentinel exists.
        let checker = mgr.dir_checker();
        checker.check_now();
        assert!(checker.get_newly_available().is_empty());
    }

    #[tokio::test]
    async fn test_evacuation_failure_restarts_from_sentinel_check() {
        let cluster = start_cluster("evac-fail", 1).await;
        let mgr = &cluster.manager;
        stable_chunk(&cluster, 1).await;
        cluster
            .meta
            .on_evacuate_chunks(|_req| make_error(nimbus_types::MetaCode::REQUEST_FAILED));

        std::fs::write(cluster.dirs[0].join("evacuate"), b"").unwrap();
        mgr.get_fs_space_available().await;

        // The failed op resets the state machine; the sentinel probe will
        // pick it up again later.
        assert!(
            wait_until(
                || {
                    let st = mgr.state.lock();
                    !st.dirs[0].evacuate_flag && !st.dirs[0].evacuate_started
                },
                Duration::from_secs(5)
            )
            .await
        );
        {
            let st = mgr.state.lock();
            assert!(st.dirs[0].evacuating.is_empty());
            assert_eq!(st.dirs[0].live.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_restart_evacuation_rejoins_live_list() {
        let cluster = start_cluster("evac-restart", 1).await;
        let mgr = &cluster.manager;
        for chunk_id in 1..=2u64 {
            stable_chunk(&cluster, chunk_id).await;
        }
        std::fs::write(cluster.dirs[0].join("evacuate"), b"").unwrap();
        mgr.get_fs_space_available().await;
        assert!(
            wait_until(
                || mgr.state.lock().dirs[0].evacuating.len() == 2,
                Duration::from_secs(5)
            )
            .await
        );

        mgr.restart_evacuation(0);
        {
            let st = mgr.state.lock();
            assert!(st.dirs[0].evacuating.is_empty());
            assert_eq!(st.dirs[0].live.len(), 2);
            assert_eq!(st.dirs[0].evacuate_in_flight_count, 0);
        }
        // A fresh batch goes out for the rejoined chunks.
        assert!(
            wait_until(
                || mgr.state.lock().dirs[0].evacuating.len() == 2,
                Duration::from_secs(5)
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_count_fs_space_single_per_device() {
        // Both test dirs share one device; only one may count its space.
        let cluster = start_cluster("evac-count", 2).await;
        let mgr = &cluster.manager;
        {
            let st = &mut *mgr.state.lock();
            let counted = st
                .dirs
                .iter()
                .filter(|d| d.count_fs_space_available)
                .count();
            assert_eq!(counted, 1);
        }

        // Starting evacuation on the counted dir hands the flag over.
        let counted_index = {
            let st = mgr.state.lock();
            st.dirs
                .iter()
                .position(|d| d.count_fs_space_available)
                .unwrap()
        };
        {
            let st = &mut *mgr.state.lock();
            st.dirs[counted_index].evacuate_flag = true;
            st.dirs[counted_index].set_evacuate_started();
            st.update_count_fs_space_flags();
            assert!(!st.dirs[counted_index].count_fs_space_available);
            let counted = st
                .dirs
                .iter()
                .filter(|d| d.count_fs_space_available)
                .count();
            assert_eq!(counted, 1);
        }
    }
}
