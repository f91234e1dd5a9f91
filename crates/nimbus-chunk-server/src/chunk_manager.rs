//! The chunk manager: single in-memory index of all chunks hosted by this
//! node, and coordinator of every state transition against them.
//!
//! All engine state lives behind one mutex that is never held across an
//! await. Disk operations run on the per-directory [`DiskQueue`]s; each
//! completion re-acquires the lock and re-validates handle identity (slot
//! generation plus open-file id) before touching state, so completions
//! that raced with delete, eviction, or reopen are dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use nimbus_proto::{CorruptChunkReq, HostedChunkEntry, HostedChunksReport};
use nimbus_stubs::IMetaServerStub;
use nimbus_types::{
    make_error, make_error_msg, ChunkCode, ChunkId, ChunkVersion, FileId, Result, Status,
    StatusCode, WriteId,
};

use crate::checksum::{compute_checksums, null_block_checksum, zero_pad};
use crate::chunk_dir::ChunkDirInfo;
use crate::chunk_handle::{ChunkInfoHandle, DirListKind, GlobalListKind, MetaOp, MetaOpKind};
use crate::chunk_info::{block_checksum_matches, ChunkInfo, DiskChunkInfo};
use crate::chunk_table::{ChunkArena, SlotId};
use crate::config::ChunkServerConfig;
use crate::dir_checker::{AvailableDir, DirChecker, DirCheckerSettings};
use crate::die;
use crate::disk_io::DiskQueue;
use crate::lease_clerk::LeaseClerk;
use crate::pending_writes::{PendingWriteTable, WriteReservation};

/// Node-wide space accounting snapshot.
#[derive(Debug, Clone, Default)]
pub struct SpaceInfo {
    pub total_space: i64,
    pub total_fs_space: i64,
    pub used_space: i64,
    pub chunk_dirs: i32,
    pub writable_chunk_dirs: i32,
    pub evacuate_in_flight_count: i32,
    pub evacuate_chunks: i32,
    pub evacuate_byte_count: i64,
    pub evacuate_done_chunk_count: i32,
    pub evacuate_done_byte_count: i64,
    pub lost_chunk_dirs: Vec<PathBuf>,
}

pub(crate) struct CmState {
    pub(crate) arena: ChunkArena,
    pub(crate) table: HashMap<ChunkId, SlotId>,
    pub(crate) dirs: Vec<ChunkDirInfo>,
    pub(crate) pending_writes: PendingWriteTable,
    pub(crate) leases: LeaseClerk,
    pub(crate) used_space: i64,
    pub(crate) next_write_id: u64,
    pub(crate) stale_ops_in_flight: i32,
    pub(crate) next_checkpoint: Instant,
    pub(crate) next_dirs_check: Instant,
    pub(crate) next_space_check: Instant,
    pub(crate) next_inactive_fd_cleanup: Instant,
}

pub struct ChunkManager {
    pub(crate) config: ChunkServerConfig,
    pub(crate) meta: Arc<dyn IMetaServerStub>,
    pub(crate) checker: Arc<DirChecker>,
    pub(crate) state: Mutex<CmState>,
    pub(crate) null_block_checksum: u32,
    pub(crate) open_chunk_count: AtomicI64,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) shutting_down: AtomicBool,
}

impl ChunkManager {
    pub fn new(config: ChunkServerConfig, meta: Arc<dyn IMetaServerStub>) -> Result<Arc<Self>> {
        config.validate()?;
        let checker = DirChecker::new(DirCheckerSettings {
            lock_file_name: config.dir_lock_name.clone(),
            dont_use_names: vec![config.evacuate_done_file_name.clone()],
            sub_dirs: vec![
                config.dirty_chunks_dir.clone(),
                config.stale_chunks_dir.clone(),
            ],
            interval: Duration::from_secs(config.dir_recheck_interval_secs),
        });
        let dirs = config
            .chunk_dirs
            .iter()
            .map(|d| ChunkDirInfo::new(d.clone()))
            .collect();
        let now = Instant::now();
        let null_block_checksum = null_block_checksum(config.checksum_block_size as usize);
        Ok(Arc::new(Self {
            null_block_checksum,
            checker,
            meta,
            state: Mutex::new(CmState {
                arena: ChunkArena::new(),
                table: HashMap::new(),
                dirs,
                pending_writes: PendingWriteTable::new(),
                leases: LeaseClerk::new(),
                used_space: 0,
                next_write_id: 1,
                stale_ops_in_flight: 0,
                next_checkpoint: now,
                next_dirs_check: now,
                next_space_check: now,
                next_inactive_fd_cleanup: now,
            }),
            open_chunk_count: AtomicI64::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
            shutting_down: AtomicBool::new(false),
            config,
        }))
    }

    /// Seed the placement draw; tests use this for reproducibility.
    pub fn seed_placement(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    pub fn config(&self) -> &ChunkServerConfig {
        &self.config
    }

    pub fn dir_checker(&self) -> Arc<DirChecker> {
        Arc::clone(&self.checker)
    }

    /// Bring the engine up: probe directories, restore surviving chunks,
    /// and schedule evacuation for directories carrying the sentinel.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for dir in &self.config.chunk_dirs {
            self.checker.add(dir.clone());
        }
        let checker = Arc::clone(&self.checker);
        let available = tokio::task::spawn_blocking(move || checker.start())
            .await
            .map_err(|e| Status::with_message(StatusCode::OS_ERROR, e.to_string()))?;

        let mut usable = 0;
        {
            let st = &mut *self.state.lock();
            for dir_index in 0..st.dirs.len() {
                let dirname = st.dirs[dir_index].dirname.clone();
                match available.get(&dirname) {
                    Some(_) => usable += 1,
                    None => {
                        info!(dir = %dirname.display(), "not using chunk directory");
                        st.dirs[dir_index].available_space = -1;
                    }
                }
            }
        }
        if usable == 0 {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                "no usable chunk directories",
            );
        }
        let mut admitted: Vec<(PathBuf, AvailableDir)> = available.into_iter().collect();
        admitted.sort_by(|a, b| a.0.cmp(&b.0));
        {
            let st = &mut *self.state.lock();
            for (dirname, avail) in admitted {
                let Some(dir_index) =
                    st.dirs.iter().position(|d| d.dirname == dirname)
                else {
                    continue;
                };
                self.admit_dir(st, dir_index, avail);
            }
            st.update_count_fs_space_flags();
        }

        let evacuate_dirs = self.restore().await?;
        self.get_fs_space_available().await;
        for dir_index in evacuate_dirs {
            {
                let st = &mut *self.state.lock();
                if !st.dirs[dir_index].is_in_use() {
                    continue;
                }
                st.dirs[dir_index].evacuate_flag = true;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move { this.schedule_evacuate(dir_index, -1).await });
        }
        self.checker.set_remove_files(self.config.cleanup_chunk_dirs);
        Ok(())
    }

    pub(crate) fn admit_dir(&self, st: &mut CmState, dir_index: usize, avail: AvailableDir) {
        let dir = &mut st.dirs[dir_index];
        dir.available_space = 0;
        dir.total_space = 0;
        dir.used_space = 0;
        dir.device_id = avail.device_id;
        dir.dir_lock = Some(avail.lock);
        dir.corrupted_chunks_count = 0;
        dir.evacuate_check_io_errors_count = 0;
        dir.disk_queue = Some(DiskQueue::new(
            dir.dirname.clone(),
            self.config.disk_op_timeout(),
        ));
        info!(
            dir = %dir.dirname.display(),
            device = %dir.device_id,
            "chunk directory in use"
        );
    }

    // -- paths ---------------------------------------------------------------

    pub(crate) fn chunk_file_name(
        file_id: FileId,
        chunk_id: ChunkId,
        version: ChunkVersion,
    ) -> String {
        format!("{}.{}.{}", file_id, chunk_id, version)
    }

    pub(crate) fn chunk_pathname_in(
        &self,
        dirname: &std::path::Path,
        stable: bool,
        file_id: FileId,
        chunk_id: ChunkId,
        version: ChunkVersion,
    ) -> PathBuf {
        let name = Self::chunk_file_name(
            file_id,
            chunk_id,
            if stable { version } else { ChunkVersion::UNSTABLE },
        );
        if stable {
            dirname.join(name)
        } else {
            dirname.join(&self.config.dirty_chunks_dir).join(name)
        }
    }

    fn chunk_pathname(&self, st: &CmState, h: &ChunkInfoHandle) -> PathBuf {
        self.chunk_pathname_as(st, h, h.stable, h.info.version)
    }

    fn chunk_pathname_as(
        &self,
        st: &CmState,
        h: &ChunkInfoHandle,
        stable: bool,
        version: ChunkVersion,
    ) -> PathBuf {
        self.chunk_pathname_in(
            &st.dirs[h.dir_index].dirname,
            stable,
            h.info.file_id,
            h.info.chunk_id,
            version,
        )
    }

    fn stale_chunk_pathname(&self, st: &CmState, h: &ChunkInfoHandle) -> PathBuf {
        st.dirs[h.dir_index]
            .dirname
            .join(&self.config.stale_chunks_dir)
            .join(Self::chunk_file_name(
                h.info.file_id,
                h.info.chunk_id,
                h.info.version,
            ))
    }

    fn dir_queue(&self, st: &CmState, dir_index: usize) -> Result<Arc<DiskQueue>> {
        st.dirs[dir_index]
            .disk_queue
            .clone()
            .ok_or_else(|| Status::with_message(ChunkCode::NO_SUCH_DIR, "directory not in use"))
    }

    // -- placement -------------------------------------------------------

    /// Pick a directory for a new chunk: weighted random over available
    /// space, after eliminating full, evacuating, and I/O-saturated
    /// directories.
    pub(crate) fn get_dir_for_chunk(&self, st: &mut CmState) -> Option<usize> {
        let mut total_free: i64 = 0;
        let mut max_free: i64 = 0;
        let mut dir_count = 0usize;
        let mut total_pending_read: i64 = 0;
        let mut total_pending_write: i64 = 0;
        let mut first: Option<usize> = None;

        let read_weight = self.config.chunk_placement_pending_read_weight;
        let write_weight = self.config.chunk_placement_pending_write_weight;
        let io_weighted = read_weight > 0.0 || write_weight > 0.0;

        let mut pending: Vec<i64> = vec![0; st.dirs.len()];
        for (i, dir) in st.dirs.iter_mut().enumerate() {
            dir.placement_skip = true;
            if !dir.is_in_use() || dir.evacuate_started {
                continue;
            }
            let space = dir.available_space;
            if space < self.config.min_fs_available_space
                || (space as f64)
                    <= dir.total_space as f64 * self.config.max_space_utilization_threshold
            {
                continue;
            }
            dir.placement_skip = false;
            dir_count += 1;
            total_free += space;
            if first.is_none() {
                first = Some(i);
            }
            max_free = max_free.max(space);
            if io_weighted {
                if let Some(q) = &dir.disk_queue {
                    pending[i] = (q.pending_read_bytes() as f64 * read_weight
                        + q.pending_write_bytes() as f64 * write_weight)
                        as i64;
                    total_pending_read += q.pending_read_bytes();
                    total_pending_write += q.pending_write_bytes();
                }
            }
        }
        if dir_count == 0 || total_free <= 0 {
            return None;
        }
        if dir_count == 1 {
            return first;
        }

        if io_weighted {
            // Exclude directories above the pending-I/O budget; remember
            // the least-loaded of the excluded ones as a fallback.
            let max_pending_io = self.config.min_pending_io_threshold.max(
                ((total_pending_read as f64 * read_weight
                    + total_pending_write as f64 * write_weight)
                    / dir_count as f64) as i64,
            );
            let mut min_io_dir: Option<usize> = None;
            for i in 0..st.dirs.len() {
                if st.dirs[i].placement_skip {
                    continue;
                }
                if pending[i] > max_pending_io {
                    if min_io_dir.map(|m| pending[i] < pending[m]).unwrap_or(true) {
                        min_io_dir = Some(i);
                    }
                    st.dirs[i].placement_skip = true;
                    dir_count -= 1;
                    if dir_count == 0 {
                        return min_io_dir;
                    }
                    total_free -= st.dirs[i].available_space;
                    if st.dirs[i].available_space == max_free {
                        max_free = -1;
                    }
                }
            }
        }

        if max_free < 0 {
            max_free = st
                .dirs
                .iter()
                .filter(|d| !d.placement_skip)
                .map(|d| d.available_space)
                .max()
                .unwrap_or(0);
        }

        let mut min_avail: i64 = 0;
        if self.config.max_placement_space_ratio > 0.0 {
            min_avail = (max_free as f64 * self.config.max_placement_space_ratio) as i64;
            for dir in st.dirs.iter().filter(|d| !d.placement_skip) {
                if dir.available_space < min_avail {
                    total_free += min_avail - dir.available_space;
                }
            }
        }
        if total_free <= 0 {
            return None;
        }

        let rand_val: f64 = self.rng.lock().gen();
        let space_weight = 1.0 / total_free as f64;
        let mut cur = 0.0;
        let mut chosen = None;
        for (i, dir) in st.dirs.iter().enumerate() {
            if dir.placement_skip {
                continue;
            }
            chosen = Some(i);
            cur += min_avail.max(dir.available_space) as f64 * space_weight;
            if rand_val < cur {
                break;
            }
        }
        chosen
    }

    // -- lookup helpers ----------------------------------------------------

    fn lookup(&self, st: &CmState, chunk_id: ChunkId) -> Result<SlotId> {
        st.table
            .get(&chunk_id)
            .copied()
            .ok_or_else(|| Status::with_message(ChunkCode::NO_SUCH_CHUNK, "no such chunk"))
    }

    fn verify_version(
        &self,
        st: &CmState,
        slot: SlotId,
        version: ChunkVersion,
    ) -> Result<()> {
        let h = st.arena.get(slot).expect("verify_version: live slot");
        if h.version_matches(version) {
            Ok(())
        } else {
            make_error_msg(
                ChunkCode::BAD_CHUNK_VERSION,
                format!(
                    "version mismatch: have {} asked {}",
                    h.info.version, version
                ),
            )
        }
    }

    pub fn has_chunk(&self, chunk_id: ChunkId) -> bool {
        self.state.lock().table.contains_key(&chunk_id)
    }

    pub fn chunk_version(&self, chunk_id: ChunkId) -> Option<ChunkVersion> {
        let st = self.state.lock();
        let slot = *st.table.get(&chunk_id)?;
        st.arena.get(slot).map(|h| h.info.version)
    }

    pub fn chunk_size(&self, chunk_id: ChunkId) -> Option<u64> {
        let st = self.state.lock();
        let slot = *st.table.get(&chunk_id)?;
        st.arena.get(slot).map(|h| h.info.size)
    }

    /// Snapshot of a chunk's metadata.
    pub fn chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let st = self.state.lock();
        let slot = *st.table.get(&chunk_id)?;
        st.arena.get(slot).map(|h| h.info.clone())
    }

    pub fn is_chunk_stable(&self, chunk_id: ChunkId) -> bool {
        let st = self.state.lock();
        let Some(&slot) = st.table.get(&chunk_id) else {
            return true;
        };
        let Some(h) = st.arena.get(slot) else {
            return true;
        };
        h.stable
            && !h.appender_owns
            && !st.pending_writes.is_write_pending(chunk_id)
            && !h.being_replicated
    }

    pub fn is_write_pending(&self, chunk_id: ChunkId) -> bool {
        self.state.lock().pending_writes.is_write_pending(chunk_id)
    }

    /// Checksum of the block containing `offset`, if the chunk is known
    /// and its checksums are loaded.
    pub fn get_checksum(&self, chunk_id: ChunkId, offset: u64) -> Option<u32> {
        let st = self.state.lock();
        let slot = *st.table.get(&chunk_id)?;
        let h = st.arena.get(slot)?;
        let sums = h.info.block_checksums.as_ref()?;
        let block = (offset / self.config.checksum_block_size) as usize;
        sums.get(block.min(sums.len().saturating_sub(1))).copied()
    }

    /// Checksums of every block overlapping `[offset, offset + num_bytes)`.
    pub fn get_checksums(&self, chunk_id: ChunkId, offset: u64, num_bytes: u64) -> Vec<u32> {
        let st = self.state.lock();
        let Some(&slot) = st.table.get(&chunk_id) else {
            return Vec::new();
        };
        let Some(h) = st.arena.get(slot) else {
            return Vec::new();
        };
        let Some(sums) = h.info.block_checksums.as_ref() else {
            return Vec::new();
        };
        let block_size = self.config.checksum_block_size;
        let first = (offset / block_size) as usize;
        let last = ((offset + num_bytes + block_size - 1) / block_size) as usize;
        sums[first.min(sums.len())..last.min(sums.len())].to_vec()
    }

    /// Inventory report for the meta server, partitioned by stability.
    /// Rename-in-flight chunks are reported at their target state so the
    /// meta server does not misread an in-commit chunk as stale.
    pub fn hosted_chunks(&self) -> HostedChunksReport {
        let st = self.state.lock();
        let mut report = HostedChunksReport::default();
        for (&chunk_id, &slot) in &st.table {
            let Some(h) = st.arena.get(slot) else {
                die("hosted chunks: table entry without handle");
            };
            if h.being_replicated {
                continue;
            }
            let (stable, version) = if h.is_rename_in_flight() {
                h.target_state()
            } else {
                (h.stable, h.info.version)
            };
            let entry = HostedChunkEntry {
                file_id: h.info.file_id,
                chunk_id,
                version,
                size: h.info.size,
            };
            let stable_now = stable
                && !h.appender_owns
                && !st.pending_writes.is_write_pending(chunk_id);
            if stable_now {
                report.stable.push(entry);
            } else if h.appender_owns {
                report.not_stable_append.push(entry);
            } else {
                report.not_stable.push(entry);
            }
        }
        report
    }

    pub fn used_space(&self) -> i64 {
        self.state.lock().used_space
    }

    pub fn open_chunks(&self) -> i64 {
        self.open_chunk_count.load(Ordering::Relaxed)
    }

    /// Space accounting summary; total space counts each device once and
    /// is capped by the configured node ceiling.
    pub fn total_space(&self) -> SpaceInfo {
        let st = self.state.lock();
        st.total_space_info(&self.config)
    }

    // -- allocation --------------------------------------------------------

    /// Allocate a new chunk (or re-admit a write to an existing unstable
    /// one at the same version). The file is created under `dirty/`.
    pub async fn alloc_chunk(
        self: &Arc<Self>,
        file_id: FileId,
        chunk_id: ChunkId,
        version: ChunkVersion,
        being_replicated: bool,
        must_exist: bool,
    ) -> Result<()> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return make_error(StatusCode::SHUTTING_DOWN);
        }
        let (slot, path, queue) = {
            let st = &mut *self.state.lock();
            if let Some(&slot) = st.table.get(&chunk_id) {
                if being_replicated {
                    return make_error_msg(
                        ChunkCode::CHUNK_EXISTS,
                        "chunk exists, cannot replicate over it",
                    );
                }
                let h = st.arena.get(slot).expect("alloc: table entry");
                if h.being_replicated
                    || h.stable
                    || h.appender_owns
                    || h.info.version != version
                {
                    return make_error_msg(ChunkCode::CHUNK_EXISTS, "chunk exists");
                }
                return Ok(());
            }
            if must_exist {
                return make_error(ChunkCode::NO_SUCH_CHUNK);
            }
            let Some(dir_index) = self.get_dir_for_chunk(st) else {
                info!(%chunk_id, "no directory has space to host chunk");
                return make_error(ChunkCode::NO_SPACE);
            };
            let mut info = ChunkInfo::new(file_id, chunk_id, version);
            info.init_checksums(self.config.max_blocks());
            let mut handle = ChunkInfoHandle::new(info, dir_index, false);
            handle.being_replicated = being_replicated;
            handle.meta_dirty = true;
            let slot = st.arena.insert(handle);
            st.table.insert(chunk_id, slot);
            st.add_to_dir_live(slot);
            let h = st.arena.get(slot).unwrap();
            let path = self.chunk_pathname(st, h);
            let queue = self.dir_queue(st, dir_index)?;
            info!(%chunk_id, path = %path.display(), "creating chunk");
            (slot, path, queue)
        };

        self.cleanup_inactive_fds(false).await;
        match queue.open(path, true).await {
            Ok(file) => {
                let st = &mut *self.state.lock();
                if let Some(h) = st.arena.get_mut(slot) {
                    h.data_file = Some(file);
                    self.open_chunk_count.fetch_add(1, Ordering::Relaxed);
                    st.lru_update(slot);
                }
                Ok(())
            }
            Err(e) => {
                error!(%chunk_id, error = %e, "failed to create chunk file");
                self.open_failed(slot, chunk_id, &e).await;
                Err(e)
            }
        }
    }

    /// Allocate a chunk owned by the record-append coordinator.
    pub async fn alloc_chunk_for_append(
        self: &Arc<Self>,
        file_id: FileId,
        chunk_id: ChunkId,
        version: ChunkVersion,
        must_exist: bool,
    ) -> Result<()> {
        if self.is_write_pending(chunk_id) {
            return make_error_msg(
                ChunkCode::APPEND_MODE_MISMATCH,
                "random write in progress",
            );
        }
        self.alloc_chunk(file_id, chunk_id, version, false, must_exist)
            .await?;
        let st = &mut *self.state.lock();
        if let Ok(slot) = self.lookup(st, chunk_id) {
            let h = st.arena.get_mut(slot).unwrap();
            h.appender_owns = true;
            st.lru_update(slot);
        }
        Ok(())
    }

    async fn open_failed(self: &Arc<Self>, slot: SlotId, chunk_id: ChunkId, err: &Status) {
        if err.is_transient() {
            return;
        }
        // Unable to open or create the file: tell the meta server the
        // data is gone so it can re-replicate, then drop the handle.
        let req = {
            let st = &mut *self.state.lock();
            let Some(h) = st.arena.get(slot) else { return };
            let req = CorruptChunkReq {
                file_id: h.info.file_id,
                chunk_id,
                is_lost: true,
                ..Default::default()
            };
            st.leases.unregister(chunk_id);
            st.erase_chunk(slot, chunk_id);
            st.free_handle(slot);
            req
        };
        self.send_corrupt_notification(req);
    }

    // -- open / close --------------------------------------------------------

    /// Open the chunk file if it is closed; returns the shared handle.
    pub(crate) async fn ensure_open(
        self: &Arc<Self>,
        slot: SlotId,
        create: bool,
    ) -> Result<Arc<crate::disk_io::ChunkFile>> {
        let (path, queue) = {
            let st = &mut *self.state.lock();
            let Some(h) = st.arena.get(slot) else {
                return make_error(ChunkCode::NO_SUCH_CHUNK);
            };
            if let Some(file) = &h.data_file {
                return Ok(Arc::clone(file));
            }
            let path = self.chunk_pathname(st, h);
            let queue = self.dir_queue(st, h.dir_index)?;
            (path, queue)
        };
        self.cleanup_inactive_fds(false).await;
        let chunk_id = {
            let st = self.state.lock();
            st.arena.get(slot).map(|h| h.info.chunk_id)
        };
        let Some(chunk_id) = chunk_id else {
            return make_error(ChunkCode::NO_SUCH_CHUNK);
        };
        match queue.open(path, create).await {
            Ok(file) => {
                let st = &mut *self.state.lock();
                let Some(h) = st.arena.get_mut(slot) else {
                    return make_error(ChunkCode::NO_SUCH_CHUNK);
                };
                if let Some(existing) = &h.data_file {
                    // Lost the race with another opener; use theirs.
                    return Ok(Arc::clone(existing));
                }
                h.data_file = Some(Arc::clone(&file));
                self.open_chunk_count.fetch_add(1, Ordering::Relaxed);
                st.lru_update(slot);
                Ok(file)
            }
            Err(e) => {
                warn!(%chunk_id, error = %e, "failed to open chunk file");
                self.open_failed(slot, chunk_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn open_chunk(self: &Arc<Self>, chunk_id: ChunkId) -> Result<()> {
        let slot = {
            let st = self.state.lock();
            self.lookup(&st, chunk_id)?
        };
        self.ensure_open(slot, false).await.map(|_| ())
    }

    /// Close an idle chunk, flushing dirty metadata first.
    pub async fn close_chunk(self: &Arc<Self>, chunk_id: ChunkId) -> Result<()> {
        let (slot, dirty) = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            let h = st.arena.get(slot).unwrap();
            if !h.is_file_open() {
                return Ok(());
            }
            if h.writes_in_flight > 0 || h.has_meta_ops() {
                return make_error_msg(ChunkCode::SERVER_BUSY, "chunk has I/O in flight");
            }
            (slot, h.meta_dirty)
        };
        if dirty {
            self.write_chunk_metadata(chunk_id, false).await?;
        }
        let st = &mut *self.state.lock();
        if st.arena.get(slot).is_some() {
            self.release_handle(st, slot);
        }
        Ok(())
    }

    /// Drop the open file handle and unload checksums; the handle stays
    /// in the table.
    pub(crate) fn release_handle(&self, st: &mut CmState, slot: SlotId) {
        let Some(h) = st.arena.get_mut(slot) else { return };
        h.info.unload_checksums();
        if h.data_file.take().is_some() {
            self.open_chunk_count.fetch_sub(1, Ordering::Relaxed);
        }
        let chunk_id = h.info.chunk_id;
        debug!(%chunk_id, "closing chunk");
        st.leases.relinquish(chunk_id);
        if st
            .arena
            .get(slot)
            .map(|h| h.global_list == GlobalListKind::Lru)
            .unwrap_or(false)
        {
            st.arena.set_global_list(slot, GlobalListKind::None);
        }
    }

    // -- metadata read (header load) ----------------------------------------

    /// Load the chunk header (per-block checksums) from disk. Concurrent
    /// callers share a single read.
    pub async fn read_chunk_metadata(self: &Arc<Self>, chunk_id: ChunkId) -> Result<()> {
        let rx_or_start = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            let h = st.arena.get_mut(slot).unwrap();
            if h.being_replicated {
                return make_error_msg(
                    ChunkCode::REPLICATION_IN_FLIGHT,
                    "chunk replication in flight",
                );
            }
            if h.info.checksums_loaded() {
                st.lru_update(slot);
                return Ok(());
            }
            if h.read_meta_in_flight {
                let (tx, rx) = oneshot::channel();
                h.read_meta_waiters.push(tx);
                Err(rx)
            } else {
                h.read_meta_in_flight = true;
                Ok(slot)
            }
        };

        let slot = match rx_or_start {
            Err(rx) => {
                return rx.await.unwrap_or_else(|_| {
                    make_error_msg(ChunkCode::NO_SUCH_CHUNK, "chunk went away during header read")
                });
            }
            Ok(slot) => slot,
        };

        let result = self.read_header_from_disk(slot).await;

        // Wake waiters and clear the in-flight marker.
        let (waiters, failed_slot) = {
            let st = &mut *self.state.lock();
            match st.arena.get_mut(slot) {
                Some(h) => {
                    h.read_meta_in_flight = false;
                    let waiters = std::mem::take(&mut h.read_meta_waiters);
                    st.lru_update(slot);
                    (waiters, result.is_err().then_some(slot))
                }
                None => (Vec::new(), None),
            }
        };
        for tx in waiters {
            let _ = tx.send(result.clone().map(|_| ()));
        }
        if let (Some(slot), Err(e)) = (failed_slot, &result) {
            if !e.is_transient() {
                if self.config.abort_on_checksum_mismatch
                    && e.code() == ChunkCode::BAD_HEADER_CHECKSUM
                {
                    die(format!("chunk header checksum mismatch: {}", e));
                }
                self.chunk_io_failed(slot, false).await;
            }
        }
        result
    }

    async fn read_header_from_disk(self: &Arc<Self>, slot: SlotId) -> Result<()> {
        let file = self.ensure_open(slot, false).await?;
        let (queue, expected_id, expected_version, stable) = {
            let st = &*self.state.lock();
            let Some(h) = st.arena.get(slot) else {
                return make_error(ChunkCode::NO_SUCH_CHUNK);
            };
            (
                self.dir_queue(st, h.dir_index)?,
                h.info.chunk_id,
                h.info.version,
                h.stable,
            )
        };
        let header_size = self.config.chunk_header_size as usize;
        let buf = queue.pread(Arc::clone(&file), 0, header_size).await?;
        if buf.len() < header_size {
            return make_error_msg(
                ChunkCode::IO_ERROR,
                format!("short chunk header read: {} bytes", buf.len()),
            );
        }
        let dci = DiskChunkInfo::parse(
            &buf,
            self.config.max_blocks(),
            self.config.require_chunk_header_checksum,
        )?;
        dci.validate(
            expected_id,
            if stable {
                expected_version
            } else {
                ChunkVersion::UNSTABLE
            },
        )?;

        let st = &mut *self.state.lock();
        let Some(h) = st.arena.get_mut(slot) else {
            return make_error(ChunkCode::NO_SUCH_CHUNK);
        };
        if h.open_file_id() != Some(file.id()) {
            return make_error_msg(ChunkCode::IO_TRY_AGAIN, "stale chunk header read");
        }
        let mut sums = dci.block_checksums;
        sums.resize(self.config.max_blocks(), 0);
        h.info.block_checksums = Some(sums);
        if h.info.size > dci.size {
            // The file tail past the recorded size never committed.
            let extra = (h.info.size - dci.size) as i64;
            h.info.size = dci.size;
            st.adjust_space(slot, -extra);
        } else if h.info.size != dci.size {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!(
                    "chunk metadata size mismatch: file {} header {}",
                    h.info.size, dci.size
                ),
            );
        }
        Ok(())
    }

    // -- metadata write pipeline ----------------------------------------------

    fn serialize_header(
        &self,
        h: &ChunkInfoHandle,
        header_version: ChunkVersion,
    ) -> Result<Vec<u8>> {
        let Some(sums) = h.info.block_checksums.as_ref() else {
            return make_error_msg(
                ChunkCode::CHECKSUMS_NOT_LOADED,
                "checksums are not loaded",
            );
        };
        DiskChunkInfo {
            file_id: h.info.file_id,
            chunk_id: h.info.chunk_id,
            version: header_version,
            size: h.info.size,
            block_checksums: sums.clone(),
        }
        .serialize(self.config.chunk_header_size as usize)
    }

    /// Queue a metadata mutation: an optional header rewrite followed by a
    /// rename committing the target version and stability. Returns a
    /// completion receiver, or `None` when the fast path applied the
    /// change synchronously.
    fn enqueue_meta_write(
        &self,
        st: &mut CmState,
        slot: SlotId,
        rename: bool,
        target_stable: bool,
        target_version: ChunkVersion,
    ) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let h = st.arena.get_mut(slot).expect("enqueue_meta_write: live slot");
        if h.stale || h.delete_pending {
            return make_error_msg(ChunkCode::NO_SUCH_CHUNK, "chunk is being deleted");
        }

        // Fast path: unstable chunk staying unstable with only the version
        // changing, nothing queued, nothing in flight. The on-disk name of
        // an unstable chunk does not encode the version, so this is a pure
        // in-memory update.
        if target_version > ChunkVersion::UNSTABLE
            && h.info.version != target_version
            && h.writes_in_flight == 0
            && !h.stable
            && !target_stable
            && !h.has_meta_ops()
            && h.is_file_open()
        {
            h.meta_dirty = true;
            h.info.version = target_version;
            st.lru_update(slot);
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        if rename {
            // Header first, so the on-disk header matches either the pre-
            // or post-rename state, never a third one.
            h.meta_dirty = true;
            let header_version = if target_stable {
                target_version
            } else {
                ChunkVersion::UNSTABLE
            };
            let header = self.serialize_header(h, header_version)?;
            h.meta_dirty = false;
            h.push_meta_op(MetaOp {
                kind: MetaOpKind::WriteHeader {
                    header: Some(header),
                },
                done: None,
            });
            h.push_meta_op(MetaOp {
                kind: MetaOpKind::Rename {
                    target_version,
                    target_stable,
                },
                done: Some(tx),
            });
        } else if h.meta_dirty {
            let header_version = if h.stable {
                h.info.version
            } else {
                ChunkVersion::UNSTABLE
            };
            let header = self.serialize_header(h, header_version)?;
            h.meta_dirty = false;
            h.push_meta_op(MetaOp {
                kind: MetaOpKind::WriteHeader {
                    header: Some(header),
                },
                done: Some(tx),
            });
        } else if h.has_meta_ops() {
            // Nothing to write, but completion must order after the ops
            // already queued.
            h.push_meta_op(MetaOp {
                kind: MetaOpKind::WriteHeader { header: None },
                done: Some(tx),
            });
        } else {
            let _ = tx.send(Ok(()));
            return Ok(Some(rx));
        }
        st.lru_update(slot);
        Ok(Some(rx))
    }

    /// Spawn [`Self::drive_meta_queue`] as a background task.
    ///
    /// Boxed explicitly: `drive_meta_queue` transitively awaits
    /// `write_chunk_metadata`, which itself spawns `drive_meta_queue`,
    /// so an unboxed call here makes the Send auto-trait check
    /// self-referential and unprovable to rustc.
    pub(crate) fn spawn_drive_meta_queue(self: &Arc<Self>, slot: SlotId) {
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(Arc::clone(self).drive_meta_queue(slot));
        tokio::spawn(fut);
    }

    /// Run the metadata-op queue of one handle until it drains or blocks
    /// on in-flight data writes. Only one driver runs per handle.
    pub(crate) async fn drive_meta_queue(self: Arc<Self>, slot: SlotId) {
        loop {
            enum Step {
                WriteHeader(Arc<DiskQueue>, Vec<u8>),
                Barrier,
                Rename(Arc<DiskQueue>, PathBuf, PathBuf),
                ElidedRename,
                Drained(bool),
            }
            let step = {
                let st = &mut *self.state.lock();
                let queue_empty = {
                    let Some(h) = st.arena.get_mut(slot) else { return };
                    if h.meta_op_running {
                        return;
                    }
                    if h.meta_op_queue.is_empty() {
                        true
                    } else if h.writes_in_flight > 0 {
                        h.wait_for_writes = true;
                        return;
                    } else {
                        h.meta_op_running = true;
                        false
                    }
                };
                if queue_empty {
                    Step::Drained(self.meta_queue_drained(st, slot))
                } else {
                    let h = st.arena.get(slot).unwrap();
                    match &h.meta_op_queue.front().unwrap().kind {
                        MetaOpKind::WriteHeader { header: None } => Step::Barrier,
                        MetaOpKind::WriteHeader {
                            header: Some(header),
                        } => match self.dir_queue(st, h.dir_index) {
                            Ok(q) => Step::WriteHeader(q, header.clone()),
                            Err(_) => Step::Barrier,
                        },
                        MetaOpKind::Rename {
                            target_version,
                            target_stable,
                        } => {
                            let (target_version, target_stable) =
                                (*target_version, *target_stable);
                            if !h.rename_needed(target_stable, target_version) {
                                Step::ElidedRename
                            } else {
                                let src = self.chunk_pathname(st, h);
                                let dst =
                                    self.chunk_pathname_as(st, h, target_stable, target_version);
                                match self.dir_queue(st, h.dir_index) {
                                    Ok(q) => Step::Rename(q, src, dst),
                                    Err(_) => Step::ElidedRename,
                                }
                            }
                        }
                    }
                }
            };

            let result: Result<()> = match step {
                Step::Drained(moved) => {
                    if moved {
                        self.run_stale_queue(false);
                    }
                    return;
                }
                Step::Barrier | Step::ElidedRename => Ok(()),
                Step::WriteHeader(queue, header) => match self.ensure_open(slot, false).await {
                    Ok(file) => queue.pwrite(file, 0, header).await.map(|_| ()),
                    Err(e) => Err(e),
                },
                Step::Rename(queue, src, dst) => queue.rename(src, dst).await,
            };

            // Completion: re-validate and apply.
            let failed = {
                let st = &mut *self.state.lock();
                let Some(h) = st.arena.get_mut(slot) else { return };
                h.meta_op_running = false;
                let Some(op) = h.meta_op_queue.pop_front() else {
                    die("meta op queue drained under a running op");
                };
                let is_rename = matches!(op.kind, MetaOpKind::Rename { .. });
                if is_rename {
                    if h.renames_in_flight == 0 {
                        die("rename completion without renames in flight");
                    }
                    h.renames_in_flight -= 1;
                }
                match &result {
                    Ok(()) => {
                        if let MetaOpKind::Rename {
                            target_version,
                            target_stable,
                        } = op.kind
                        {
                            h.commit_rename(target_stable, target_version);
                        }
                        h.touch();
                        if let Some(done) = op.done {
                            let _ = done.send(Ok(()));
                        }
                        st.lru_update(slot);
                        None
                    }
                    Err(e) => {
                        warn!(
                            chunk_id = %h.info.chunk_id,
                            error = %e,
                            "chunk metadata op failed"
                        );
                        if let Some(done) = op.done {
                            let _ = done.send(Err(e.clone()));
                        }
                        if e.is_transient() {
                            // Transient failures do not evict; queued ops
                            // behind this one still run.
                            st.lru_update(slot);
                            None
                        } else {
                            // Fail everything queued behind with the same
                            // error.
                            let mut drained = std::mem::take(&mut h.meta_op_queue);
                            for queued in drained.drain(..) {
                                if matches!(queued.kind, MetaOpKind::Rename { .. }) {
                                    h.renames_in_flight -= 1;
                                }
                                if let Some(done) = queued.done {
                                    let _ = done.send(Err(e.clone()));
                                }
                            }
                            let evict = !h.stale && !h.delete_pending && !h.being_replicated;
                            Some(evict)
                        }
                    }
                }
            };

            match failed {
                Some(true) => {
                    self.chunk_io_failed(slot, false).await;
                    return;
                }
                Some(false) => {
                    let moved = {
                        let st = &mut *self.state.lock();
                        st.arena.get(slot).is_some() && self.meta_queue_drained(st, slot)
                    };
                    if moved {
                        self.run_stale_queue(false);
                    }
                    return;
                }
                None => {}
            }
        }
    }

    /// Called with the queue empty: a pending-stale handle can now join
    /// the stale queue proper. Returns true when a handle moved and the
    /// stale queue should run.
    fn meta_queue_drained(&self, st: &mut CmState, slot: SlotId) -> bool {
        let Some(h) = st.arena.get(slot) else {
            return false;
        };
        if h.stale && h.global_list == GlobalListKind::PendingStale {
            st.arena.set_global_list(slot, GlobalListKind::Stale);
            return true;
        }
        false
    }

    /// Flush dirty metadata (or force a rewrite) to the chunk header.
    pub async fn write_chunk_metadata(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        force: bool,
    ) -> Result<()> {
        let rx = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            if force {
                st.arena.get_mut(slot).unwrap().meta_dirty = true;
            }
            let rx =
                self.enqueue_meta_write(st, slot, false, false, ChunkVersion::UNSTABLE)?;
            (rx, slot)
        };
        let (Some(rx), slot) = rx else {
            return Ok(());
        };
        self.spawn_drive_meta_queue(slot);
        rx.await
            .unwrap_or_else(|_| make_error_msg(ChunkCode::NO_SUCH_CHUNK, "chunk went away"))
    }

    /// Change the chunk version, optionally committing stability.
    pub async fn change_chunk_vers(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        target_version: ChunkVersion,
        target_stable: bool,
    ) -> Result<()> {
        let rx = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            let h = st.arena.get(slot).unwrap();
            if h.being_replicated {
                return make_error_msg(
                    ChunkCode::REPLICATION_IN_FLIGHT,
                    "chunk replication in flight",
                );
            }
            info!(
                %chunk_id,
                from = %h.info.version,
                to = %target_version,
                stable = target_stable,
                "changing chunk version"
            );
            let rx = self.enqueue_meta_write(st, slot, true, target_stable, target_version)?;
            (rx, slot)
        };
        let (Some(rx), slot) = rx else {
            return Ok(());
        };
        self.spawn_drive_meta_queue(slot);
        rx.await
            .unwrap_or_else(|_| make_error_msg(ChunkCode::NO_SUCH_CHUNK, "chunk went away"))
    }

    /// Commit a chunk: rename out of `dirty/` to its version-bearing
    /// stable name. Idempotent for an already-stable chunk at the target
    /// version.
    pub async fn make_chunk_stable(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        version: ChunkVersion,
        append_flag: bool,
    ) -> Result<()> {
        // Make sure checksums are loaded; the header write needs them.
        {
            let needs_load = {
                let st = self.state.lock();
                let slot = self.lookup(&st, chunk_id)?;
                !st.arena.get(slot).unwrap().info.checksums_loaded()
            };
            if needs_load {
                self.read_chunk_metadata(chunk_id).await?;
            }
        }
        let rx = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            let h = st.arena.get(slot).unwrap();
            if h.is_rename_in_flight() {
                let (target_stable, target_version) = h.target_state();
                if version != target_version {
                    return make_error_msg(
                        ChunkCode::STABLE_TARGET_MISMATCH,
                        format!(
                            "{}stable target version mismatch",
                            if target_stable { "" } else { "not " }
                        ),
                    );
                }
            } else if h.info.version != version {
                return make_error_msg(ChunkCode::BAD_CHUNK_VERSION, "version mismatch");
            }
            if h.being_replicated {
                return make_error_msg(
                    ChunkCode::REPLICATION_IN_FLIGHT,
                    "chunk replication in flight",
                );
            }
            if append_flag != h.appender_owns {
                return make_error_msg(
                    ChunkCode::APPEND_MODE_MISMATCH,
                    "make stable append-mode mismatch",
                );
            }
            if h.stable && h.info.version == version && !h.has_meta_ops() && !h.meta_dirty {
                // Already committed at this version; nothing touches disk.
                return Ok(());
            }
            if !st.pending_writes.delete(chunk_id, h.info.version) {
                die(format!(
                    "make stable failed to cleanup pending writes: chunk {} version {}",
                    chunk_id, h.info.version
                ));
            }
            info!(%chunk_id, %version, "making chunk stable");
            let rx = self.enqueue_meta_write(st, slot, true, true, version)?;
            (rx, slot)
        };
        let (Some(rx), slot) = rx else {
            return Ok(());
        };
        self.spawn_drive_meta_queue(slot);
        rx.await
            .unwrap_or_else(|_| make_error_msg(ChunkCode::NO_SUCH_CHUNK, "chunk went away"))
    }

    // -- write-id table ----------------------------------------------------

    /// Reserve a write-id for follow-up writes to an unstable chunk.
    pub fn allocate_write_id(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        offset: u64,
        num_bytes: u64,
        for_record_append: bool,
    ) -> Result<WriteId> {
        let st = &mut *self.state.lock();
        let slot = self.lookup(st, chunk_id)?;
        let h = st.arena.get(slot).unwrap();
        if h.info.version != version {
            return make_error_msg(ChunkCode::BAD_CHUNK_VERSION, "chunk version mismatch");
        }
        if for_record_append {
            if st.pending_writes.is_write_pending(chunk_id) {
                return make_error_msg(
                    ChunkCode::APPEND_MODE_MISMATCH,
                    "random write in progress",
                );
            }
            if !h.appender_owns {
                return make_error_msg(ChunkCode::APPEND_MODE_MISMATCH, "not open for append");
            }
        } else {
            if h.appender_owns {
                return make_error_msg(
                    ChunkCode::APPEND_MODE_MISMATCH,
                    "write append in progress",
                );
            }
            if h.stable {
                return make_error_msg(ChunkCode::CHUNK_STABLE, "chunk stable");
            }
            if h.is_rename_in_flight() {
                return make_error_msg(
                    ChunkCode::STATE_TRANSITION_IN_FLIGHT,
                    "chunk state transition in progress",
                );
            }
        }
        let write_id = WriteId(st.next_write_id);
        st.next_write_id += 1;
        if !for_record_append {
            st.pending_writes.insert(WriteReservation {
                write_id,
                chunk_id,
                version,
                offset,
                num_bytes,
                enqueue_time: Instant::now(),
                status: 0,
            });
        }
        Ok(write_id)
    }

    pub fn set_write_status(&self, write_id: WriteId, status: i32) {
        self.state.lock().pending_writes.set_status(write_id, status);
    }

    pub fn get_write_status(&self, write_id: WriteId) -> Result<i32> {
        self.state
            .lock()
            .pending_writes
            .get_status(write_id)
            .ok_or_else(|| Status::new(ChunkCode::NO_SUCH_WRITE_ID))
    }

    pub fn num_writable_chunks(&self) -> usize {
        self.state.lock().pending_writes.chunk_id_count()
    }

    // -- read path -----------------------------------------------------------

    /// Read `len` bytes at `offset`; the version must match the committed
    /// chunk version. Reads at or past the current size return an empty
    /// buffer.
    pub async fn read_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        version: ChunkVersion,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut retries = 0u32;
        loop {
            match self
                .read_chunk_attempt(chunk_id, version, offset, len)
                .await
            {
                Err(e)
                    if e.code() == ChunkCode::BAD_CHECKSUM
                        && retries < self.config.read_checksum_mismatch_max_retry_count =>
                {
                    retries += 1;
                    warn!(%chunk_id, try_ = retries, "read checksum mismatch, retrying");
                }
                Err(e) if e.code() == ChunkCode::BAD_CHECKSUM => {
                    if self.config.abort_on_checksum_mismatch {
                        die(format!("checksum mismatch on chunk {}", chunk_id));
                    }
                    // Evict the bad copy and tell the meta server.
                    let slot = {
                        let st = self.state.lock();
                        self.lookup(&st, chunk_id).ok()
                    };
                    if let Some(slot) = slot {
                        self.chunk_io_failed(slot, false).await;
                    }
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    async fn read_chunk_attempt(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        version: ChunkVersion,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        // The verifier needs the stored checksums.
        {
            let needs_load = {
                let st = self.state.lock();
                let slot = self.lookup(&st, chunk_id)?;
                self.verify_version(&st, slot, version)
                    .and_then(|_| {
                        let h = st.arena.get(slot).unwrap();
                        if h.info.version != version {
                            make_error_msg(
                                ChunkCode::BAD_CHUNK_VERSION,
                                "chunk version not committed",
                            )
                        } else {
                            Ok(!h.info.checksums_loaded())
                        }
                    })?
            };
            if needs_load {
                self.read_chunk_metadata(chunk_id).await?;
            }
        }

        let block_size = self.config.checksum_block_size;
        let (slot, queue, read_off, read_len, sub_off, sub_len, expected, chunk_size) = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            self.verify_version(st, slot, version)?;
            let h = st.arena.get(slot).unwrap();
            let chunk_size = h.info.size;
            if offset >= chunk_size || len == 0 {
                return Ok(Vec::new());
            }
            let len = len.min((chunk_size - offset) as usize);
            // Align to checksum block boundaries so full blocks reach the
            // verifier.
            let read_off = offset - offset % block_size;
            let end = offset + len as u64;
            let read_end = end + (block_size - end % block_size) % block_size;
            let read_len = (read_end - read_off) as usize;
            let first_block = (read_off / block_size) as usize;
            let nblocks = read_len / block_size as usize;
            let sums = h.info.block_checksums.as_ref().expect("checksums loaded");
            let expected: Vec<u32> =
                sums[first_block..(first_block + nblocks).min(sums.len())].to_vec();
            let queue = self.dir_queue(st, h.dir_index)?;
            st.lru_update(slot);
            (
                slot,
                queue,
                read_off,
                read_len,
                (offset - read_off) as usize,
                len,
                expected,
                chunk_size,
            )
        };

        let file = self.ensure_open(slot, false).await?;
        let mut buf = match queue
            .pread(
                Arc::clone(&file),
                self.config.chunk_header_size + read_off,
                read_len,
            )
            .await
        {
            Ok(buf) => buf,
            Err(e) => {
                self.report_io_failure(slot, &e).await;
                return Err(e);
            }
        };
        if buf.len() < sub_off + sub_len {
            // Shorter than the caller's range: size shrank while the read
            // was in flight (truncate race) or the device dropped data.
            let st = self.state.lock();
            let current_size = st
                .arena
                .get(slot)
                .map(|h| h.info.size)
                .unwrap_or(chunk_size);
            drop(st);
            if current_size > read_off + buf.len() as u64 {
                self.chunk_io_failed(slot, false).await;
                return make_error_msg(ChunkCode::IO_ERROR, "short chunk read");
            }
            return make_error_msg(ChunkCode::IO_TRY_AGAIN, "chunk shrank during read");
        }
        // Zero-pad so the verifier sees whole blocks.
        zero_pad(&mut buf, block_size as usize);
        let computed = compute_checksums(&buf, block_size as usize);

        {
            let st = &mut *self.state.lock();
            let Some(h) = st.arena.get(slot) else {
                return make_error(ChunkCode::NO_SUCH_CHUNK);
            };
            if h.open_file_id() != Some(file.id()) || h.info.version != version {
                return make_error_msg(ChunkCode::BAD_CHUNK_VERSION, "stale read completion");
            }
            for (i, sum) in computed.iter().enumerate() {
                let Some(&stored) = expected.get(i) else { break };
                if !block_checksum_matches(
                    stored,
                    *sum,
                    self.null_block_checksum,
                    self.config.allow_sparse_chunks,
                ) {
                    error!(
                        %chunk_id,
                        offset,
                        block = i,
                        expect = stored,
                        computed = sum,
                        "checksum mismatch"
                    );
                    return make_error_msg(ChunkCode::BAD_CHECKSUM, "checksum mismatch");
                }
                if stored == 0 && *sum == self.null_block_checksum {
                    debug!(%chunk_id, block = i, "sparse block accepted");
                }
            }
            st.lru_update(slot);
        }

        buf.drain(..sub_off);
        buf.truncate(sub_len);
        Ok(buf)
    }

    // -- write path ----------------------------------------------------------

    /// Write `data` at `offset`. Whole-block writes compute checksums
    /// directly; partial-block writes splice into existing (or zero)
    /// blocks first. Returns the number of payload bytes written.
    pub async fn write_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        version: ChunkVersion,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<usize> {
        let block_size = self.config.checksum_block_size;
        // Load checksums before mutating them.
        {
            let needs_load = {
                let st = self.state.lock();
                let slot = self.lookup(&st, chunk_id)?;
                !st.arena.get(slot).unwrap().info.checksums_loaded()
            };
            if needs_load {
                self.read_chunk_metadata(chunk_id).await?;
            }
        }

        enum WritePlan {
            Aligned,
            SpliceZero { blk_off: u64, blk_len: usize },
            ReadModify { blk_off: u64, blk_len: usize },
        }

        let (slot, queue, plan, num_bytes) = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            self.verify_version(st, slot, version)?;
            let h = st.arena.get(slot).unwrap();
            if h.stable {
                return make_error_msg(ChunkCode::CHUNK_STABLE, "write to stable chunk");
            }
            if offset >= self.config.chunk_size {
                return make_error_msg(ChunkCode::INVALID_ARG, "write past chunk size");
            }
            let num_bytes = data.len().min((self.config.chunk_size - offset) as usize);
            if num_bytes == 0 {
                return make_error_msg(ChunkCode::INVALID_ARG, "empty write");
            }
            let added = (offset + num_bytes as u64) as i64 - h.info.size as i64;
            if added > 0 && st.used_space + added >= self.config.total_space {
                error!(
                    used = st.used_space,
                    added,
                    total = self.config.total_space,
                    "out of disk space"
                );
                return make_error(ChunkCode::NO_SPACE);
            }
            let aligned =
                offset % block_size == 0 && (num_bytes as u64) % block_size == 0;
            let plan = if aligned {
                WritePlan::Aligned
            } else {
                if num_bytes as u64 >= block_size {
                    // A partial-block write must fit within its (at most
                    // two) blocks.
                    return make_error_msg(
                        ChunkCode::INVALID_ARG,
                        "misaligned write of a full block or more",
                    );
                }
                let blk_off = offset - offset % block_size;
                let in_block = (offset - blk_off) as usize;
                let blk_len = if in_block + num_bytes > block_size as usize {
                    2 * block_size as usize
                } else {
                    block_size as usize
                };
                if blk_off >= h.info.size {
                    // The target block is past EOF; treat it as zeros.
                    WritePlan::SpliceZero { blk_off, blk_len }
                } else {
                    WritePlan::ReadModify { blk_off, blk_len }
                }
            };
            let queue = self.dir_queue(st, h.dir_index)?;
            (slot, queue, plan, num_bytes)
        };

        let mut payload = data;
        payload.truncate(num_bytes);

        let file = self.ensure_open(slot, false).await?;
        let (disk_off, disk_buf, checksums, first_block) = match plan {
            WritePlan::Aligned => {
                let checksums = compute_checksums(&payload, block_size as usize);
                (
                    offset,
                    payload.clone(),
                    checksums,
                    (offset / block_size) as usize,
                )
            }
            WritePlan::SpliceZero { blk_off, blk_len } => {
                let mut buf = vec![0u8; blk_len];
                let at = (offset - blk_off) as usize;
                buf[at..at + payload.len()].copy_from_slice(&payload);
                let checksums = compute_checksums(&buf, block_size as usize);
                (blk_off, buf, checksums, (blk_off / block_size) as usize)
            }
            WritePlan::ReadModify { blk_off, blk_len } => {
                // Read the underlying blocks, splice the new bytes in, and
                // write the whole blocks back.
                let mut buf = queue
                    .pread(
                        Arc::clone(&file),
                        self.config.chunk_header_size + blk_off,
                        blk_len,
                    )
                    .await?;
                buf.resize(blk_len, 0);
                let at = (offset - blk_off) as usize;
                buf[at..at + payload.len()].copy_from_slice(&payload);
                let checksums = compute_checksums(&buf, block_size as usize);
                (blk_off, buf, checksums, (blk_off / block_size) as usize)
            }
        };

        // Account the write before submission; the completion path undoes
        // nothing on success and evicts on fatal failure.
        {
            let st = &mut *self.state.lock();
            let Some(h) = st.arena.get_mut(slot) else {
                return make_error(ChunkCode::NO_SUCH_CHUNK);
            };
            if h.open_file_id() != Some(file.id()) {
                return make_error_msg(ChunkCode::IO_TRY_AGAIN, "chunk file changed under write");
            }
            h.writes_in_flight += 1;
            let sums = h
                .info
                .block_checksums
                .as_mut()
                .expect("checksums loaded for write");
            for (i, sum) in checksums.iter().enumerate() {
                if let Some(slot_sum) = sums.get_mut(first_block + i) {
                    *slot_sum = *sum;
                }
            }
            let end = offset + num_bytes as u64;
            if h.info.size < end {
                let delta = (end - h.info.size) as i64;
                h.info.size = end;
                st.adjust_space(slot, delta);
            }
            let h = st.arena.get_mut(slot).unwrap();
            h.meta_dirty = true;
            h.touch();
        }

        let write_res = queue
            .pwrite(
                Arc::clone(&file),
                self.config.chunk_header_size + disk_off,
                disk_buf,
            )
            .await;

        // Write completion.
        let restart_meta = {
            let st = &mut *self.state.lock();
            match st.arena.get_mut(slot) {
                None => false,
                Some(h) => {
                    if h.writes_in_flight == 0 {
                        die("write completion without writes in flight");
                    }
                    h.writes_in_flight -= 1;
                    h.touch();
                    let restart = h.writes_in_flight == 0 && h.wait_for_writes;
                    if restart {
                        h.wait_for_writes = false;
                    }
                    st.lru_update(slot);
                    restart
                }
            }
        };
        if restart_meta {
            self.spawn_drive_meta_queue(slot);
        }

        match write_res {
            Ok(_) => Ok(num_bytes),
            Err(e) => {
                self.report_io_failure(slot, &e).await;
                Err(e)
            }
        }
    }

    /// Write against a previously allocated write-id.
    pub async fn write_chunk_with_id(
        self: &Arc<Self>,
        write_id: WriteId,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<usize> {
        let (chunk_id, version) = {
            let st = &mut *self.state.lock();
            let Some(res) = st.pending_writes.find(write_id) else {
                return make_error(ChunkCode::NO_SUCH_WRITE_ID);
            };
            if res.status < 0 {
                return make_error_msg(
                    ChunkCode::INVALID_ARG,
                    format!("write id failed earlier with status {}", res.status),
                );
            }
            let out = (res.chunk_id, res.version);
            st.pending_writes.touch(write_id);
            out
        };
        let result = self.write_chunk(chunk_id, version, offset, data).await;
        if let Err(e) = &result {
            let st = &mut *self.state.lock();
            st.pending_writes
                .set_status(write_id, -(nimbus_types::to_errno(e.code())));
        }
        result
    }

    // -- truncate ------------------------------------------------------------

    /// Truncate the chunk payload. The checksum of the block containing
    /// the new end is zeroed; it gets rehashed on the next access.
    pub async fn truncate_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        chunk_size: u64,
    ) -> Result<()> {
        if chunk_size > self.config.chunk_size {
            return make_error_msg(ChunkCode::INVALID_ARG, "truncate past chunk size");
        }
        {
            let needs_load = {
                let st = self.state.lock();
                let slot = self.lookup(&st, chunk_id)?;
                !st.arena.get(slot).unwrap().info.checksums_loaded()
            };
            if needs_load {
                self.read_chunk_metadata(chunk_id).await?;
            }
        }
        let st = &mut *self.state.lock();
        let slot = self.lookup(st, chunk_id)?;
        let h = st.arena.get_mut(slot).unwrap();
        if h.stable {
            return make_error_msg(ChunkCode::CHUNK_STABLE, "truncate of stable chunk");
        }
        if h.info.size == chunk_size {
            return Ok(());
        }
        let delta = chunk_size as i64 - h.info.size as i64;
        h.info.size = chunk_size;
        let last_block = (chunk_size / self.config.checksum_block_size) as usize;
        if let Some(sums) = h.info.block_checksums.as_mut() {
            if chunk_size % self.config.checksum_block_size != 0 {
                if let Some(sum) = sums.get_mut(last_block) {
                    *sum = 0;
                }
            }
            for sum in sums.iter_mut().skip(last_block + 1) {
                *sum = 0;
            }
        }
        h.meta_dirty = true;
        h.touch();
        st.adjust_space(slot, delta);
        st.lru_update(slot);
        Ok(())
    }

    // -- stale / delete -------------------------------------------------------

    /// Delete a chunk outright.
    pub async fn delete_chunk(self: &Arc<Self>, chunk_id: ChunkId) -> Result<()> {
        info!(%chunk_id, "deleting chunk");
        self.stale_chunk(chunk_id, true, false).await
    }

    /// Declare a chunk stale: remove it from the table and queue its file
    /// for deletion (or quarantine under the stale-chunks dir).
    pub async fn stale_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        force_delete: bool,
        evacuated: bool,
    ) -> Result<()> {
        let reschedule_dir = {
            let st = &mut *self.state.lock();
            let slot = self.lookup(st, chunk_id)?;
            st.leases.unregister(chunk_id);
            self.make_stale(st, slot, force_delete, evacuated)
        };
        if let Some(dir_index) = reschedule_dir {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.schedule_evacuate(dir_index, -1).await });
        }
        self.run_stale_queue(false);
        Ok(())
    }

    /// Transition one handle to stale. Returns a directory index when an
    /// evacuation batch should be rescheduled.
    fn make_stale(
        &self,
        st: &mut CmState,
        slot: SlotId,
        force_delete: bool,
        evacuated: bool,
    ) -> Option<usize> {
        let h = st.arena.get(slot).expect("make_stale: live slot");
        let chunk_id = h.info.chunk_id;
        let version = h.info.version;
        let was_stale = h.stale;
        if !was_stale && !st.pending_writes.delete(chunk_id, version) {
            die(format!(
                "stale chunk failed to cleanup pending writes: chunk {} version {}",
                chunk_id, version
            ));
        }
        st.erase_chunk(slot, chunk_id);

        let h = st.arena.get_mut(slot).unwrap();
        h.stale = true;
        h.keep_on_stale = (!force_delete && !self.config.force_delete_stale_chunks)
            || (evacuated && self.config.keep_evacuated_chunks);
        if h.writes_in_flight > 0 {
            die("stale chunk with writes in flight");
        }
        let pending = h.has_meta_ops();
        st.arena.set_global_list(
            slot,
            if pending {
                GlobalListKind::PendingStale
            } else {
                GlobalListKind::Stale
            },
        );
        let h = st.arena.get(slot).unwrap();
        let dir_index = h.dir_index;
        let was_evacuating = h.dir_list == DirListKind::Evacuating;
        st.remove_from_dir_list(slot);
        if was_evacuating && st.dirs[dir_index].chunk_evacuate_done() {
            Some(dir_index)
        } else {
            None
        }
    }

    /// Drain the stale list, bounded by the delete-concurrency limit.
    pub(crate) fn run_stale_queue(self: &Arc<Self>, completion: bool) {
        let mut ops: Vec<(Arc<DiskQueue>, PathBuf, Option<PathBuf>)> = Vec::new();
        {
            let st = &mut *self.state.lock();
            if completion {
                if st.stale_ops_in_flight == 0 {
                    die("stale queue completion without ops in flight");
                }
                st.stale_ops_in_flight -= 1;
            }
            while st.stale_ops_in_flight + (ops.len() as i32)
                < self.config.max_stale_chunk_ops_in_flight
            {
                let Some(slot) = st.arena.global_front(GlobalListKind::Stale) else {
                    break;
                };
                let h = st.arena.get(slot).expect("stale list entry");
                let chunk_id = h.info.chunk_id;
                // If a live chunk with this id can reach the stale entry's
                // version, the file was already renamed over; skip the
                // disk op.
                let guard = st
                    .table
                    .get(&chunk_id)
                    .and_then(|&live| st.arena.get(live))
                    .map(|live| live.can_have_version(h.info.version))
                    .unwrap_or(false);
                if !guard {
                    if let Ok(queue) = self.dir_queue(st, h.dir_index) {
                        let src = self.chunk_pathname(st, h);
                        let dst = h.keep_on_stale.then(|| self.stale_chunk_pathname(st, h));
                        info!(
                            %chunk_id,
                            path = %src.display(),
                            keep = h.keep_on_stale,
                            "disposing of stale chunk"
                        );
                        ops.push((queue, src, dst));
                    }
                }
                st.arena.set_global_list(slot, GlobalListKind::None);
                if st
                    .arena
                    .get(slot)
                    .map(|h| h.data_file.is_some())
                    .unwrap_or(false)
                {
                    self.open_chunk_count.fetch_sub(1, Ordering::Relaxed);
                }
                st.free_handle(slot);
            }
            st.stale_ops_in_flight += ops.len() as i32;
        }
        for (queue, src, dst) in ops {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let res = match dst {
                    Some(dst) => queue.rename(src.clone(), dst).await,
                    None => queue.delete(src.clone()).await,
                };
                if let Err(e) = res {
                    error!(path = %src.display(), error = %e, "stale chunk disposal failed");
                }
                this.run_stale_queue(true);
            });
        }
    }

    // -- failure handling ------------------------------------------------------

    /// Non-transient chunk-level I/O failure: notify the meta server and
    /// evict the chunk.
    pub(crate) async fn chunk_io_failed(self: &Arc<Self>, slot: SlotId, is_lost: bool) {
        let req = {
            let st = &mut *self.state.lock();
            let Some(h) = st.arena.get(slot) else { return };
            if h.stale {
                return;
            }
            let chunk_id = h.info.chunk_id;
            let dir = &mut st.dirs[h.dir_index];
            if !is_lost {
                dir.corrupted_chunks_count += 1;
            }
            error!(
                %chunk_id,
                file_id = %h.info.file_id,
                dir = %dir.dirname.display(),
                is_lost,
                "chunk failed"
            );
            let req = CorruptChunkReq {
                file_id: h.info.file_id,
                chunk_id,
                dir: Some(dir.dirname.display().to_string()),
                is_lost,
                ..Default::default()
            };
            st.leases.unregister(chunk_id);
            self.make_stale(st, slot, false, false);
            req
        };
        self.send_corrupt_notification(req);
        self.run_stale_queue(false);
    }

    pub(crate) fn send_corrupt_notification(self: &Arc<Self>, req: CorruptChunkReq) {
        if !self.meta.is_connected() {
            return;
        }
        let meta = Arc::clone(&self.meta);
        tokio::spawn(async move {
            if let Err(e) = meta.corrupt_chunk(req).await {
                warn!(error = %e, "corrupt chunk notification failed");
            }
        });
    }

    /// Transient errors are logged and returned; everything else evicts.
    pub(crate) async fn report_io_failure(self: &Arc<Self>, slot: SlotId, err: &Status) {
        if err.is_transient() {
            let st = self.state.lock();
            if let Some(h) = st.arena.get(slot) {
                error!(
                    chunk_id = %h.info.chunk_id,
                    error = %err,
                    "assuming temporary io failure"
                );
            }
            return;
        }
        self.chunk_io_failed(slot, false).await;
    }

    /// Directory-level failure: evict every chunk the directory holds,
    /// coalesce the lost-chunk notifications, and hand the directory back
    /// to the prober.
    pub(crate) async fn notify_chunks_lost(self: &Arc<Self>, dir_index: usize) {
        let (req, dirname, lock) = {
            let st = &mut *self.state.lock();
            if !st.dirs[dir_index].is_in_use() {
                return;
            }
            let evacuate_done = st.dirs[dir_index].evacuate_done;
            let dirname = st.dirs[dir_index].dirname.clone();
            if evacuate_done {
                warn!(dir = %dirname.display(), "evacuate done, retiring chunk directory");
            } else {
                error!(dir = %dirname.display(), "lost chunk directory");
            }
            let mut lost: Vec<(FileId, ChunkId)> = Vec::new();
            loop {
                let slot = {
                    let dir = &st.dirs[dir_index];
                    st.arena
                        .dir_front(&dir.live)
                        .or_else(|| st.arena.dir_front(&dir.evacuating))
                };
                let Some(slot) = slot else { break };
                let h = st.arena.get(slot).expect("dir list entry");
                let chunk_id = h.info.chunk_id;
                let file_id = h.info.file_id;
                let stale = h.stale;
                st.erase_chunk(slot, chunk_id);
                st.remove_from_dir_list(slot);
                st.arena.set_global_list(slot, GlobalListKind::None);
                st.leases.unregister(chunk_id);
                if st
                    .arena
                    .get(slot)
                    .map(|h| h.data_file.is_some())
                    .unwrap_or(false)
                {
                    self.open_chunk_count.fetch_sub(1, Ordering::Relaxed);
                }
                st.free_handle(slot);
                if !stale {
                    info!(%chunk_id, %file_id, "lost chunk");
                    lost.push((file_id, chunk_id));
                }
            }
            // Stale handles still belonging to this directory are dropped
            // from the stale queue as well; their files go with the drive.
            for slot in st.arena.global_ids(GlobalListKind::Stale) {
                if st.arena.get(slot).map(|h| h.dir_index) == Some(dir_index) {
                    st.arena.set_global_list(slot, GlobalListKind::None);
                    st.free_handle(slot);
                }
            }
            let lock = st.dirs[dir_index].dir_lock.take();
            let update_flag = st.dirs[dir_index].count_fs_space_available;
            st.dirs[dir_index].stop();
            if update_flag {
                st.update_count_fs_space_flags();
            }
            let req = (!lost.is_empty() && self.meta.is_connected()).then(|| {
                let (first_fid, first_cid) = lost[0];
                CorruptChunkReq {
                    file_id: first_fid,
                    chunk_id: first_cid,
                    dir: Some(dirname.display().to_string()),
                    is_lost: true,
                    dir_ok: false,
                    batch: lost[1..].iter().map(|&(_, c)| c).collect(),
                }
            });
            (req, dirname, lock)
        };
        if let Some(req) = req {
            self.send_corrupt_notification(req);
        }
        self.checker.add_with_lock(dirname, lock);
    }

    /// Classify a directory-probe error; enough timeouts (or any hard
    /// error) retire the directory.
    pub(crate) async fn dir_error(self: &Arc<Self>, dir_index: usize, err: &Status) {
        let lost = {
            let st = &mut *self.state.lock();
            let dir = &mut st.dirs[dir_index];
            if !dir.is_in_use() {
                return;
            }
            error!(
                dir = %dir.dirname.display(),
                error = %err,
                available = dir.available_space,
                "chunk directory error"
            );
            match err.code() {
                ChunkCode::IO_TRY_AGAIN | ChunkCode::OUT_OF_MEMORY => false,
                ChunkCode::IO_TIMED_OUT => {
                    dir.disk_timeout_count += 1;
                    dir.disk_timeout_count > self.config.max_dir_check_disk_timeouts
                }
                _ => true,
            }
        };
        if lost {
            self.notify_chunks_lost(dir_index).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronous state helpers
// ---------------------------------------------------------------------------

impl CmState {
    pub(crate) fn add_to_dir_live(&mut self, slot: SlotId) {
        let dir_index = self.arena.get(slot).expect("live slot").dir_index;
        let dir = &mut self.dirs[dir_index];
        self.arena
            .dir_move(slot, None, Some((&mut dir.live, DirListKind::Live)));
        dir.chunk_count += 1;
    }

    /// Remove from whichever directory list holds the handle.
    pub(crate) fn remove_from_dir_list(&mut self, slot: SlotId) {
        let Some(h) = self.arena.get(slot) else { return };
        let dir_index = h.dir_index;
        let kind = h.dir_list;
        let dir = &mut self.dirs[dir_index];
        match kind {
            DirListKind::None => return,
            DirListKind::Live => self.arena.dir_move(slot, Some(&mut dir.live), None),
            DirListKind::Evacuating => {
                self.arena.dir_move(slot, Some(&mut dir.evacuating), None)
            }
        }
        dir.chunk_count -= 1;
    }

    /// Move a live chunk onto (or off) its directory's evacuating list.
    pub(crate) fn set_evacuate(&mut self, slot: SlotId, flag: bool) {
        let Some(h) = self.arena.get(slot) else { return };
        let dir_index = h.dir_index;
        let dir = &mut self.dirs[dir_index];
        match (h.dir_list, flag) {
            (DirListKind::Live, true) => {
                self.arena.dir_move(
                    slot,
                    Some(&mut dir.live),
                    Some((&mut dir.evacuating, DirListKind::Evacuating)),
                );
                dir.evacuate_in_flight_count += 1;
            }
            (DirListKind::Evacuating, false) => {
                self.arena.dir_move(
                    slot,
                    Some(&mut dir.evacuating),
                    Some((&mut dir.live, DirListKind::Live)),
                );
            }
            _ => {}
        }
    }

    /// Adjust node and directory used-space by `delta` bytes.
    pub(crate) fn adjust_space(&mut self, slot: SlotId, delta: i64) {
        let Some(h) = self.arena.get(slot) else { return };
        let dir = &mut self.dirs[h.dir_index];
        dir.used_space = (dir.used_space + delta).max(0);
        self.used_space = (self.used_space + delta).max(0);
    }

    /// Remove a chunk from the table and subtract its space.
    pub(crate) fn erase_chunk(&mut self, slot: SlotId, chunk_id: ChunkId) {
        if self.table.get(&chunk_id) == Some(&slot) {
            self.table.remove(&chunk_id);
        }
        let size = self
            .arena
            .get(slot)
            .map(|h| h.info.size as i64)
            .unwrap_or(0);
        self.adjust_space(slot, -size.min(self.used_space));
    }

    pub(crate) fn free_handle(&mut self, slot: SlotId) {
        if self.arena.get(slot).is_none() {
            return;
        }
        self.remove_from_dir_list(slot);
        if self
            .arena
            .get(slot)
            .map(|h| h.global_list != GlobalListKind::None)
            .unwrap_or(false)
        {
            self.arena.set_global_list(slot, GlobalListKind::None);
        }
        self.arena.free(slot);
    }

    /// Maintain the LRU invariant: a handle sits on the LRU exactly when
    /// it is open, not stale, not appender-owned, not being replicated,
    /// and has no pending metadata ops.
    pub(crate) fn lru_update(&mut self, slot: SlotId) {
        let Some(h) = self.arena.get_mut(slot) else { return };
        h.touch();
        if h.stale {
            return;
        }
        let eligible = h.is_file_open()
            && !h.appender_owns
            && !h.being_replicated
            && !h.has_meta_ops()
            && !h.delete_pending;
        if eligible {
            self.arena.set_global_list(slot, GlobalListKind::Lru);
        } else if h.global_list == GlobalListKind::Lru {
            self.arena.set_global_list(slot, GlobalListKind::None);
        }
    }

    /// Recompute which directory counts its file-system space toward the
    /// node totals: the first in-use, non-evacuating directory per device.
    pub(crate) fn update_count_fs_space_flags(&mut self) -> usize {
        let mut count = 0;
        for i in 0..self.dirs.len() {
            if !self.dirs[i].is_in_use() || self.dirs[i].evacuate_started {
                self.dirs[i].count_fs_space_available = false;
                continue;
            }
            let device = self.dirs[i].device_id;
            let first = (0..i).all(|j| {
                !self.dirs[j].is_in_use()
                    || !self.dirs[j].count_fs_space_available
                    || self.dirs[j].device_id != device
            });
            self.dirs[i].count_fs_space_available = first;
            if first {
                count += 1;
            }
        }
        count
    }

    pub(crate) fn total_space_info(&self, config: &ChunkServerConfig) -> SpaceInfo {
        let mut info = SpaceInfo {
            used_space: self.used_space,
            ..Default::default()
        };
        let mut total_fs_available: i64 = 0;
        for dir in &self.dirs {
            if !dir.is_in_use() {
                info.lost_chunk_dirs.push(dir.dirname.clone());
                continue;
            }
            if dir.evacuate_flag {
                // Keep the count positive while evacuation is in progress;
                // the meta server clears its queue on zero.
                info.evacuate_in_flight_count += dir.evacuate_in_flight_count.max(1);
                info.evacuate_chunks += dir.chunk_count as i32;
                info.evacuate_byte_count += dir.used_space;
                info.evacuate_done_chunk_count += dir.evacuate_done_chunk_count() as i32;
                info.evacuate_done_byte_count += dir.evacuate_done_byte_count();
            } else if dir.available_space > config.min_fs_available_space
                && dir.available_space as f64
                    > dir.total_space as f64 * config.max_space_utilization_threshold
            {
                info.writable_chunk_dirs += 1;
            }
            info.chunk_dirs += 1;
            if dir.count_fs_space_available {
                info.total_fs_space += dir.total_space;
                if dir.available_space > config.min_fs_available_space {
                    total_fs_available += dir.available_space - config.min_fs_available_space;
                }
            }
        }
        info.total_space = total_fs_available.min(config.total_space) + self.used_space;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use nimbus_types::ChunkVersion;

    const MIB: usize = 1 << 20;
    const BLOCK: usize = 64 << 10;

    fn find_chunk_file(cluster: &TestCluster, name: &str) -> Option<std::path::PathBuf> {
        cluster
            .dirs
            .iter()
            .map(|d| d.join(name))
            .find(|p| p.exists())
    }

    fn find_dirty_file(cluster: &TestCluster, name: &str) -> Option<std::path::PathBuf> {
        cluster
            .dirs
            .iter()
            .map(|d| d.join("dirty").join(name))
            .find(|p| p.exists())
    }

    fn dirty_is_empty(cluster: &TestCluster) -> bool {
        cluster.dirs.iter().all(|d| {
            std::fs::read_dir(d.join("dirty"))
                .map(|mut it| it.next().is_none())
                .unwrap_or(true)
        })
    }

    #[tokio::test]
    async fn test_alloc_write_stabilize_read_roundtrip() {
        let cluster = start_cluster("roundtrip", 2).await;
        let mgr = &cluster.manager;

        mgr.alloc_chunk(FileId(7), ChunkId(42), ChunkVersion(1), false, false)
            .await
            .unwrap();
        assert!(find_dirty_file(&cluster, "7.42.0").is_some());
        assert!(!mgr.is_chunk_stable(ChunkId(42)));

        let payload = pattern_bytes(MIB, 3);
        let written = mgr
            .write_chunk(ChunkId(42), ChunkVersion(1), 0, payload.clone())
            .await
            .unwrap();
        assert_eq!(written, MIB);
        assert_eq!(mgr.chunk_size(ChunkId(42)), Some(MIB as u64));

        mgr.make_chunk_stable(ChunkId(42), ChunkVersion(1), false)
            .await
            .unwrap();

        let stable = find_chunk_file(&cluster, "7.42.1").expect("stable chunk file");
        let file_size = std::fs::metadata(&stable).unwrap().len();
        assert_eq!(file_size, (16 << 10) + MIB as u64);
        assert!(dirty_is_empty(&cluster));
        assert!(mgr.is_chunk_stable(ChunkId(42)));
        assert_eq!(mgr.chunk_version(ChunkId(42)), Some(ChunkVersion(1)));

        let read = mgr
            .read_chunk(ChunkId(42), ChunkVersion(1), 0, MIB)
            .await
            .unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_partial_block_writes_splice_and_read_modify() {
        let cluster = start_cluster("partial", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(5), ChunkVersion(1), false, false)
            .await
            .unwrap();

        // Past-EOF partial write: target block spliced from zeros.
        let tail = pattern_bytes(100, 9);
        mgr.write_chunk(ChunkId(5), ChunkVersion(1), 10, tail.clone())
            .await
            .unwrap();
        assert_eq!(mgr.chunk_size(ChunkId(5)), Some(110));

        // Overwrite inside the now-existing block: read-modify-write.
        let patch = pattern_bytes(40, 21);
        mgr.write_chunk(ChunkId(5), ChunkVersion(1), 30, patch.clone())
            .await
            .unwrap();

        let read = mgr
            .read_chunk(ChunkId(5), ChunkVersion(1), 0, 110)
            .await
            .unwrap();
        assert_eq!(&read[..10], &[0u8; 10]);
        assert_eq!(&read[10..30], &tail[..20]);
        assert_eq!(&read[30..70], &patch[..]);
        assert_eq!(&read[70..110], &tail[60..]);

        // Partial write straddling a block boundary.
        let straddle = pattern_bytes(100, 33);
        let offset = (BLOCK - 50) as u64;
        mgr.write_chunk(ChunkId(5), ChunkVersion(1), offset, straddle.clone())
            .await
            .unwrap();
        let read = mgr
            .read_chunk(ChunkId(5), ChunkVersion(1), offset, 100)
            .await
            .unwrap();
        assert_eq!(read, straddle);
    }

    #[tokio::test]
    async fn test_write_boundaries() {
        let cluster = start_cluster("boundaries", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(9), ChunkVersion(1), false, false)
            .await
            .unwrap();

        // Writing past the chunk capacity fails.
        let err = mgr
            .write_chunk(ChunkId(9), ChunkVersion(1), MIB as u64, vec![1u8; 16])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::INVALID_ARG);

        // A misaligned write of a full block or more is rejected, not
        // asserted.
        let err = mgr
            .write_chunk(ChunkId(9), ChunkVersion(1), 10, vec![1u8; BLOCK])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::INVALID_ARG);

        // Writing exactly up to the capacity fills the last block.
        mgr.write_chunk(
            ChunkId(9),
            ChunkVersion(1),
            (MIB - BLOCK) as u64,
            pattern_bytes(BLOCK, 7),
        )
        .await
        .unwrap();
        assert_eq!(mgr.chunk_size(ChunkId(9)), Some(MIB as u64));
    }

    #[tokio::test]
    async fn test_read_boundaries_and_version() {
        let cluster = start_cluster("readbounds", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(3), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(3), ChunkVersion(1), 0, pattern_bytes(256, 1))
            .await
            .unwrap();

        // Reads at or past the size return no bytes, not an error.
        assert!(mgr
            .read_chunk(ChunkId(3), ChunkVersion(1), 256, 100)
            .await
            .unwrap()
            .is_empty());
        assert!(mgr
            .read_chunk(ChunkId(3), ChunkVersion(1), 9999, 1)
            .await
            .unwrap()
            .is_empty());
        // Reads are clipped to the chunk size.
        assert_eq!(
            mgr.read_chunk(ChunkId(3), ChunkVersion(1), 200, 1000)
                .await
                .unwrap()
                .len(),
            56
        );

        let err = mgr
            .read_chunk(ChunkId(3), ChunkVersion(2), 0, 10)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_CHUNK_VERSION);

        let err = mgr
            .read_chunk(ChunkId(99), ChunkVersion(1), 0, 10)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::NO_SUCH_CHUNK);
    }

    #[tokio::test]
    async fn test_change_version_fast_path() {
        let cluster = start_cluster("fastpath", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(4), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(4), ChunkVersion(1), 0, vec![1u8; 64])
            .await
            .unwrap();

        // Unstable to unstable version change: no disk rename, the dirty
        // file keeps its zero-version name.
        mgr.change_chunk_vers(ChunkId(4), ChunkVersion(2), false)
            .await
            .unwrap();
        assert_eq!(mgr.chunk_version(ChunkId(4)), Some(ChunkVersion(2)));
        assert!(find_dirty_file(&cluster, "1.4.0").is_some());
        assert!(!mgr.is_chunk_stable(ChunkId(4)));
    }

    #[tokio::test]
    async fn test_version_change_waits_for_writes_in_flight() {
        let cluster = start_cluster("verswait", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(8), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(8), ChunkVersion(1), 0, pattern_bytes(BLOCK, 2))
            .await
            .unwrap();

        // Pin a data write in flight, then ask for a stable rename.
        let slot = {
            let st = &mut *mgr.state.lock();
            let slot = *st.table.get(&ChunkId(8)).unwrap();
            st.arena.get_mut(slot).unwrap().writes_in_flight = 1;
            slot
        };
        let mgr2 = Arc::clone(mgr);
        let change = tokio::spawn(async move {
            mgr2.change_chunk_vers(ChunkId(8), ChunkVersion(2), true)
                .await
        });

        // The rename is queued but must not run while the write is in
        // flight.
        assert!(
            wait_until(
                || {
                    let st = mgr.state.lock();
                    st.arena
                        .get(slot)
                        .map(|h| h.is_rename_in_flight() && h.wait_for_writes)
                        .unwrap_or(false)
                },
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(mgr.chunk_version(ChunkId(8)), Some(ChunkVersion(1)));
        {
            let st = mgr.state.lock();
            let h = st.arena.get(slot).unwrap();
            assert!(h
                .meta_op_queue
                .iter()
                .any(|op| matches!(op.kind, crate::chunk_handle::MetaOpKind::Rename { .. })));
        }
        // The inventory report shows the target state during the commit.
        let report = mgr.hosted_chunks();
        assert_eq!(report.stable.len(), 1);
        assert_eq!(report.stable[0].version, ChunkVersion(2));

        // The last write completes: the queue drains and the rename
        // commits.
        {
            let st = &mut *mgr.state.lock();
            st.arena.get_mut(slot).unwrap().writes_in_flight = 0;
        }
        mgr.spawn_drive_meta_queue(slot);
        change.await.unwrap().unwrap();

        assert_eq!(mgr.chunk_version(ChunkId(8)), Some(ChunkVersion(2)));
        let err = mgr
            .read_chunk(ChunkId(8), ChunkVersion(1), 0, 16)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_CHUNK_VERSION);
        assert!(mgr
            .read_chunk(ChunkId(8), ChunkVersion(2), 0, 16)
            .await
            .is_ok());
        assert!(find_chunk_file(&cluster, "1.8.2").is_some());
    }

    #[tokio::test]
    async fn test_make_stable_is_idempotent() {
        let cluster = start_cluster("idempotent", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(2), ChunkId(11), ChunkVersion(3), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(11), ChunkVersion(3), 0, pattern_bytes(128, 4))
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(11), ChunkVersion(3), false)
            .await
            .unwrap();
        let path = find_chunk_file(&cluster, "2.11.3").unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        mgr.make_chunk_stable(ChunkId(11), ChunkVersion(3), false)
            .await
            .unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            mtime
        );
        assert!(mgr.is_chunk_stable(ChunkId(11)));

        // Wrong target version still fails.
        let err = mgr
            .make_chunk_stable(ChunkId(11), ChunkVersion(4), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_CHUNK_VERSION);
    }

    #[tokio::test]
    async fn test_truncate_accounting_and_noop() {
        let cluster = start_cluster("truncate", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(6), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(
            ChunkId(6),
            ChunkVersion(1),
            0,
            pattern_bytes(3 * BLOCK, 5),
        )
        .await
        .unwrap();
        assert_eq!(mgr.used_space(), 3 * BLOCK as i64);

        mgr.truncate_chunk(ChunkId(6), BLOCK as u64 + 100)
            .await
            .unwrap();
        assert_eq!(mgr.chunk_size(ChunkId(6)), Some(BLOCK as u64 + 100));
        assert_eq!(mgr.used_space(), BLOCK as i64 + 100);
        // The cut block's checksum is zeroed for rehash on next access.
        assert_eq!(mgr.get_checksum(ChunkId(6), BLOCK as u64 + 1), Some(0));

        // Truncate to the current size is a no-op.
        mgr.truncate_chunk(ChunkId(6), BLOCK as u64 + 100)
            .await
            .unwrap();
        assert_eq!(mgr.used_space(), BLOCK as i64 + 100);

        let err = mgr
            .truncate_chunk(ChunkId(6), (MIB + 1) as u64)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::INVALID_ARG);
    }

    #[tokio::test]
    async fn test_alloc_fails_when_no_dir_has_space() {
        let cluster = start_cluster_with("nospace", 2, |config| {
            config.min_fs_available_space = i64::MAX;
        })
        .await;
        let err = cluster
            .manager
            .alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::NO_SPACE);
    }

    #[tokio::test]
    async fn test_weighted_placement_distribution() {
        let cluster = start_cluster("placement", 3).await;
        let mgr = &cluster.manager;
        mgr.seed_placement(0x6e696d627573);

        const G: i64 = 1 << 30;
        {
            let st = &mut *mgr.state.lock();
            for (dir, avail) in st.dirs.iter_mut().zip([1000 * G, 1000 * G, 8000 * G]) {
                dir.available_space = avail;
                dir.total_space = 100_000 * G;
            }
        }

        let mut counts = [0usize; 3];
        const DRAWS: usize = 20_000;
        for _ in 0..DRAWS {
            let st = &mut *mgr.state.lock();
            let picked = mgr.get_dir_for_chunk(st).expect("a directory");
            counts[picked] += 1;
        }
        // Weights: max(1600, 1000) : max(1600, 1000) : max(1600, 8000).
        let expected = [1600.0 / 11200.0, 1600.0 / 11200.0, 8000.0 / 11200.0];
        for (i, &count) in counts.iter().enumerate() {
            let actual = count as f64 / DRAWS as f64;
            assert!(
                (actual - expected[i]).abs() < 0.02,
                "dir {}: got {:.4}, expected {:.4}",
                i,
                actual,
                expected[i]
            );
        }
    }

    #[tokio::test]
    async fn test_placement_skips_evacuating_dirs() {
        let cluster = start_cluster("placeskip", 2).await;
        let mgr = &cluster.manager;
        {
            let st = &mut *mgr.state.lock();
            st.dirs[0].evacuate_flag = true;
            st.dirs[0].evacuate_started = true;
            for dir in st.dirs.iter_mut() {
                dir.available_space = 1 << 30;
                dir.total_space = 1 << 40;
            }
        }
        for _ in 0..100 {
            let st = &mut *mgr.state.lock();
            assert_eq!(mgr.get_dir_for_chunk(st), Some(1));
        }
    }

    #[tokio::test]
    async fn test_delete_chunk_unlinks_file() {
        let cluster = start_cluster("delete", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(3), ChunkId(30), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(30), ChunkVersion(1), 0, vec![9u8; 512])
            .await
            .unwrap();
        let path = find_dirty_file(&cluster, "3.30.0").unwrap();

        mgr.delete_chunk(ChunkId(30)).await.unwrap();
        assert!(!mgr.has_chunk(ChunkId(30)));
        assert!(wait_until(|| !path.exists(), Duration::from_secs(5)).await);
        assert_eq!(mgr.used_space(), 0);
    }

    #[tokio::test]
    async fn test_stale_chunk_keeps_quarantined_copy() {
        let cluster = start_cluster("quarantine", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(3), ChunkId(31), ChunkVersion(2), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(31), ChunkVersion(2), 0, vec![9u8; 512])
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(31), ChunkVersion(2), false)
            .await
            .unwrap();

        mgr.stale_chunk(ChunkId(31), false, false).await.unwrap();
        assert!(!mgr.has_chunk(ChunkId(31)));
        let quarantined = cluster.dirs[0].join("lost+found").join("3.31.2");
        assert!(wait_until(|| quarantined.exists(), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_corrupt_header_evicts_and_notifies() {
        let cluster = start_cluster("corrupt", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(7), ChunkId(70), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(70), ChunkVersion(1), 0, pattern_bytes(BLOCK, 6))
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(70), ChunkVersion(1), false)
            .await
            .unwrap();
        mgr.close_chunk(ChunkId(70)).await.unwrap();

        // Flip a record byte; the header checksum no longer matches.
        let path = find_chunk_file(&cluster, "7.70.1").unwrap();
        let mut header = std::fs::read(&path).unwrap();
        header[8] ^= 0xff;
        std::fs::write(&path, &header).unwrap();

        let err = mgr
            .read_chunk(ChunkId(70), ChunkVersion(1), 0, 16)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_HEADER_CHECKSUM);
        assert!(!mgr.has_chunk(ChunkId(70)));
        assert!(
            wait_until(
                || {
                    cluster
                        .meta
                        .corrupt_chunk_requests()
                        .iter()
                        .any(|req| req.chunk_id == ChunkId(70) && !req.is_lost)
                },
                Duration::from_secs(5)
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_hosted_chunks_partitions() {
        let cluster = start_cluster("hosted", 1).await;
        let mgr = &cluster.manager;

        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(1), ChunkVersion(1), 0, vec![1u8; 64])
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(1), ChunkVersion(1), false)
            .await
            .unwrap();

        mgr.alloc_chunk(FileId(1), ChunkId(2), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.alloc_chunk_for_append(FileId(1), ChunkId(3), ChunkVersion(1), false)
            .await
            .unwrap();

        let report = mgr.hosted_chunks();
        assert_eq!(report.total(), 3);
        assert_eq!(report.stable.len(), 1);
        assert_eq!(report.stable[0].chunk_id, ChunkId(1));
        assert_eq!(report.not_stable.len(), 1);
        assert_eq!(report.not_stable[0].chunk_id, ChunkId(2));
        assert_eq!(report.not_stable_append.len(), 1);
        assert_eq!(report.not_stable_append[0].chunk_id, ChunkId(3));
    }

    #[tokio::test]
    async fn test_write_id_lifecycle() {
        let cluster = start_cluster("writeid", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(4), ChunkId(40), ChunkVersion(1), false, false)
            .await
            .unwrap();

        let err = mgr
            .allocate_write_id(ChunkId(40), ChunkVersion(2), 0, 64, false)
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_CHUNK_VERSION);

        let err = mgr
            .allocate_write_id(ChunkId(40), ChunkVersion(1), 0, 64, true)
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::APPEND_MODE_MISMATCH);

        let write_id = mgr
            .allocate_write_id(ChunkId(40), ChunkVersion(1), 0, 64, false)
            .unwrap();
        assert!(mgr.is_write_pending(ChunkId(40)));
        assert_eq!(mgr.get_write_status(write_id).unwrap(), 0);
        assert_eq!(mgr.num_writable_chunks(), 1);

        mgr.write_chunk_with_id(write_id, 0, pattern_bytes(64, 8))
            .await
            .unwrap();
        let read = mgr
            .read_chunk(ChunkId(40), ChunkVersion(1), 0, 64)
            .await
            .unwrap();
        assert_eq!(read, pattern_bytes(64, 8));

        // Make-stable clears the reservation.
        mgr.make_chunk_stable(ChunkId(40), ChunkVersion(1), false)
            .await
            .unwrap();
        assert!(!mgr.is_write_pending(ChunkId(40)));
        let err = mgr
            .allocate_write_id(ChunkId(40), ChunkVersion(1), 0, 64, false)
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::CHUNK_STABLE);
    }

    #[tokio::test]
    async fn test_space_accounting() {
        let cluster = start_cluster("space", 2).await;
        let mgr = &cluster.manager;
        assert_eq!(mgr.used_space(), 0);

        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(1), ChunkVersion(1), 0, pattern_bytes(2 * BLOCK, 1))
            .await
            .unwrap();
        assert_eq!(mgr.used_space(), 2 * BLOCK as i64);

        let info = mgr.total_space();
        assert_eq!(info.used_space, 2 * BLOCK as i64);
        assert!(info.chunk_dirs == 2);
        assert!(info.total_space > 0);
        assert!(info.lost_chunk_dirs.is_empty());

        mgr.delete_chunk(ChunkId(1)).await.unwrap();
        assert_eq!(mgr.used_space(), 0);
    }

    #[tokio::test]
    async fn test_alloc_existing_chunk_rules() {
        let cluster = start_cluster("allocdup", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();

        // Same unstable chunk at the same version: accepted.
        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();
        // Different version: rejected.
        let err = mgr
            .alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(2), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::CHUNK_EXISTS);
        // Replication over a live chunk: rejected.
        let err = mgr
            .alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), true, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::CHUNK_EXISTS);
        // must_exist on a missing chunk: rejected.
        let err = mgr
            .alloc_chunk(FileId(1), ChunkId(2), ChunkVersion(1), false, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::NO_SUCH_CHUNK);
    }

    #[tokio::test]
    async fn test_write_to_stable_chunk_fails() {
        let cluster = start_cluster("stablewrite", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();
        mgr.write_chunk(ChunkId(1), ChunkVersion(1), 0, vec![1u8; 64])
            .await
            .unwrap();
        mgr.make_chunk_stable(ChunkId(1), ChunkVersion(1), false)
            .await
            .unwrap();

        let err = mgr
            .write_chunk(ChunkId(1), ChunkVersion(1), 0, vec![2u8; 64])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ChunkCode::CHUNK_STABLE);
    }

    #[tokio::test]
    async fn test_sparse_block_read_allowance() {
        let cluster = start_cluster("sparse", 1).await;
        let mgr = &cluster.manager;
        mgr.alloc_chunk(FileId(1), ChunkId(1), ChunkVersion(1), false, false)
            .await
            .unwrap();
        // Write only the second block; block 0 stays a hole with a zero
        // checksum.
        mgr.write_chunk(
            ChunkId(1),
            ChunkVersion(1),
            BLOCK as u64,
            pattern_bytes(BLOCK, 2),
        )
        .await
        .unwrap();
        assert_eq!(mgr.get_checksum(ChunkId(1), 0), Some(0));

        let read = mgr
            .read_chunk(ChunkId(1), ChunkVersion(1), 0, 2 * BLOCK)
            .await
            .unwrap();
        assert_eq!(&read[..BLOCK], &vec![0u8; BLOCK][..]);
        assert_eq!(&read[BLOCK..], &pattern_bytes(BLOCK, 2)[..]);
    }
}
