//! Startup restore: rebuild the chunk table from what survived on disk.
//!
//! Unstable chunks (everything under `dirty/`) are deleted unconditionally;
//! they did not survive the crash by design. Stable files are admitted when
//! their name parses and their size is plausible; files that grew past the
//! maximum (a write was cut off mid-flush) have their header validated and
//! are truncated back to the recorded size.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use nimbus_types::{ChunkId, ChunkVersion, FileId, Result, Status, StatusCode};

use crate::chunk_handle::ChunkInfoHandle;
use crate::chunk_info::{ChunkInfo, DiskChunkInfo};
use crate::chunk_manager::ChunkManager;

#[derive(Debug, Clone)]
struct ScanGeometry {
    header_size: u64,
    chunk_size: u64,
    max_blocks: usize,
    require_header_checksum: bool,
    dirty_dir: String,
    skip_names: Vec<String>,
    evacuate_name: String,
}

#[derive(Debug)]
struct ScannedChunk {
    file_id: FileId,
    chunk_id: ChunkId,
    version: ChunkVersion,
    /// Payload bytes (file size minus header).
    size: u64,
    file_name: String,
}

#[derive(Debug)]
struct DirScan {
    dir_index: usize,
    evacuate_present: bool,
    chunks: Vec<ScannedChunk>,
}

impl ChunkManager {
    /// Scan every in-use directory and rebuild the chunk table. Returns
    /// the indices of directories carrying the evacuate sentinel.
    pub(crate) async fn restore(self: &Arc<Self>) -> Result<Vec<usize>> {
        let scan_dirs: Vec<(usize, PathBuf)> = {
            let st = self.state.lock();
            st.dirs
                .iter()
                .enumerate()
                .filter(|(_, d)| d.is_in_use())
                .map(|(i, d)| (i, d.dirname.clone()))
                .collect()
        };
        let geometry = ScanGeometry {
            header_size: self.config.chunk_header_size,
            chunk_size: self.config.chunk_size,
            max_blocks: self.config.max_blocks(),
            require_header_checksum: self.config.require_chunk_header_checksum,
            dirty_dir: self.config.dirty_chunks_dir.clone(),
            skip_names: vec![
                self.config.dir_lock_name.clone(),
                self.config.evacuate_file_name.clone(),
                self.config.evacuate_done_file_name.clone(),
            ],
            evacuate_name: self.config.evacuate_file_name.clone(),
        };
        let scans = tokio::task::spawn_blocking(move || {
            scan_dirs
                .into_iter()
                .map(|(dir_index, dirname)| scan_dir(dir_index, &dirname, &geometry))
                .collect::<Vec<DirScan>>()
        })
        .await
        .map_err(|e| Status::with_message(StatusCode::OS_ERROR, e.to_string()))?;

        let mut evacuate_dirs = Vec::new();
        // (src, Some(dst)) renames the duplicate aside; None unlinks it.
        let mut disposals: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
        {
            let st = &mut *self.state.lock();
            for scan in scans {
                if scan.evacuate_present {
                    evacuate_dirs.push(scan.dir_index);
                }
                let dirname = st.dirs[scan.dir_index].dirname.clone();
                for chunk in scan.chunks {
                    if st.table.contains_key(&chunk.chunk_id) {
                        let src = dirname.join(&chunk.file_name);
                        let dst = (!self.config.force_delete_stale_chunks).then(|| {
                            dirname
                                .join(&self.config.stale_chunks_dir)
                                .join(&chunk.file_name)
                        });
                        info!(
                            chunk_id = %chunk.chunk_id,
                            file = %src.display(),
                            keep = dst.is_some(),
                            "dropping duplicate chunk file"
                        );
                        disposals.push((src, dst));
                        continue;
                    }
                    let mut info =
                        ChunkInfo::new(chunk.file_id, chunk.chunk_id, chunk.version);
                    info.size = chunk.size;
                    let handle = ChunkInfoHandle::new(info, scan.dir_index, true);
                    let slot = st.arena.insert(handle);
                    st.table.insert(chunk.chunk_id, slot);
                    st.add_to_dir_live(slot);
                    st.adjust_space(slot, chunk.size as i64);
                }
            }
        }
        if !disposals.is_empty() {
            tokio::task::spawn_blocking(move || {
                for (src, dst) in disposals {
                    let res = match &dst {
                        Some(dst) => std::fs::rename(&src, dst),
                        None => std::fs::remove_file(&src),
                    };
                    if let Err(e) = res {
                        error!(file = %src.display(), error = %e, "duplicate disposal failed");
                    }
                }
            })
            .await
            .map_err(|e| Status::with_message(StatusCode::OS_ERROR, e.to_string()))?;
        }
        let (chunks, used) = {
            let st = self.state.lock();
            (st.table.len(), st.used_space)
        };
        info!(chunks, used_space = used, "restore complete");
        Ok(evacuate_dirs)
    }
}

fn scan_dir(dir_index: usize, dirname: &Path, geometry: &ScanGeometry) -> DirScan {
    remove_dirty_chunks(&dirname.join(&geometry.dirty_dir));

    let mut scan = DirScan {
        dir_index,
        evacuate_present: dirname.join(&geometry.evacuate_name).is_file(),
        chunks: Vec::new(),
    };
    let entries = match std::fs::read_dir(dirname) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %dirname.display(), error = %e, "unable to open chunk directory");
            return scan;
        }
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if geometry.skip_names.iter().any(|s| s == &name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Some((file_id, chunk_id, version)) = parse_chunk_file_name(&name) else {
            info!(dir = %dirname.display(), file = name.as_str(), "ignoring malformed chunk file name");
            continue;
        };
        let file_size = meta.len();
        // A file may exceed the maximum by at most one more header's worth
        // of unflushed tail; anything else is not a chunk file.
        let max_file_size = geometry.header_size + geometry.chunk_size;
        if file_size < geometry.header_size || file_size > max_file_size + geometry.header_size {
            info!(
                dir = %dirname.display(),
                file = name.as_str(),
                size = file_size,
                "ignoring invalid chunk file"
            );
            continue;
        }
        let payload = if file_size > max_file_size {
            // Oversize: trust the header, then cut the tail off.
            match validate_and_truncate(&entry.path(), chunk_id, version, geometry) {
                Some(size) => size,
                None => continue,
            }
        } else {
            file_size - geometry.header_size
        };
        scan.chunks.push(ScannedChunk {
            file_id,
            chunk_id,
            version,
            size: payload,
            file_name: name,
        });
    }
    scan
}

/// On restart every unstable chunk is gone: writes may have been pending
/// against them and were never flushed.
fn remove_dirty_chunks(dirty: &Path) {
    let entries = match std::fs::read_dir(dirty) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %dirty.display(), error = %e, "unable to open dirty chunk directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_file = entry.metadata().map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        info!(file = %path.display(), "cleaning out dirty chunk");
        if let Err(e) = std::fs::remove_file(&path) {
            error!(file = %path.display(), error = %e, "unable to remove dirty chunk");
        }
    }
}

fn validate_and_truncate(
    path: &Path,
    chunk_id: ChunkId,
    version: ChunkVersion,
    geometry: &ScanGeometry,
) -> Option<u64> {
    let header = match read_header(path, geometry.header_size as usize) {
        Ok(header) => header,
        Err(e) => {
            info!(file = %path.display(), error = %e, "ignoring unreadable chunk file");
            return None;
        }
    };
    let dci = match DiskChunkInfo::parse(
        &header,
        geometry.max_blocks,
        geometry.require_header_checksum,
    ) {
        Ok(dci) => dci,
        Err(e) => {
            info!(file = %path.display(), error = %e, "ignoring chunk file with invalid header");
            return None;
        }
    };
    if let Err(e) = dci.validate(chunk_id, version) {
        info!(file = %path.display(), error = %e, "ignoring chunk file with mismatched header");
        return None;
    }
    let target = geometry.header_size + dci.size;
    match std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(target))
    {
        Ok(()) => info!(file = %path.display(), to = target, "truncated chunk file"),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to truncate chunk file");
        }
    }
    Some(dci.size)
}

fn read_header(path: &Path, header_size: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; header_size];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Chunk file names are `<file_id>.<chunk_id>.<version>`, nothing else.
fn parse_chunk_file_name(name: &str) -> Option<(FileId, ChunkId, ChunkVersion)> {
    let mut parts = name.split('.');
    let file_id = parts.next()?.parse::<u64>().ok()?;
    let chunk_id = parts.next()?.parse::<u64>().ok()?;
    let version = parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((FileId(file_id), ChunkId(chunk_id), ChunkVersion(version)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_file_name() {
        assert_eq!(
            parse_chunk_file_name("7.42.3"),
            Some((FileId(7), ChunkId(42), ChunkVersion(3)))
        );
        assert_eq!(
            parse_chunk_file_name("1.2.0"),
            Some((FileId(1), ChunkId(2), ChunkVersion(0)))
        );
        assert_eq!(parse_chunk_file_name("7.42"), None);
        assert_eq!(parse_chunk_file_name("7.42.3.9"), None);
        assert_eq!(parse_chunk_file_name("a.42.3"), None);
        assert_eq!(parse_chunk_file_name("lock"), None);
        assert_eq!(parse_chunk_file_name(""), None);
    }
}
