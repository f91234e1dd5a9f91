//! Per-directory disk I/O gateway.
//!
//! Each chunk directory owns one [`DiskQueue`]. Operations run on the
//! blocking thread pool and are bounded by a per-op timeout that surfaces
//! as the transient `IO_TIMED_OUT` status. The queue tracks pending read
//! and write bytes for the placement policy's I/O-pressure term.
//!
//! File handles are refcounted ([`Arc<ChunkFile>`]) and carry a
//! process-unique id: a completion that observes a different id than the
//! handle it was issued against is stale and must be dropped.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_types::{make_error_msg, ChunkCode, Result, Status};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// An open chunk file with a process-unique id.
#[derive(Debug)]
pub struct ChunkFile {
    id: u64,
    file: std::fs::File,
}

impl ChunkFile {
    fn new(file: std::fs::File) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            file,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Free/total space of the file system backing a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsSpace {
    pub available: i64,
    pub total: i64,
}

/// Async façade over one directory's blocking file operations.
#[derive(Debug)]
pub struct DiskQueue {
    dirname: PathBuf,
    op_timeout: Duration,
    pending_read_bytes: AtomicI64,
    pending_write_bytes: AtomicI64,
}

impl DiskQueue {
    pub fn new(dirname: PathBuf, op_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            dirname,
            op_timeout,
            pending_read_bytes: AtomicI64::new(0),
            pending_write_bytes: AtomicI64::new(0),
        })
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    pub fn pending_read_bytes(&self) -> i64 {
        self.pending_read_bytes.load(Ordering::Relaxed)
    }

    pub fn pending_write_bytes(&self) -> i64 {
        self.pending_write_bytes.load(Ordering::Relaxed)
    }

    async fn run<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        let fut = tokio::task::spawn_blocking(f);
        let joined = if self.op_timeout.is_zero() {
            fut.await
        } else {
            match tokio::time::timeout(self.op_timeout, fut).await {
                Ok(joined) => joined,
                Err(_) => {
                    return make_error_msg(
                        ChunkCode::IO_TIMED_OUT,
                        format!("{} timed out on {}", what, self.dirname.display()),
                    );
                }
            }
        };
        match joined {
            Ok(res) => res.map_err(Status::from),
            Err(e) => make_error_msg(
                ChunkCode::IO_ERROR,
                format!("{} task failed: {}", what, e),
            ),
        }
    }

    /// Open (or create) a chunk file.
    pub async fn open(&self, path: PathBuf, create: bool) -> Result<Arc<ChunkFile>> {
        self.run("open", move || {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&path)?;
            Ok(ChunkFile::new(file))
        })
        .await
    }

    /// Positioned read. Returns the bytes actually present; a read at or
    /// beyond EOF returns an empty (or short) buffer, never an error.
    pub async fn pread(&self, file: Arc<ChunkFile>, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.pending_read_bytes.fetch_add(len as i64, Ordering::Relaxed);
        let res = self
            .run("read", move || {
                let mut buf = vec![0u8; len];
                let mut done = 0usize;
                while done < len {
                    let n = file.file.read_at(&mut buf[done..], offset + done as u64)?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                buf.truncate(done);
                Ok(buf)
            })
            .await;
        self.pending_read_bytes.fetch_sub(len as i64, Ordering::Relaxed);
        res
    }

    /// Positioned write of the whole buffer.
    pub async fn pwrite(&self, file: Arc<ChunkFile>, offset: u64, data: Vec<u8>) -> Result<usize> {
        let len = data.len();
        self.pending_write_bytes.fetch_add(len as i64, Ordering::Relaxed);
        let res = self
            .run("write", move || {
                file.file.write_all_at(&data, offset)?;
                Ok(len)
            })
            .await;
        self.pending_write_bytes.fetch_sub(len as i64, Ordering::Relaxed);
        res
    }

    pub async fn sync(&self, file: Arc<ChunkFile>) -> Result<()> {
        self.run("sync", move || file.file.sync_data()).await
    }

    pub async fn rename(&self, src: PathBuf, dst: PathBuf) -> Result<()> {
        self.run("rename", move || std::fs::rename(&src, &dst)).await
    }

    pub async fn delete(&self, path: PathBuf) -> Result<()> {
        self.run("delete", move || std::fs::remove_file(&path)).await
    }

    pub async fn truncate(&self, path: PathBuf, len: u64) -> Result<()> {
        self.run("truncate", move || {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(len)
        })
        .await
    }

    /// Whether a plain file exists at `path`; ENOENT is the normal case
    /// for sentinel probes.
    pub async fn file_exists(&self, path: PathBuf) -> Result<bool> {
        self.run("stat", move || match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    /// Readability probe: the directory must enumerate.
    pub async fn check_dir_readable(&self) -> Result<()> {
        let dir = self.dirname.clone();
        self.run("check-dir-readable", move || {
            let mut entries = std::fs::read_dir(&dir)?;
            // Force at least one entry to be materialized.
            if let Some(entry) = entries.next() {
                entry?;
            }
            Ok(())
        })
        .await
    }

    /// Free/total space of the backing file system.
    pub async fn stat_fs(&self) -> Result<FsSpace> {
        let dir = self.dirname.clone();
        self.run("stat-fs", move || statvfs(&dir)).await
    }
}

fn statvfs(path: &Path) -> std::io::Result<FsSpace> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(FsSpace {
        available: st.f_bavail as i64 * st.f_frsize as i64,
        total: st.f_blocks as i64 * st.f_frsize as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nimbus-diskio-{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn queue(dir: &Path) -> Arc<DiskQueue> {
        DiskQueue::new(dir.to_path_buf(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_open_write_read_roundtrip() {
        let dir = test_dir("rw");
        let q = queue(&dir);

        let file = q.open(dir.join("7.42.0"), true).await.unwrap();
        q.pwrite(file.clone(), 0, b"hello chunks".to_vec())
            .await
            .unwrap();
        let data = q.pread(file.clone(), 6, 6).await.unwrap();
        assert_eq!(&data, b"chunks");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_pread_past_eof_is_short() {
        let dir = test_dir("eof");
        let q = queue(&dir);
        let file = q.open(dir.join("f"), true).await.unwrap();
        q.pwrite(file.clone(), 0, vec![1, 2, 3]).await.unwrap();

        let data = q.pread(file.clone(), 1, 100).await.unwrap();
        assert_eq!(data, vec![2, 3]);
        let empty = q.pread(file, 100, 10).await.unwrap();
        assert!(empty.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_ids_are_unique() {
        let dir = test_dir("ids");
        let q = queue(&dir);
        let a = q.open(dir.join("a"), true).await.unwrap();
        let b = q.open(dir.join("b"), true).await.unwrap();
        assert_ne!(a.id(), b.id());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let dir = test_dir("rename");
        let q = queue(&dir);
        let _f = q.open(dir.join("src"), true).await.unwrap();
        q.rename(dir.join("src"), dir.join("dst")).await.unwrap();
        assert!(!dir.join("src").exists());
        assert!(dir.join("dst").exists());
        q.delete(dir.join("dst")).await.unwrap();
        assert!(!dir.join("dst").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_exists_probe() {
        let dir = test_dir("exists");
        let q = queue(&dir);
        assert!(!q.file_exists(dir.join("evacuate")).await.unwrap());
        std::fs::write(dir.join("evacuate"), b"").unwrap();
        assert!(q.file_exists(dir.join("evacuate")).await.unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_stat_fs_reports_space() {
        let dir = test_dir("statfs");
        let q = queue(&dir);
        let space = q.stat_fs().await.unwrap();
        assert!(space.total > 0);
        assert!(space.available >= 0);
        assert!(space.available <= space.total);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_check_dir_readable() {
        let dir = test_dir("readable");
        let q = queue(&dir);
        assert!(q.check_dir_readable().await.is_ok());

        let gone = DiskQueue::new(dir.join("missing"), Duration::from_secs(5));
        assert!(gone.check_dir_readable().await.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_pending_counters_settle_to_zero() {
        let dir = test_dir("pending");
        let q = queue(&dir);
        let file = q.open(dir.join("f"), true).await.unwrap();
        q.pwrite(file.clone(), 0, vec![0u8; 4096]).await.unwrap();
        q.pread(file, 0, 4096).await.unwrap();
        assert_eq!(q.pending_read_bytes(), 0);
        assert_eq!(q.pending_write_bytes(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
