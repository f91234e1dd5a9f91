//! Off-line chunk directory monitor.
//!
//! Directories that are unusable (lost, not yet mounted, or marked with a
//! do-not-use sentinel) are parked here. The checker periodically probes
//! them: a directory becomes available once it enumerates, carries none of
//! the do-not-use file names, and its exclusive lock file can be acquired.
//! The manager collects newly available directories on its timer tick.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nimbus_types::DeviceId;

/// Exclusive advisory lock on a directory's lock file; held for the
/// directory's whole in-use lifetime so two processes cannot share a
/// drive. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct DirLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(path: PathBuf) -> std::io::Result<DirLock> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(DirLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A directory the checker has admitted.
#[derive(Debug)]
pub struct AvailableDir {
    pub device_id: DeviceId,
    pub lock: DirLock,
}

#[derive(Debug, Clone)]
pub struct DirCheckerSettings {
    pub lock_file_name: String,
    /// File names whose presence blocks admission (e.g. `evacuate.done`).
    pub dont_use_names: Vec<String>,
    /// Sub-directories created on admission (dirty, stale).
    pub sub_dirs: Vec<String>,
    pub interval: Duration,
}

struct Inner {
    settings: DirCheckerSettings,
    /// Directories being monitored, with a previously held lock when the
    /// manager handed the directory back.
    pending: HashMap<PathBuf, Option<DirLock>>,
    available: HashMap<PathBuf, AvailableDir>,
    /// Wipe files found in a re-admitted directory; its chunks were
    /// already declared lost.
    remove_files: bool,
}

pub struct DirChecker {
    inner: Mutex<Inner>,
}

impl DirChecker {
    pub fn new(settings: DirCheckerSettings) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                settings,
                pending: HashMap::new(),
                available: HashMap::new(),
                remove_files: false,
            }),
        })
    }

    pub fn add(&self, dirname: PathBuf) {
        self.inner.lock().pending.entry(dirname).or_insert(None);
    }

    /// Hand a directory back for re-probing, keeping its lock held so no
    /// other process can claim the drive meanwhile.
    pub fn add_with_lock(&self, dirname: PathBuf, lock: Option<DirLock>) {
        self.inner.lock().pending.insert(dirname, lock);
    }

    pub fn remove(&self, dirname: &Path) {
        let mut inner = self.inner.lock();
        inner.pending.remove(dirname);
        inner.available.remove(dirname);
    }

    pub fn set_remove_files(&self, flag: bool) {
        self.inner.lock().remove_files = flag;
    }

    /// Probe every monitored directory once. Blocking; call from a
    /// blocking-friendly context.
    pub fn check_now(&self) {
        let mut inner = self.inner.lock();
        let dirs: Vec<PathBuf> = inner.pending.keys().cloned().collect();
        for dirname in dirs {
            let held = inner.pending.get_mut(&dirname).and_then(Option::take);
            match probe_dir(&dirname, &inner.settings, held, inner.remove_files) {
                ProbeOutcome::Available(dir) => {
                    info!(dir = %dirname.display(), device = %dir.device_id, "chunk directory available");
                    inner.pending.remove(&dirname);
                    inner.available.insert(dirname, dir);
                }
                ProbeOutcome::NotYet(lock) => {
                    *inner.pending.get_mut(&dirname).unwrap() = lock;
                }
            }
        }
    }

    /// Drain the set of directories that became available since the last
    /// call.
    pub fn get_newly_available(&self) -> HashMap<PathBuf, AvailableDir> {
        std::mem::take(&mut self.inner.lock().available)
    }

    /// Initial blocking scan used at startup.
    pub fn start(&self) -> HashMap<PathBuf, AvailableDir> {
        self.check_now();
        self.get_newly_available()
    }

    /// Periodic probe loop; exits when the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.inner.lock().settings.interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    let _ = tokio::task::spawn_blocking(move || this.check_now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

enum ProbeOutcome {
    Available(AvailableDir),
    NotYet(Option<DirLock>),
}

fn probe_dir(
    dirname: &Path,
    settings: &DirCheckerSettings,
    held_lock: Option<DirLock>,
    remove_files: bool,
) -> ProbeOutcome {
    let meta = match std::fs::metadata(dirname) {
        Ok(meta) if meta.is_dir() => meta,
        Ok(_) => {
            warn!(dir = %dirname.display(), "not a directory");
            return ProbeOutcome::NotYet(held_lock);
        }
        Err(e) => {
            debug!(dir = %dirname.display(), error = %e, "directory not accessible");
            return ProbeOutcome::NotYet(held_lock);
        }
    };

    for name in &settings.dont_use_names {
        if dirname.join(name).exists() {
            debug!(dir = %dirname.display(), sentinel = name.as_str(), "directory blocked by sentinel");
            return ProbeOutcome::NotYet(held_lock);
        }
    }

    let lock_path = dirname.join(&settings.lock_file_name);
    let lock = match held_lock {
        Some(lock) => lock,
        None => match DirLock::acquire(lock_path) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(dir = %dirname.display(), error = %e, "cannot lock directory");
                return ProbeOutcome::NotYet(None);
            }
        },
    };

    if remove_files {
        if let Err(e) = remove_regular_files(dirname, &settings.lock_file_name) {
            warn!(dir = %dirname.display(), error = %e, "cleanup of re-admitted directory failed");
            return ProbeOutcome::NotYet(Some(lock));
        }
    }

    for sub in &settings.sub_dirs {
        if let Err(e) = std::fs::create_dir_all(dirname.join(sub)) {
            warn!(dir = %dirname.display(), sub = sub.as_str(), error = %e, "cannot create sub directory");
            return ProbeOutcome::NotYet(Some(lock));
        }
    }

    ProbeOutcome::Available(AvailableDir {
        device_id: DeviceId(meta.dev()),
        lock,
    })
}

fn remove_regular_files(dirname: &Path, lock_file_name: &str) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dirname)? {
        let entry = entry?;
        if entry.file_name().to_str() == Some(lock_file_name) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            info!(path = %entry.path().display(), "removing file from re-admitted directory");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DirCheckerSettings {
        DirCheckerSettings {
            lock_file_name: "lock".into(),
            dont_use_names: vec!["evacuate.done".into()],
            sub_dirs: vec!["dirty".into(), "lost+found".into()],
            interval: Duration::from_secs(180),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nimbus-dircheck-{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_admits_good_directory() {
        let dir = test_dir("good");
        let checker = DirChecker::new(settings());
        checker.add(dir.clone());

        let available = checker.start();
        assert_eq!(available.len(), 1);
        let admitted = available.get(&dir).unwrap();
        assert!(*admitted.device_id > 0);
        assert!(dir.join("dirty").is_dir());
        assert!(dir.join("lost+found").is_dir());
        assert!(dir.join("lock").exists());

        // Nothing new on a second pass.
        assert!(checker.start().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_done_sentinel_blocks_admission() {
        let dir = test_dir("sentinel");
        std::fs::write(dir.join("evacuate.done"), b"").unwrap();
        let checker = DirChecker::new(settings());
        checker.add(dir.clone());

        assert!(checker.start().is_empty());

        // Operator removes the sentinel; the next probe admits the dir.
        std::fs::remove_file(dir.join("evacuate.done")).unwrap();
        assert_eq!(checker.start().len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_directory_stays_pending() {
        let dir = test_dir("missing-parent").join("absent");
        let checker = DirChecker::new(settings());
        checker.add(dir.clone());
        assert!(checker.start().is_empty());

        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(checker.start().len(), 1);
        let _ = std::fs::remove_dir_all(dir.parent().unwrap());
    }

    #[test]
    fn test_lock_conflict_blocks_admission() {
        let dir = test_dir("lock-conflict");
        let other = DirLock::acquire(dir.join("lock")).unwrap();

        let checker = DirChecker::new(settings());
        checker.add(dir.clone());
        assert!(checker.start().is_empty());

        drop(other);
        assert_eq!(checker.start().len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_remove_files_on_readmission() {
        let dir = test_dir("cleanup");
        std::fs::write(dir.join("1.2.3"), b"stale chunk").unwrap();

        let checker = DirChecker::new(settings());
        checker.set_remove_files(true);
        checker.add(dir.clone());
        let available = checker.start();
        assert_eq!(available.len(), 1);
        assert!(!dir.join("1.2.3").exists());
        assert!(dir.join("lock").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_held_lock_is_reused() {
        let dir = test_dir("held-lock");
        let lock = DirLock::acquire(dir.join("lock")).unwrap();

        let checker = DirChecker::new(settings());
        checker.add_with_lock(dir.clone(), Some(lock));
        let available = checker.start();
        assert_eq!(available.len(), 1);
        assert_eq!(available.get(&dir).unwrap().lock.path(), dir.join("lock"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
