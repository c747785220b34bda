//! Build-tree-wide lock over a cache directory.
//!
//! Two layers: an exclusive `fs4` lock on `modules.lock`, taken on first
//! access and held until [`CacheAccess::close`], and an in-process mutex that
//! turns every cache operation into a short critical section.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs4::FileExt;

use super::CacheError;

const LOCK_FILE: &str = "modules.lock";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const LOCK_POLL: Duration = Duration::from_millis(50);

/// Lock state of one cache directory.
#[derive(Debug)]
pub struct CacheAccess {
    dir: PathBuf,
    lock_timeout: Duration,
    lock: Mutex<Option<File>>,
}

impl CacheAccess {
    /// Unlocked access to `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock: Mutex::new(None),
        }
    }

    /// How long to wait for another process to release the lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `f` inside the critical section, acquiring the cross-process lock
    /// first if this process does not hold it yet.
    ///
    /// # Errors
    ///
    /// Propagates lock acquisition failures and whatever `f` returns.
    pub fn with_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut guard = self.lock.lock().map_err(|_| CacheError::Poisoned)?;
        if guard.is_none() {
            *guard = Some(acquire(&self.dir.join(LOCK_FILE), self.lock_timeout)?);
        }
        f()
    }

    /// Whether this process holds the cross-process lock.
    pub fn is_locked(&self) -> bool {
        self.lock.lock().is_ok_and(|guard| guard.is_some())
    }

    /// Release the cross-process lock. The next access takes it again.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Poisoned`] if a previous holder panicked.
    pub fn close(&self) -> Result<(), CacheError> {
        let mut guard = self.lock.lock().map_err(|_| CacheError::Poisoned)?;
        if let Some(file) = guard.take() {
            FileExt::unlock(&file).map_err(|e| CacheError::io(self.dir.join(LOCK_FILE), e))?;
            tracing::debug!("Released module cache lock at {}", self.dir.display());
        }
        Ok(())
    }
}

fn acquire(path: &Path, timeout: Duration) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CacheError::io(path, e))?;

    let started = Instant::now();
    let mut announced = false;
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!("Acquired module cache lock at {}", path.display());
                return Ok(file);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || is_sharing_violation(&e) => {
                if started.elapsed() >= timeout {
                    return Err(CacheError::LockTimeout {
                        timeout,
                        path: path.to_path_buf(),
                    });
                }
                if !announced {
                    tracing::info!("Waiting for module cache lock at {}", path.display());
                    announced = true;
                }
                std::thread::sleep(LOCK_POLL);
            }
            Err(e) => return Err(CacheError::io(path, e)),
        }
    }
}

#[cfg(windows)]
fn is_sharing_violation(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(32 | 33))
}

#[cfg(not(windows))]
fn is_sharing_violation(_e: &std::io::Error) -> bool {
    false
}
