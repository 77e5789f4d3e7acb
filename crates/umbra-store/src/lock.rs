//! Cross-process exclusive locking.
//!
//! All mutating store operations serialize through one advisory lock on a
//! companion file.  Callers only see the [`ExclusiveLock`] trait, so the
//! primitive underneath can differ per platform.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Result, StoreError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// An exclusive, scoped lock acquired with a bounded wait.
pub trait ExclusiveLock: Send + Sync + fmt::Debug {
    /// Block until the lock is held or `timeout` elapses.
    fn acquire(&self, timeout: Duration) -> Result<LockGuard>;
}

/// Proof that the lock is held. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Advisory `flock`/`LockFileEx` lock on a dedicated file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct HeldFileLock {
    file: File,
}

impl Drop for HeldFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl ExclusiveLock for FileLock {
    fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(StoreError::io("open lock file", &self.path))?;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!(path = %self.path.display(), "store lock acquired");
                    return Ok(LockGuard::new(HeldFileLock { file }));
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(StoreError::io("lock", &self.path)(e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                tracing::warn!(path = %self.path.display(), ?waited, "store lock timeout");
                return Err(StoreError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join(".users.lock"));

        let _held = lock.acquire(Duration::from_secs(1)).unwrap();
        let other = FileLock::new(dir.path().join(".users.lock"));
        let err = other.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join(".users.lock"));

        drop(lock.acquire(Duration::from_secs(1)).unwrap());
        assert!(lock.acquire(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock: Arc<dyn ExclusiveLock> = Arc::new(FileLock::new(dir.path().join(".users.lock")));

        let held = lock.acquire(Duration::from_secs(1)).unwrap();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire(Duration::from_secs(5)).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }
}
