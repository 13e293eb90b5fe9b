//! Cross-process advisory lock on a sidecar file
//!
//! The lock lives on `<state file>.lock` rather than on the state file itself,
//! because the state file is replaced by rename on every write and a lock held
//! on the old inode would not exclude a writer that opens the new one.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, StateError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// How the lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers at once
    Shared,
    /// One writer, no readers that also lock
    Exclusive,
}

/// Held lock on a state file; released on drop
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl StateLock {
    /// Acquire a lock on `path`, polling until `timeout` elapses
    ///
    /// The lock file is created if missing. Every call opens its own handle, so
    /// two threads of one process contend exactly like two processes do.
    pub fn acquire(path: impl AsRef<Path>, mode: LockMode, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match try_lock(&file, mode) {
                Ok(()) => {
                    debug!(path = %path.display(), ?mode, "Acquired state lock");
                    return Ok(Self { file, path, mode });
                }
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(path = %path.display(), ?timeout, "Gave up waiting for state lock");
                        return Err(StateError::LockTimeout { path, timeout });
                    }
                    thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(StateError::io(&path, e)),
            }
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the lock is held in
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        } else {
            debug!(path = %self.path.display(), "Released state lock");
        }
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("state.json.lock");

        let held = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        assert_eq!(held.mode(), LockMode::Exclusive);

        let started = Instant::now();
        let err = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, StateError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("state.json.lock");

        {
            let _held = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        }

        let again = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_millis(50));
        assert!(again.is_ok());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("state.json.lock");

        let first = StateLock::acquire(&lock_path, LockMode::Shared, Duration::from_millis(50)).unwrap();
        let second = StateLock::acquire(&lock_path, LockMode::Shared, Duration::from_millis(50)).unwrap();
        assert_eq!(first.path(), second.path());

        let err = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_millis(50)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("state.json.lock");

        let held = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        let waiter_path = lock_path.clone();
        let waiter = thread::spawn(move || StateLock::acquire(waiter_path, LockMode::Exclusive, Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("missing").join("state.json.lock");

        let err = StateLock::acquire(&lock_path, LockMode::Exclusive, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }
}
