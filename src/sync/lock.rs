//! Named cross-process lock backed by `flock(2)`
//!
//! Each acquisition opens its own file description, so two handles in the
//! same process exclude each other exactly like two processes do. The lock
//! is not re-entrant: taking the same named lock twice on one call chain
//! deadlocks.

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock; released on drop or through [`LockGuard::release`].
pub struct LockGuard {
    flock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until no other holder exists.
    pub fn acquire(&self) -> Result<LockGuard> {
        let file = self.open()?;
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(flock) => Ok(self.guard(flock)),
            Err((_, errno)) => Err(self.lock_error(errno)),
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let mut file = self.open()?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => return Ok(self.guard(flock)),
                Err((f, Errno::EAGAIN)) => {
                    if started.elapsed() >= timeout {
                        return Err(Error::LockTimeout {
                            path: self.path.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    file = f;
                    thread::sleep(POLL_INTERVAL);
                }
                Err((_, errno)) => return Err(self.lock_error(errno)),
            }
        }
    }

    /// Run `f` while holding the lock. The lock is released on every exit path.
    pub fn with<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        f()
    }

    fn open(&self) -> Result<File> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| Error::Lock {
                path: self.path.clone(),
                source,
            })?;
        }

        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|source| Error::Lock {
                path: self.path.clone(),
                source,
            })
    }

    fn guard(&self, flock: Flock<File>) -> LockGuard {
        debug!("Acquired lock {}", self.path.display());
        LockGuard {
            flock,
            path: self.path.clone(),
        }
    }

    fn lock_error(&self, errno: Errno) -> Error {
        Error::Lock {
            path: self.path.clone(),
            source: std::io::Error::from(errno),
        }
    }
}

impl LockGuard {
    pub fn release(self) -> Result<()> {
        let path = self.path;
        match self.flock.unlock() {
            Ok(_) => {
                debug!("Released lock {}", path.display());
                Ok(())
            }
            Err((_, errno)) => Err(Error::Lock {
                path,
                source: std::io::Error::from(errno),
            }),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("test.lock"));

        let held = lock.acquire().unwrap();
        assert!(format!("{:?}", held).contains("test.lock"));
        let err = lock.acquire_timeout(Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        held.release().unwrap();
        assert!(lock.acquire_timeout(Duration::from_millis(60)).is_ok());
    }

    #[test]
    fn test_released_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("test.lock"));

        let res: Result<()> = lock.with(|| Err(Error::InvalidSelector("boom".into())));
        assert!(res.is_err());
        assert!(lock.acquire_timeout(Duration::from_millis(60)).is_ok());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = FileLock::new(&path);
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        lock.with(|| {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(1));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
