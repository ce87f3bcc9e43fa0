//! Advisory per-job and index locks.
//!
//! Cooperative `fs2` locks: a process that doesn't take them can still
//! corrupt files, so every engine code path that mutates job state must go
//! through here. Acquisition polls every ~100 ms until the caller timeout.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock acquisition timeout after {seconds:.1}s: {}", .path.display())]
    Timeout { path: PathBuf, seconds: f64 },

    #[error("failed to access lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Holds an exclusive lock for as long as it lives; dropping the guard
/// releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(LockGuard {
                    _file: file,
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if started.elapsed() >= timeout {
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        seconds: timeout.as_secs_f64(),
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

fn try_acquire(path: &Path) -> Result<Option<LockGuard>, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard {
            _file: file,
            path: path.to_path_buf(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Lock paths and acquisition for one jobs directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    jobs_dir: PathBuf,
}

impl LockManager {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    fn job_lock_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id).join(".lock")
    }

    fn index_lock_path(&self) -> PathBuf {
        self.jobs_dir.join(".jobs_index.lock")
    }

    /// Exclusive lock on a job directory, blocking up to `timeout`.
    pub fn lock_job(&self, job_id: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        acquire(&self.job_lock_path(job_id), timeout)
    }

    /// Non-blocking probe; `None` means some other process holds the lock.
    pub fn try_lock_job(&self, job_id: &str) -> Result<Option<LockGuard>, LockError> {
        try_acquire(&self.job_lock_path(job_id))
    }

    /// Exclusive lock on the jobs index.
    pub fn lock_index(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        acquire(&self.index_lock_path(), timeout)
    }

    /// Remove lock files older than `max_age`, returning the affected job
    /// ids. Safe because content-critical files are only ever replaced via
    /// atomic renames, never modified in place under the lock alone.
    pub fn cleanup_stale_locks(&self, max_age: Duration) -> Vec<String> {
        let mut cleaned = Vec::new();
        let now = std::time::SystemTime::now();

        let Ok(entries) = std::fs::read_dir(&self.jobs_dir) else {
            return cleaned;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || name.starts_with('.') {
                continue;
            }

            let lock_file = path.join(".lock");
            if is_older_than(&lock_file, now, max_age) && std::fs::remove_file(&lock_file).is_ok() {
                cleaned.push(name.to_string());
            }
        }

        let index_lock = self.index_lock_path();
        if is_older_than(&index_lock, now, max_age) {
            let _ = std::fs::remove_file(&index_lock);
        }

        cleaned
    }
}

fn is_older_than(path: &Path, now: std::time::SystemTime, max_age: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    now.duration_since(modified)
        .map(|age| age >= max_age)
        .unwrap_or(false)
}
