//! The process-wide jobs index: registered jobs, the run queue, and the
//! currently selected job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::locks::LockManager;
use super::{StoreError, write_json_atomic};

pub const INDEX_FILE: &str = "jobs_index.json";

/// Audit record for a cleaned-up job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub job_id: String,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

/// Contents of `jobs_index.json`.
///
/// Invariant: every `queue` entry is a key of `jobs`. Mutations happen only
/// under the index lock (see `IndexStore::with_lock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsIndex {
    #[serde(default = "default_version")]
    pub version: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub current_job_id: Option<String>,

    #[serde(default)]
    pub jobs: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub queue: Vec<String>,

    #[serde(default)]
    pub archived_jobs: Vec<ArchivedJob>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for JobsIndex {
    fn default() -> Self {
        Self {
            version: default_version(),
            created_at: Utc::now(),
            current_job_id: None,
            jobs: BTreeMap::new(),
            queue: Vec::new(),
            archived_jobs: Vec::new(),
        }
    }
}

impl JobsIndex {
    /// Queue a job at `rank` (front = 0), appending when the rank is past
    /// the end. Deduplicates: an already-queued job moves to the new slot.
    pub fn enqueue(&mut self, job_id: &str, rank: Option<usize>) {
        self.queue.retain(|id| id != job_id);
        match rank {
            Some(r) if r < self.queue.len() => self.queue.insert(r, job_id.to_string()),
            _ => self.queue.push(job_id.to_string()),
        }
    }

    pub fn remove_from_queue(&mut self, job_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != job_id);
        self.queue.len() != before
    }

    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        self.queue.iter().position(|id| id == job_id)
    }

    /// Drop a job entirely: registration, queue slot, current selection;
    /// records an audit entry.
    pub fn archive(&mut self, job_id: &str, reason: &str) {
        self.jobs.remove(job_id);
        self.remove_from_queue(job_id);
        if self.current_job_id.as_deref() == Some(job_id) {
            self.current_job_id = None;
        }
        self.archived_jobs.push(ArchivedJob {
            job_id: job_id.to_string(),
            archived_at: Utc::now(),
            reason: reason.to_string(),
        });
    }
}

/// Serialized access to `jobs_index.json`.
#[derive(Debug, Clone)]
pub struct IndexStore {
    jobs_dir: PathBuf,
    locks: LockManager,
}

impl IndexStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        let jobs_dir = jobs_dir.into();
        Self {
            locks: LockManager::new(&jobs_dir),
            jobs_dir,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.jobs_dir.join(INDEX_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Best-effort lock-free read; a missing or corrupt index reads as
    /// empty. Callers that mutate must use `with_lock` instead.
    pub fn read(&self) -> JobsIndex {
        std::fs::read_to_string(self.path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn save(&self, index: &JobsIndex) -> Result<(), StoreError> {
        write_json_atomic(&self.path(), index)
    }

    /// Create the index file if absent.
    pub fn ensure(&self) -> Result<(), StoreError> {
        if !self.exists() {
            self.save(&JobsIndex::default())?;
        }
        Ok(())
    }

    /// Load-mutate-save under the index lock.
    pub fn with_lock<T>(
        &self,
        timeout: Duration,
        mutate: impl FnOnce(&mut JobsIndex) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.locks.lock_index(timeout)?;
        let mut index = self.read();
        let result = mutate(&mut index);
        self.save(&index)?;
        Ok(result)
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }
}
