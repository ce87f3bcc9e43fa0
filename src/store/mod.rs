//! Manifest persistence: atomic writes, rolling backups, and the side
//! effects of terminal transitions.

mod directory;
mod index;
mod locks;

pub use directory::{DirectoryManager, JobInfo, find_jobs_directory};
pub use index::{ArchivedJob, INDEX_FILE, IndexStore, JobsIndex};
pub use locks::{LockError, LockGuard, LockManager};

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{HistoryEntry, JobState, Manifest, events};
use crate::workspace::cleanup::{self, CleanupPolicy};

pub const MANIFEST_FILE: &str = "job_manifest.json";
pub const JOB_HISTORY_FILE: &str = "jobHistory.json";

const INDEX_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job manifest not found at: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("invalid job manifest JSON in {}: {message}", .path.display())]
    ManifestCorrupt { path: PathBuf, message: String },

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

pub fn manifest_path(job_dir: &Path) -> PathBuf {
    job_dir.join(MANIFEST_FILE)
}

/// Write JSON with the write-temp-then-rename pattern so a crash mid-write
/// never clobbers the canonical file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    use std::io::Write;

    let content = serde_json::to_string_pretty(value)?;

    let tmp_path = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => path.with_file_name(format!("{name}.tmp")),
        None => path.with_extension("tmp"),
    };

    let io_err = |source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    };

    let mut tmp = std::fs::File::create(&tmp_path).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.sync_all().map_err(io_err)?;

    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Load a manifest from a job directory.
pub fn load_manifest(job_dir: &Path) -> Result<Manifest, StoreError> {
    let path = manifest_path(job_dir);
    if !path.exists() {
        return Err(StoreError::ManifestMissing(path));
    }

    let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|e| StoreError::ManifestCorrupt {
        path,
        message: e.to_string(),
    })
}

/// Save a manifest without touching `updated_at`, so a load-save-reload
/// cycle of an unchanged manifest is byte-identical after normalization.
pub fn save_manifest(job_dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    write_json_atomic(&manifest_path(job_dir), manifest)
}

/// A batched mutation of a job manifest.
#[derive(Debug, Default)]
pub struct ManifestUpdate {
    pub new_status: Option<JobState>,
    pub new_phase: Option<String>,
    pub cost_delta: f64,
    pub time_delta: f64,
    pub history_entry: Option<HistoryEntry>,
    /// Recovery flows that already hold a backup set this.
    pub skip_backup: bool,
}

impl ManifestUpdate {
    pub fn status(status: JobState) -> Self {
        Self {
            new_status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, entry: HistoryEntry) -> Self {
        self.history_entry = Some(entry);
        self
    }

    fn is_mutating(&self) -> bool {
        self.new_status.is_some()
            || self.new_phase.is_some()
            || self.cost_delta > 0.0
            || self.time_delta > 0.0
            || self.history_entry.is_some()
    }
}

/// Mutating access to job manifests, with backups before every change and
/// the queue/cleanup side effects of terminal transitions.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    index: IndexStore,
    cleanup_policy: CleanupPolicy,
}

impl ManifestStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            index: IndexStore::new(jobs_dir),
            cleanup_policy: CleanupPolicy::default(),
        }
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn load(&self, job_dir: &Path) -> Result<Manifest, StoreError> {
        load_manifest(job_dir)
    }

    /// Load, back up, mutate, save. Every mutating call writes a fresh
    /// timestamped backup first unless the caller already holds one. A
    /// write failure after the backup leaves the previous manifest intact;
    /// the caller must not advance state past it.
    pub fn update(&self, job_dir: &Path, update: ManifestUpdate) -> Result<Manifest, StoreError> {
        let mut manifest = self.load(job_dir)?;

        if !update.is_mutating() {
            return Ok(manifest);
        }

        if !update.skip_backup {
            if let Err(e) = crate::recovery::create_backup(job_dir) {
                tracing::warn!("failed to create job manifest backup: {e}");
            }
        }

        if let Some(status) = update.new_status {
            manifest.status = status;
        }
        if let Some(phase) = update.new_phase {
            manifest.current_phase = Some(phase);
        }
        if update.cost_delta > 0.0 {
            manifest.metrics.cumulative_cost += update.cost_delta;
        }
        if update.time_delta > 0.0 {
            manifest.metrics.cumulative_time_seconds += update.time_delta;
        }
        if let Some(mut entry) = update.history_entry {
            if entry.timestamp.is_none() {
                entry.timestamp = Some(Utc::now());
            }
            if entry.is_executor_step() {
                manifest.metrics.step_count += 1;
            }
            manifest.history.push(entry);
        }

        manifest.updated_at = Utc::now();
        save_manifest(job_dir, &manifest)?;

        if update.new_status.is_some_and(|s| s.is_terminal()) {
            self.on_terminal_transition(job_dir, &mut manifest);
        }

        Ok(manifest)
    }

    /// Queue removal and workspace-cleanup evaluation after a terminal
    /// write. Both are best-effort: a failure here must not unwind the
    /// status change that already landed on disk.
    fn on_terminal_transition(&self, job_dir: &Path, manifest: &mut Manifest) {
        let job_id = manifest.job_id.clone();

        let dequeued = self.index.with_lock(INDEX_LOCK_TIMEOUT, |index| {
            index.remove_from_queue(&job_id)
        });
        match dequeued {
            Ok(true) => tracing::debug!(job_id, "removed terminal job from queue"),
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id, "failed to dequeue terminal job: {e}"),
        }

        match cleanup::cleanup_if_eligible(job_dir, &self.cleanup_policy) {
            Ok(Some(report)) => {
                let entry = HistoryEntry::lifecycle(
                    events::WORKSPACE_CLEANUP,
                    format!("Workspace cleaned up on transition to {}", manifest.status),
                )
                .with_detail("reason", serde_json::json!(report.reason))
                .with_detail(
                    "backup_created",
                    serde_json::json!(report.backup_archive.display().to_string()),
                );
                let mut entry = entry;
                entry.timestamp = Some(Utc::now());
                manifest.history.push(entry);
                if let Err(e) = save_manifest(job_dir, manifest) {
                    tracing::warn!(job_id, "failed to record workspace cleanup: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id, "workspace cleanup evaluation failed: {e}"),
        }
    }

    /// Append one interaction record to the secondary `jobHistory.json`
    /// log. Best-effort by design.
    pub fn record_interaction(&self, job_dir: &Path, record: serde_json::Value) {
        let path = job_dir.join(JOB_HISTORY_FILE);

        let mut log: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        log.push(record);

        if let Err(e) = write_json_atomic(&path, &log) {
            tracing::warn!("failed to write job history entry: {e}");
        }
    }
}
