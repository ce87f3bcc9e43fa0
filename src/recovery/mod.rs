//! Crash recovery: manifest backups, hung-process detection, and the
//! recover-first validation every step runs before touching a job.

pub mod manager;
pub mod observer;
pub mod sentinel;

pub use manager::{ConsistencyReport, CrashedJob, RecoveryManager, SystemHealth};
pub use observer::{Confidence, LogObserver, ObserverReport, StateDetection};
pub use sentinel::{HangDetection, HangSeverity, Sentinel, SentinelConfig, SentinelHandle};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{HistoryEntry, JobState, Manifest, events};
use crate::store::{ManifestStore, ManifestUpdate, StoreError, load_manifest, manifest_path};

/// How long a job may sit in an executing state without history activity
/// before it counts as hung.
pub const DEFAULT_HUNG_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Rolling manifest backups retained per job.
pub const MAX_MANIFEST_BACKUPS: usize = 5;

const BACKUP_DIR: &str = ".backups";

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no manifest to backup at {}", .0.display())]
    NoManifestToBackup(PathBuf),

    #[error("no backups available for recovery in {}", .0.display())]
    NoBackupsAvailable(PathBuf),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create a timestamped backup of the job manifest, pruning to the rolling
/// window.
pub fn create_backup(job_dir: &Path) -> Result<PathBuf, RecoveryError> {
    let manifest = manifest_path(job_dir);
    if !manifest.exists() {
        return Err(RecoveryError::NoManifestToBackup(manifest));
    }

    let backup_dir = job_dir.join(BACKUP_DIR);
    std::fs::create_dir_all(&backup_dir).map_err(|source| RecoveryError::Io {
        path: backup_dir.clone(),
        source,
    })?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = backup_dir.join(format!("job_manifest_{stamp}.json.backup"));

    std::fs::copy(&manifest, &backup_path).map_err(|source| RecoveryError::Io {
        path: backup_path.clone(),
        source,
    })?;

    prune_old_backups(&backup_dir, MAX_MANIFEST_BACKUPS);

    Ok(backup_path)
}

fn list_backups(backup_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return Vec::new();
    };

    let mut backups: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("job_manifest_") && n.ends_with(".backup"))
        })
        .collect();

    // Timestamped names sort chronologically.
    backups.sort();
    backups
}

fn prune_old_backups(backup_dir: &Path, keep: usize) {
    let backups = list_backups(backup_dir);
    if backups.len() <= keep {
        return;
    }
    let excess = backups.len() - keep;
    for old in backups.into_iter().take(excess) {
        let _ = std::fs::remove_file(old);
    }
}

/// Restore the manifest from the newest backup when the canonical file is
/// missing or corrupt. Returns the backup used, or `None` when the current
/// manifest is fine.
pub fn restore_from_backup(job_dir: &Path) -> Result<Option<PathBuf>, RecoveryError> {
    if load_manifest(job_dir).is_ok() {
        return Ok(None);
    }

    let backup_dir = job_dir.join(BACKUP_DIR);
    let latest = list_backups(&backup_dir)
        .pop()
        .ok_or_else(|| RecoveryError::NoBackupsAvailable(job_dir.to_path_buf()))?;

    std::fs::copy(&latest, manifest_path(job_dir)).map_err(|source| RecoveryError::Io {
        path: latest.clone(),
        source,
    })?;

    // The restored file must itself parse before we trust it.
    load_manifest(job_dir)?;

    Ok(Some(latest))
}

/// What automatic recovery should do with a hung job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// A stalled worker pass: back to PENDING for a retry.
    WorkerRecovery,
    /// A stalled supervisor pass: back to REVIEW_REQUIRED.
    SupervisorRecovery,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::WorkerRecovery => "worker_recovery",
            RecoveryAction::SupervisorRecovery => "supervisor_recovery",
        }
    }

    pub fn target_status(&self) -> JobState {
        match self {
            RecoveryAction::WorkerRecovery => JobState::Pending,
            RecoveryAction::SupervisorRecovery => JobState::ReviewRequired,
        }
    }
}

/// Detect a hung execution from the manifest alone: an executing status
/// whose newest history timestamp is older than `timeout`. A job with no
/// timestamped history just started and is not hung yet.
pub fn detect_hung(manifest: &Manifest, timeout: Duration) -> Option<RecoveryAction> {
    let action = match manifest.status {
        JobState::Reviewing => RecoveryAction::SupervisorRecovery,
        s if s.is_executing() => RecoveryAction::WorkerRecovery,
        _ => return None,
    };

    let last_activity = manifest.last_activity()?;
    let idle = Utc::now().signed_duration_since(last_activity);

    if idle.to_std().ok()? > timeout {
        Some(action)
    } else {
        None
    }
}

/// Apply a recovery action, preserving metrics and recording the trigger.
pub fn perform_automatic_recovery(
    store: &ManifestStore,
    job_dir: &Path,
    action: RecoveryAction,
) -> Result<Manifest, RecoveryError> {
    let manifest = store.load(job_dir)?;
    let previous_status = manifest.status;
    let new_status = action.target_status();

    let description = match action {
        RecoveryAction::WorkerRecovery => "Recovered hung worker execution",
        RecoveryAction::SupervisorRecovery => "Recovered hung supervisor review",
    };

    let entry = HistoryEntry::lifecycle(events::AUTOMATIC_RECOVERY, description)
        .with_detail("recovery_action", serde_json::json!(action.as_str()))
        .with_detail(
            "previous_status",
            serde_json::json!(previous_status.to_string()),
        )
        .with_detail(
            "reason",
            serde_json::json!("Process detected as hung based on timeout"),
        );

    let updated = store.update(
        job_dir,
        ManifestUpdate::status(new_status).with_history(entry),
    )?;

    tracing::info!(
        job_id = %updated.job_id,
        from = %previous_status,
        to = %new_status,
        "automatic recovery applied"
    );

    Ok(updated)
}

/// Outcome of the recover-first validation.
#[derive(Debug, Default)]
pub struct PersistenceReport {
    pub recovered: bool,
    pub recovery_from: Option<String>,
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Called at the top of every step: make sure the manifest loads
/// (restoring from backup when it doesn't) and recover a hung execution
/// before anyone builds on stale state.
pub fn validate_state_persistence(store: &ManifestStore, job_dir: &Path) -> PersistenceReport {
    let mut report = PersistenceReport::default();

    match store.load(job_dir) {
        Ok(manifest) => {
            if let Some(action) = detect_hung(&manifest, DEFAULT_HUNG_TIMEOUT) {
                match perform_automatic_recovery(store, job_dir, action) {
                    Ok(_) => {
                        report.recovered = true;
                        report.recovery_from = Some(action.as_str().to_string());
                        report.valid = true;
                    }
                    Err(e) => report.errors.push(format!("automatic recovery failed: {e}")),
                }
            } else {
                report.valid = true;
            }
        }
        Err(load_error) => match restore_from_backup(job_dir) {
            Ok(_) => {
                report.recovered = true;
                report.recovery_from = Some("backup_recovery".to_string());
                report.valid = true;
            }
            Err(restore_error) => {
                report.errors.push(format!("manifest load failed: {load_error}"));
                report
                    .errors
                    .push(format!("backup recovery failed: {restore_error}"));
            }
        },
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::save_manifest;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn seed(jobs_dir: &Path, job_id: &str, status: JobState) -> PathBuf {
        let job_dir = jobs_dir.join(job_id);
        std::fs::create_dir_all(&job_dir).unwrap();
        let mut manifest = Manifest::new(job_id, None);
        manifest.status = status;
        save_manifest(&job_dir, &manifest).unwrap();
        job_dir
    }

    fn backdate_last_history(job_dir: &Path, minutes: i64) {
        let mut manifest = load_manifest(job_dir).unwrap();
        if let Some(last) = manifest.history.last_mut() {
            last.timestamp = Some(Utc::now() - ChronoDuration::minutes(minutes));
        }
        save_manifest(job_dir, &manifest).unwrap();
    }

    #[test]
    fn backup_and_prune() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Pending);

        let backup = create_backup(&job_dir).unwrap();
        assert!(backup.exists());

        // Fake extra backups past the window.
        let backup_dir = job_dir.join(BACKUP_DIR);
        for i in 0..7 {
            std::fs::write(
                backup_dir.join(format!("job_manifest_2024010{i}_000000.json.backup")),
                "{}",
            )
            .unwrap();
        }
        prune_old_backups(&backup_dir, MAX_MANIFEST_BACKUPS);
        assert_eq!(list_backups(&backup_dir).len(), MAX_MANIFEST_BACKUPS);
    }

    #[test]
    fn restore_replaces_corrupt_manifest() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Pending);
        create_backup(&job_dir).unwrap();

        std::fs::write(manifest_path(&job_dir), "{corrupt").unwrap();

        let used = restore_from_backup(&job_dir).unwrap();
        assert!(used.is_some());

        let manifest = load_manifest(&job_dir).unwrap();
        assert_eq!(manifest.status, JobState::Pending);
    }

    #[test]
    fn restore_is_noop_for_healthy_manifest() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Pending);
        assert!(restore_from_backup(&job_dir).unwrap().is_none());
    }

    #[test]
    fn restore_without_backups_is_typed() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Pending);
        std::fs::write(manifest_path(&job_dir), "{corrupt").unwrap();

        assert!(matches!(
            restore_from_backup(&job_dir),
            Err(RecoveryError::NoBackupsAvailable(_))
        ));
    }

    #[test]
    fn hung_detection_requires_stale_timestamp() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Running);

        // Fresh history: not hung.
        let manifest = load_manifest(&job_dir).unwrap();
        assert!(detect_hung(&manifest, DEFAULT_HUNG_TIMEOUT).is_none());

        backdate_last_history(&job_dir, 45);
        let manifest = load_manifest(&job_dir).unwrap();
        assert_eq!(
            detect_hung(&manifest, DEFAULT_HUNG_TIMEOUT),
            Some(RecoveryAction::WorkerRecovery)
        );
    }

    #[test]
    fn reviewing_maps_to_supervisor_recovery() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Reviewing);
        backdate_last_history(&job_dir, 45);

        let manifest = load_manifest(&job_dir).unwrap();
        assert_eq!(
            detect_hung(&manifest, DEFAULT_HUNG_TIMEOUT),
            Some(RecoveryAction::SupervisorRecovery)
        );
    }

    #[test]
    fn non_executing_states_never_hang() {
        let tmp = TempDir::new().unwrap();
        for status in [JobState::Pending, JobState::Success, JobState::ReviewRequired] {
            let job_dir = seed(tmp.path(), &format!("{status}"), status);
            backdate_last_history(&job_dir, 500);
            let manifest = load_manifest(&job_dir).unwrap();
            assert!(detect_hung(&manifest, DEFAULT_HUNG_TIMEOUT).is_none());
        }
    }

    #[test]
    fn automatic_recovery_preserves_metrics() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Running);

        let mut manifest = load_manifest(&job_dir).unwrap();
        manifest.metrics.cumulative_cost = 1.25;
        save_manifest(&job_dir, &manifest).unwrap();

        let store = ManifestStore::new(tmp.path());
        let recovered =
            perform_automatic_recovery(&store, &job_dir, RecoveryAction::WorkerRecovery).unwrap();

        assert_eq!(recovered.status, JobState::Pending);
        assert_eq!(recovered.metrics.cumulative_cost, 1.25);

        let last = recovered.history.last().unwrap();
        assert_eq!(last.event.as_deref(), Some(events::AUTOMATIC_RECOVERY));
        assert_eq!(
            last.extra.get("previous_status"),
            Some(&serde_json::json!("RUNNING"))
        );
    }

    #[test]
    fn validate_state_persistence_recovers_hung_job() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Running);
        backdate_last_history(&job_dir, 45);

        let store = ManifestStore::new(tmp.path());
        let report = validate_state_persistence(&store, &job_dir);

        assert!(report.recovered);
        assert_eq!(report.recovery_from.as_deref(), Some("worker_recovery"));
        assert!(report.valid);

        let manifest = load_manifest(&job_dir).unwrap();
        assert_eq!(manifest.status, JobState::Pending);
    }

    #[test]
    fn validate_state_persistence_restores_from_backup() {
        let tmp = TempDir::new().unwrap();
        let job_dir = seed(tmp.path(), "j1", JobState::Pending);
        create_backup(&job_dir).unwrap();
        std::fs::write(manifest_path(&job_dir), "garbage").unwrap();

        let store = ManifestStore::new(tmp.path());
        let report = validate_state_persistence(&store, &job_dir);

        assert!(report.recovered);
        assert_eq!(report.recovery_from.as_deref(), Some("backup_recovery"));
    }
}
