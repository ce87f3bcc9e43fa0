//! Advanced recovery operations: crash detection, reattachment, bulk
//! recovery, and the consistency audit.

use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{RecoveryError, detect_hung, perform_automatic_recovery};
use crate::domain::{HistoryEntry, JobState, Manifest, events};
use crate::store::{DirectoryManager, LockManager, ManifestStore, ManifestUpdate, load_manifest};

const STALE_LOCK_REAP_AGE: Duration = Duration::from_secs(300);

/// A job that looks crashed: executing on paper, but nobody holds its lock.
#[derive(Debug, Clone)]
pub struct CrashedJob {
    pub job_id: String,
    pub status: String,
    pub reason: String,
    pub directory: PathBuf,
}

/// Per-job recovery outcome.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub job_id: String,
    pub recovered: bool,
    pub actions_taken: Vec<String>,
    pub errors: Vec<String>,
}

/// Reattachment probe result.
#[derive(Debug, Default)]
pub struct ReattachReport {
    pub job_id: String,
    pub reattached: bool,
    pub status: String,
    pub process_running: bool,
    pub errors: Vec<String>,
}

/// Consistency audit result for one job.
#[derive(Debug)]
pub struct ConsistencyReport {
    pub job_id: String,
    pub consistent: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Overall verdict of the system-wide audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHealth {
    Healthy,
    NeedsAttention,
    Critical,
}

impl std::fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemHealth::Healthy => write!(f, "healthy"),
            SystemHealth::NeedsAttention => write!(f, "needs_attention"),
            SystemHealth::Critical => write!(f, "critical"),
        }
    }
}

/// System-wide recovery status.
#[derive(Debug)]
pub struct RecoveryStatusReport {
    pub crashed_jobs: Vec<CrashedJob>,
    pub inconsistent_jobs: Vec<ConsistencyReport>,
    pub recovery_needed: Vec<String>,
    pub system_health: SystemHealth,
}

/// Bulk recovery totals.
#[derive(Debug, Default)]
pub struct BulkRecoveryReport {
    pub total_jobs_processed: usize,
    pub successful_recoveries: usize,
    pub failed_recoveries: usize,
    pub job_results: Vec<RecoveryOutcome>,
}

/// Orchestrates recovery across a jobs directory.
pub struct RecoveryManager {
    directory: DirectoryManager,
    locks: LockManager,
    store: ManifestStore,
    hung_timeout: Duration,
    lock_timeout: Duration,
}

impl RecoveryManager {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        let jobs_dir = jobs_dir.into();
        Self {
            directory: DirectoryManager::new(&jobs_dir),
            locks: LockManager::new(&jobs_dir),
            store: ManifestStore::new(&jobs_dir),
            hung_timeout: super::DEFAULT_HUNG_TIMEOUT,
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_hung_timeout(mut self, timeout: Duration) -> Self {
        self.hung_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Jobs whose status says a process should be driving them, but whose
    /// lock is free. A live executor would hold the lock.
    pub fn detect_crashed_jobs(&self) -> Vec<CrashedJob> {
        let mut crashed = Vec::new();

        for job in self.directory.list_jobs(None) {
            let should_hold_lock = matches!(
                job.status.as_str(),
                "RUNNING" | "REVIEWING" | "PROVISIONING" | "EXECUTING" | "HARVESTING"
                    | "RECOVERING"
            );
            if !should_hold_lock {
                continue;
            }

            match self.locks.try_lock_job(&job.job_id) {
                Ok(Some(_guard)) => {
                    crashed.push(CrashedJob {
                        job_id: job.job_id.clone(),
                        status: job.status.clone(),
                        reason: "lock_available_but_should_be_locked".to_string(),
                        directory: job.directory.clone(),
                    });
                }
                Ok(None) => {} // Someone holds the lock; job is alive.
                Err(e) => {
                    crashed.push(CrashedJob {
                        job_id: job.job_id.clone(),
                        status: job.status.clone(),
                        reason: format!("error_checking_lock: {e}"),
                        directory: job.directory.clone(),
                    });
                }
            }
        }

        crashed
    }

    /// Recover one crashed job: lock it (forced recovery proceeds even
    /// when the lock can't be had), apply hung recovery or reset to the
    /// safe non-executing state, and reap stale locks.
    pub fn recover_crashed_job(
        &self,
        job_id: &str,
        force: bool,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let mut outcome = RecoveryOutcome {
            job_id: job_id.to_string(),
            ..Default::default()
        };

        let job_dir = self.directory.job_dir(job_id)?;

        let _guard = match self.locks.lock_job(job_id, self.lock_timeout) {
            Ok(guard) => {
                outcome.actions_taken.push("acquired_lock".to_string());
                Some(guard)
            }
            Err(e) if force => {
                outcome
                    .actions_taken
                    .push("forced_lock_acquisition".to_string());
                tracing::warn!(job_id, "forcing recovery without lock: {e}");
                None
            }
            Err(e) => {
                outcome.errors.push(format!("could_not_acquire_lock: {e}"));
                return Ok(outcome);
            }
        };

        let manifest = self.store.load(&job_dir)?;
        let original_status = manifest.status;

        if let Some(action) = detect_hung(&manifest, self.hung_timeout) {
            perform_automatic_recovery(&self.store, &job_dir, action)?;
            outcome
                .actions_taken
                .push(format!("performed_{}", action.as_str()));
            outcome.recovered = true;
        } else if original_status.is_executing() {
            // Not hung by the timestamp rule, but crashed nonetheless:
            // reset to the safe non-executing target.
            let safe_status = if original_status == JobState::Reviewing {
                JobState::ReviewRequired
            } else {
                JobState::Pending
            };

            let entry = HistoryEntry::lifecycle(events::CRASH_RECOVERY, "Job recovered from crash")
                .with_detail(
                    "previous_status",
                    serde_json::json!(original_status.to_string()),
                )
                .with_detail("new_status", serde_json::json!(safe_status.to_string()));

            self.store.update(
                &job_dir,
                ManifestUpdate::status(safe_status).with_history(entry),
            )?;

            outcome.actions_taken.push(format!(
                "reset_status_{original_status}_to_{safe_status}"
            ));
            outcome.recovered = true;
        }

        let reaped = self.locks.cleanup_stale_locks(STALE_LOCK_REAP_AGE);
        if !reaped.is_empty() {
            outcome
                .actions_taken
                .push(format!("reaped_stale_locks: {}", reaped.join(", ")));
        }

        Ok(outcome)
    }

    /// Decide whether a suspected-running job is genuinely alive: pid from
    /// the manifest, recent log activity, and a non-blocking lock probe.
    pub fn reattach(&self, job_id: &str, process_check: bool) -> ReattachReport {
        let mut report = ReattachReport {
            job_id: job_id.to_string(),
            status: "unknown".to_string(),
            ..Default::default()
        };

        let job_dir = match self.directory.job_dir(job_id) {
            Ok(dir) => dir,
            Err(e) => {
                report.errors.push(format!("job_not_found: {e}"));
                return report;
            }
        };

        let manifest = match load_manifest(&job_dir) {
            Ok(m) => m,
            Err(e) => {
                report.errors.push(format!("manifest_load_failed: {e}"));
                return report;
            }
        };
        report.status = manifest.status.to_string();

        if process_check {
            report.process_running = job_process_running(&manifest, &job_dir);
        }

        match self.locks.try_lock_job(job_id) {
            Ok(Some(_guard)) => {
                if report.process_running {
                    report
                        .errors
                        .push("process_running_but_lock_available".to_string());
                } else {
                    report.reattached = true;
                }
            }
            Ok(None) => {
                if report.process_running {
                    // Lock held and a live process: attach to it.
                    report.reattached = true;
                } else {
                    report
                        .errors
                        .push("lock_held_but_no_process_found".to_string());
                }
            }
            Err(e) => report.errors.push(format!("lock_probe_failed: {e}")),
        }

        report
    }

    /// Audit one job: required fields, enumerated status, metric keys, and
    /// orphaned temp files.
    pub fn validate_job_consistency(&self, job_id: &str) -> ConsistencyReport {
        let mut issues = Vec::new();

        match self.directory.job_dir(job_id) {
            Ok(job_dir) => {
                // Typed loading already enforces required fields and the
                // status enumeration; surface raw-JSON level problems.
                match load_manifest(&job_dir) {
                    Ok(manifest) => {
                        if manifest.job_id != job_id {
                            issues.push(format!(
                                "job_id_mismatch: manifest says '{}'",
                                manifest.job_id
                            ));
                        }
                        if let Some(phase) = &manifest.current_phase {
                            if manifest.phase(phase).is_none() {
                                issues.push(format!("unknown_current_phase: {phase}"));
                            }
                        }
                        if manifest.metrics.cumulative_cost < 0.0
                            || manifest.metrics.cumulative_time_seconds < 0.0
                        {
                            issues.push("negative_cumulative_metrics".to_string());
                        }
                    }
                    Err(e) => issues.push(format!("manifest_invalid: {e}")),
                }

                issues.extend(orphaned_temp_files(&job_dir));
            }
            Err(e) => issues.push(format!("missing_job_directory: {e}")),
        }

        let recommendations = if issues.is_empty() {
            Vec::new()
        } else {
            issues
                .iter()
                .map(|issue| {
                    if issue.starts_with("manifest_invalid") {
                        "restore_manifest_from_backup".to_string()
                    } else if issue.starts_with("old_temp_files") {
                        "cleanup_temporary_files".to_string()
                    } else if issue.starts_with("unknown_current_phase") {
                        "reset_job_to_safe_state".to_string()
                    } else {
                        "run_full_job_recovery".to_string()
                    }
                })
                .collect()
        };

        ConsistencyReport {
            job_id: job_id.to_string(),
            consistent: issues.is_empty(),
            issues,
            recommendations,
        }
    }

    /// Recover a batch of jobs, or every auto-detected crashed job.
    pub fn bulk_recovery(&self, job_ids: Option<Vec<String>>, force: bool) -> BulkRecoveryReport {
        let ids = job_ids.unwrap_or_else(|| {
            self.detect_crashed_jobs()
                .into_iter()
                .map(|c| c.job_id)
                .collect()
        });

        let mut report = BulkRecoveryReport::default();

        for job_id in ids {
            report.total_jobs_processed += 1;
            match self.recover_crashed_job(&job_id, force) {
                Ok(outcome) => {
                    if outcome.recovered {
                        report.successful_recoveries += 1;
                    } else {
                        report.failed_recoveries += 1;
                    }
                    report.job_results.push(outcome);
                }
                Err(e) => {
                    report.failed_recoveries += 1;
                    report.job_results.push(RecoveryOutcome {
                        job_id,
                        errors: vec![e.to_string()],
                        ..Default::default()
                    });
                }
            }
        }

        report
    }

    /// The system-wide audit: crashed jobs, inconsistent jobs, and a
    /// health verdict based on how much of the fleet is in trouble.
    pub fn status_report(&self) -> RecoveryStatusReport {
        let crashed_jobs = self.detect_crashed_jobs();
        let all_jobs = self.directory.list_jobs(None);

        let mut inconsistent_jobs = Vec::new();
        let mut recovery_needed: Vec<String> = Vec::new();

        for job in &all_jobs {
            let consistency = self.validate_job_consistency(&job.job_id);
            let crashed = crashed_jobs.iter().any(|c| c.job_id == job.job_id);
            if !consistency.consistent || crashed {
                recovery_needed.push(job.job_id.clone());
            }
            if !consistency.consistent {
                inconsistent_jobs.push(consistency);
            }
        }

        let system_health = if recovery_needed.len() * 2 > all_jobs.len() && !all_jobs.is_empty() {
            SystemHealth::Critical
        } else if !crashed_jobs.is_empty() || !inconsistent_jobs.is_empty() {
            SystemHealth::NeedsAttention
        } else {
            SystemHealth::Healthy
        };

        RecoveryStatusReport {
            crashed_jobs,
            inconsistent_jobs,
            recovery_needed,
            system_health,
        }
    }
}

/// Is a process alive for this job: a manifest pid that answers signal 0,
/// or a log file touched in the last five minutes.
fn job_process_running(manifest: &Manifest, job_dir: &Path) -> bool {
    if let Some(pid) = manifest.process_id {
        if pid_alive(pid) {
            return true;
        }
    }

    let logs_dir = job_dir.join("logs");
    if let Ok(entries) = std::fs::read_dir(&logs_dir) {
        let cutoff = std::time::SystemTime::now() - Duration::from_secs(300);
        for entry in entries.flatten() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified > cutoff {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: u32) -> bool {
    false
}

fn orphaned_temp_files(job_dir: &Path) -> Vec<String> {
    let temp_dir = job_dir.join("temp");
    let Ok(entries) = std::fs::read_dir(&temp_dir) else {
        return Vec::new();
    };

    let cutoff = Utc::now() - ChronoDuration::hours(1);
    let old: Vec<String> = entries
        .flatten()
        .filter(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .map(|mtime| chrono::DateTime::<Utc>::from(mtime) < cutoff)
                .unwrap_or(false)
        })
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    if old.is_empty() {
        Vec::new()
    } else {
        vec![format!("old_temp_files: {} files older than 1 hour", old.len())]
    }
}
