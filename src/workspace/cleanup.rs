//! Workspace cleanup policy: when a finished job's worktree and bare repo
//! may be archived and removed.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::store;

/// Policy knobs for workspace cleanup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    pub cleanup_completed_jobs: bool,
    pub cleanup_failed_jobs_after_days: i64,
    pub cleanup_cancelled_jobs_after_days: i64,
    pub preserve_failed_jobs: bool,
    pub max_backups_per_job: usize,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            cleanup_completed_jobs: true,
            cleanup_failed_jobs_after_days: 7,
            cleanup_cancelled_jobs_after_days: 1,
            preserve_failed_jobs: true,
            max_backups_per_job: 3,
        }
    }
}

/// Inputs to the cleanup decision for one job.
#[derive(Debug, Default)]
pub struct LifecycleStatus {
    pub workspace_exists: bool,
    pub current_branch: Option<String>,
    pub has_changes: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub job_status: Option<String>,
}

/// What a performed cleanup did.
#[derive(Debug)]
pub struct CleanupReport {
    pub reason: String,
    pub backup_archive: PathBuf,
}

/// Gather the lifecycle inputs for a job directory.
pub fn lifecycle_status(job_dir: &Path) -> LifecycleStatus {
    let mut status = LifecycleStatus::default();
    let workspace_dir = job_dir.join("workspace");

    if !workspace_dir.exists() {
        status.job_status = read_job_status(job_dir);
        return status;
    }
    status.workspace_exists = true;

    status.last_modified = std::fs::metadata(&workspace_dir)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    let ws = super::WorkspaceManager::new(job_dir);
    if ws.verify() {
        if let Ok(git) = ws.git_status() {
            status.current_branch = git.current_branch;
            status.has_changes = !git.staged_changes.is_empty()
                || !git.unstaged_changes.is_empty()
                || !git.untracked_files.is_empty();
        }
    }

    status.job_status = read_job_status(job_dir);
    status
}

fn read_job_status(job_dir: &Path) -> Option<String> {
    store::load_manifest(job_dir).ok().map(|m| m.status.to_string())
}

/// Decide whether a workspace is eligible for cleanup, with the reason.
pub fn should_cleanup(job_dir: &Path, policy: &CleanupPolicy) -> (bool, String) {
    let status = lifecycle_status(job_dir);

    if !status.workspace_exists {
        return (false, "Workspace does not exist".into());
    }

    let age_exceeds = |days: i64| {
        status
            .last_modified
            .map(|modified| Utc::now() - modified > Duration::days(days))
            .unwrap_or(false)
    };

    match status.job_status.as_deref() {
        Some("SUCCESS") if policy.cleanup_completed_jobs => {
            (true, "Job completed successfully".into())
        }
        Some("FAILED") if policy.preserve_failed_jobs => {
            (false, "Preserving failed job for debugging".into())
        }
        Some("CANCELED") => {
            let days = policy.cleanup_cancelled_jobs_after_days;
            if age_exceeds(days) {
                (true, format!("Cancelled job older than {days} days"))
            } else {
                (
                    false,
                    format!("Within grace period for cancelled jobs ({days} days)"),
                )
            }
        }
        Some("FAILED") => {
            let days = policy.cleanup_failed_jobs_after_days;
            if age_exceeds(days) {
                (true, format!("Failed job older than {days} days"))
            } else {
                (
                    false,
                    format!("Within grace period for failed jobs ({days} days)"),
                )
            }
        }
        Some(
            "DRAFT" | "PENDING" | "SUSPENDED" | "PROVISIONING" | "EXECUTING" | "HARVESTING"
            | "RECOVERING" | "RUNNING" | "REVIEWING" | "REVIEW_REQUIRED" | "APPROVAL_REQUIRED"
            | "INTERVENTION_REQUIRED",
        ) => (false, "Job is still active".into()),
        _ => (false, "No cleanup policy matched".into()),
    }
}

/// Archive `workspace/` into `.workspace_backup/` with a metadata sidecar.
pub fn backup_workspace(job_dir: &Path, policy: &CleanupPolicy) -> Result<PathBuf> {
    let workspace_dir = job_dir.join("workspace");
    if !workspace_dir.exists() {
        bail!("Workspace does not exist to backup");
    }

    let backup_dir = job_dir.join(".workspace_backup");
    std::fs::create_dir_all(&backup_dir)
        .with_context(|| format!("Failed to create {}", backup_dir.display()))?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let archive_path = backup_dir.join(format!("workspace_backup_{stamp}.tar.gz"));

    let file = std::fs::File::create(&archive_path)
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    // The .git symlink points outside the archive; keep it as a symlink
    // entry instead of chasing it into target.git.
    builder.follow_symlinks(false);
    builder
        .append_dir_all("workspace", &workspace_dir)
        .context("Failed to archive workspace")?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .context("Failed to finish workspace archive")?;

    let status = lifecycle_status(job_dir);
    let metadata = serde_json::json!({
        "backup_timestamp": stamp,
        "original_workspace_path": workspace_dir.display().to_string(),
        "job_dir": job_dir.display().to_string(),
        "job_status": status.job_status,
        "had_uncommitted_changes": status.has_changes,
        "backup_created": Utc::now().to_rfc3339(),
    });
    let metadata_path = backup_dir.join(format!("backup_metadata_{stamp}.json"));
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)
        .with_context(|| format!("Failed to write {}", metadata_path.display()))?;

    prune_backups(&backup_dir, policy.max_backups_per_job);

    Ok(archive_path)
}

fn prune_backups(backup_dir: &Path, max_backups: usize) {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return;
    };

    let mut archives: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("workspace_backup_") && n.ends_with(".tar.gz"))
        })
        .collect();

    if archives.len() <= max_backups {
        return;
    }

    archives.sort();
    let excess = archives.len() - max_backups;
    for old in archives.into_iter().take(excess) {
        let _ = std::fs::remove_file(&old);
        if let Some(name) = old.file_name().and_then(|n| n.to_str()) {
            let sidecar = name
                .replace("workspace_backup_", "backup_metadata_")
                .replace(".tar.gz", ".json");
            let _ = std::fs::remove_file(backup_dir.join(sidecar));
        }
    }
}

/// Evaluate the policy for one job; when eligible, archive the workspace
/// and remove `workspace/` and `target.git/`. Backup failure skips the
/// deletion for safety.
pub fn cleanup_if_eligible(
    job_dir: &Path,
    policy: &CleanupPolicy,
) -> Result<Option<CleanupReport>> {
    let (eligible, reason) = should_cleanup(job_dir, policy);
    if !eligible {
        return Ok(None);
    }

    let backup_archive = backup_workspace(job_dir, policy)?;

    let workspace_dir = job_dir.join("workspace");
    let target_git_dir = job_dir.join("target.git");
    if workspace_dir.exists() {
        std::fs::remove_dir_all(&workspace_dir)
            .with_context(|| format!("Failed to remove {}", workspace_dir.display()))?;
    }
    if target_git_dir.exists() {
        std::fs::remove_dir_all(&target_git_dir)
            .with_context(|| format!("Failed to remove {}", target_git_dir.display()))?;
    }

    Ok(Some(CleanupReport {
        reason,
        backup_archive,
    }))
}

/// Result of a jobs-directory-wide cleanup sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub cleaned: Vec<(PathBuf, String)>,
    pub skipped: Vec<(PathBuf, String)>,
    pub errors: Vec<String>,
}

/// Apply the policy across every job directory. In dry-run mode the report
/// lists what would happen and nothing is touched.
pub fn sweep(
    jobs_dir: &Path,
    policy: &CleanupPolicy,
    dry_run: bool,
    only_job: Option<&str>,
) -> SweepReport {
    let mut report = SweepReport::default();

    let Ok(entries) = std::fs::read_dir(jobs_dir) else {
        report
            .errors
            .push(format!("Jobs directory does not exist: {}", jobs_dir.display()));
        return report;
    };

    for entry in entries.flatten() {
        let job_dir = entry.path();
        if !job_dir.is_dir() || !store::manifest_path(&job_dir).exists() {
            continue;
        }
        if let Some(only) = only_job {
            let name = job_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name != only {
                continue;
            }
        }

        let (eligible, reason) = should_cleanup(&job_dir, policy);
        if !eligible {
            report.skipped.push((job_dir, reason));
            continue;
        }

        if dry_run {
            report.cleaned.push((job_dir, reason));
            continue;
        }

        match cleanup_if_eligible(&job_dir, policy) {
            Ok(Some(done)) => report.cleaned.push((job_dir, done.reason)),
            Ok(None) => report.skipped.push((job_dir, reason)),
            Err(e) => report.errors.push(format!("{}: {e}", job_dir.display())),
        }
    }

    report
}
