//! Workspace git helpers and the cleanup command.

use anyhow::Result;
use std::path::Path;

use crate::settings::Settings;
use crate::store::DirectoryManager;
use crate::workspace::cleanup::{self, CleanupPolicy};
use crate::workspace::{CommitOutcome, WorkspaceManager, find_git_root};

use super::require_job_id;

fn workspace_for(jobs_dir: &Path, job_id: Option<&str>) -> Result<(String, WorkspaceManager)> {
    let job_id = require_job_id(job_id, jobs_dir)?;
    let directory = DirectoryManager::new(jobs_dir);
    let job_dir = directory.job_dir(&job_id)?;
    Ok((job_id, WorkspaceManager::new(job_dir)))
}

pub fn git_status_command(jobs_dir: &Path, job_id: Option<&str>) -> Result<()> {
    println!("steward job git-status");

    let (job_id, ws) = workspace_for(jobs_dir, job_id)?;
    let status = ws.git_status()?;

    if !status.is_git_repo {
        println!("  job '{job_id}' has no provisioned workspace");
        return Ok(());
    }

    println!(
        "  branch: {}",
        status.current_branch.as_deref().unwrap_or("?")
    );
    for (label, files) in [
        ("staged", &status.staged_changes),
        ("unstaged", &status.unstaged_changes),
        ("untracked", &status.untracked_files),
    ] {
        println!("  {label}: {}", files.len());
        for file in files {
            println!("    {file}");
        }
    }
    println!("  recent commits:");
    for line in &status.recent_commits {
        println!("    {line}");
    }
    Ok(())
}

pub fn git_log_command(jobs_dir: &Path, job_id: Option<&str>, limit: usize) -> Result<()> {
    println!("steward job git-log");

    let (job_id, ws) = workspace_for(jobs_dir, job_id)?;
    if !ws.verify() {
        println!("  job '{job_id}' has no provisioned workspace");
        return Ok(());
    }

    for line in ws.git_log(limit)? {
        println!("  {line}");
    }
    Ok(())
}

pub fn commit_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    message: &str,
) -> Result<()> {
    println!("steward job commit");

    let (job_id, ws) = workspace_for(jobs_dir, job_id)?;
    let author = (
        settings.git.author_name.as_str(),
        settings.git.author_email.as_str(),
    );
    match ws.commit(&[], message, Some(author))? {
        CommitOutcome::Committed {
            commit_hash,
            files_committed,
        } => {
            println!(
                "  committed {} ({} files)",
                &commit_hash[..commit_hash.len().min(8)],
                files_committed.len()
            );
        }
        CommitOutcome::NoChanges => println!("  job '{job_id}': no changes to commit"),
    }
    Ok(())
}

pub fn merge_preview_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
) -> Result<()> {
    println!("steward job merge-preview");

    let (job_id, ws) = workspace_for(jobs_dir, job_id)?;
    let main_repo = find_git_root(jobs_dir)
        .or_else(|| std::env::current_dir().ok().and_then(|cwd| find_git_root(&cwd)))
        .ok_or_else(|| anyhow::anyhow!("not inside a git repository"))?;

    let patch = ws.merge_preview(&job_id, &settings.git.base_branch, &main_repo)?;
    println!("  patch written: {}", patch.display());
    println!("  merging stays a human action; apply with 'git apply' after review");
    Ok(())
}

pub fn cleanup_command(
    jobs_dir: &Path,
    settings: Settings,
    dry_run: bool,
    force: bool,
    job_id: Option<&str>,
    max_backups: Option<usize>,
    preserve_failed: bool,
) -> Result<()> {
    println!("steward workspace cleanup");

    let mut policy: CleanupPolicy = settings.cleanup;
    if let Some(max) = max_backups {
        policy.max_backups_per_job = max;
    }
    if preserve_failed {
        policy.preserve_failed_jobs = true;
    }
    if force {
        // Force collapses the grace periods; preservation flags still win.
        policy.cleanup_cancelled_jobs_after_days = 0;
        policy.cleanup_failed_jobs_after_days = 0;
        policy.preserve_failed_jobs = preserve_failed;
    }

    let report = cleanup::sweep(jobs_dir, &policy, dry_run, job_id);

    let verb = if dry_run { "would clean" } else { "cleaned" };
    for (path, reason) in &report.cleaned {
        println!("  {verb}: {} ({reason})", path.display());
    }
    for (path, reason) in &report.skipped {
        println!("  skipped: {} ({reason})", path.display());
    }
    for error in &report.errors {
        eprintln!("  error: {error}");
    }

    println!(
        "  {} cleaned, {} skipped, {} errors",
        report.cleaned.len(),
        report.skipped.len(),
        report.errors.len()
    );
    Ok(())
}
