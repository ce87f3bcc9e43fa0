//! Job management commands: create, config, activate, select, list,
//! status, preview, and the human lifecycle actions.

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::domain::{JobState, Role, StepAction};
use crate::engine::{Engine, budget};
use crate::recovery;
use crate::settings::Settings;
use crate::store::{DirectoryManager, IndexStore, load_manifest, save_manifest};

use super::require_job_id;

pub fn create_command(jobs_dir: &Path, directory_arg: &Path) -> Result<()> {
    println!("steward job create");

    let directory = DirectoryManager::new(jobs_dir);
    directory.ensure_base_structure()?;

    let target = if directory_arg == Path::new(".") {
        std::env::current_dir().context("cannot resolve current directory")?
    } else {
        directory_arg.to_path_buf()
    };

    let job_id = directory.create_job(&target, false)?;
    println!("  created job '{job_id}' (status DRAFT, selected as current)");
    println!("  next: 'steward job config --objective ...' then 'steward job activate'");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn config_command(
    jobs_dir: &Path,
    job_id: Option<&str>,
    objective: Option<String>,
    details: Option<String>,
    acceptance: Option<String>,
    prompt: Option<String>,
    files: Vec<String>,
) -> Result<()> {
    println!("steward job config");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let directory = DirectoryManager::new(jobs_dir);
    let job_dir = directory.job_dir(&job_id)?;

    let mut manifest = load_manifest(&job_dir)?;
    if manifest.status != JobState::Draft {
        bail!(
            "job '{job_id}' is in state {}; configuration is draft-only",
            manifest.status
        );
    }

    let mut changed = Vec::new();
    if let Some(value) = objective {
        manifest.config.objective = Some(value);
        changed.push("objective");
    }
    if let Some(value) = details {
        manifest.config.details = Some(value);
        changed.push("details");
    }
    if let Some(value) = acceptance {
        manifest.config.acceptance = Some(value);
        changed.push("acceptance");
    }
    if let Some(value) = prompt {
        manifest.config.prompt = Some(value);
        changed.push("prompt");
    }
    if !files.is_empty() {
        manifest.config.files = files;
        changed.push("files");
    }

    if changed.is_empty() {
        println!("  nothing to change");
        return Ok(());
    }

    manifest.updated_at = chrono::Utc::now();
    save_manifest(&job_dir, &manifest)?;
    println!("  updated: {}", changed.join(", "));
    Ok(())
}

pub fn activate_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    rank: Option<usize>,
) -> Result<()> {
    println!("steward job activate");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);

    let position = engine.activate(&job_id, rank)?;
    println!("  job '{job_id}' activated: DRAFT -> PENDING");
    println!("  queue position: {position}");
    Ok(())
}

pub fn select_command(jobs_dir: &Path, job_id: &str) -> Result<()> {
    println!("steward job select");

    let index = IndexStore::new(jobs_dir);
    if !index.exists() {
        bail!("jobs directory not initialized; run 'steward init' first");
    }
    if !index.read().jobs.contains_key(job_id) {
        bail!("job '{job_id}' not found in jobs index");
    }

    index.with_lock(std::time::Duration::from_secs(30), |index| {
        index.current_job_id = Some(job_id.to_string());
    })?;

    println!("  current job: {job_id}");
    Ok(())
}

pub fn list_command(jobs_dir: &Path) -> Result<()> {
    println!("steward job list");

    let directory = DirectoryManager::new(jobs_dir);
    let jobs = directory.list_jobs(None);
    if jobs.is_empty() {
        println!("  no jobs found");
        return Ok(());
    }

    let index = directory.index().read();
    for job in jobs {
        let current = if index.current_job_id.as_deref() == Some(job.job_id.as_str()) {
            "*"
        } else {
            " "
        };
        let queue_pos = index
            .queue_position(&job.job_id)
            .map(|p| format!(" queue#{p}"))
            .unwrap_or_default();
        let description = load_manifest(&job.directory)
            .ok()
            .and_then(|m| m.description)
            .unwrap_or_default();
        println!(
            "  {current} {:<16} [{:<21}]{queue_pos} {description}",
            job.job_id, job.status
        );
    }
    Ok(())
}

pub fn status_command(
    jobs_dir: &Path,
    job_id: Option<&str>,
    json: bool,
    recovery_check: bool,
) -> Result<()> {
    println!("steward job status");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let directory = DirectoryManager::new(jobs_dir);
    let job_dir = directory.job_dir(&job_id)?;
    let manifest = load_manifest(&job_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!("  job: {job_id}");
    println!("  status: {}", manifest.status);
    println!(
        "  phase: {}",
        manifest.current_phase.as_deref().unwrap_or("(none)")
    );

    let snap = budget::snapshot(&manifest);
    println!(
        "  metrics: ${:.4} cost, {:.1}s, {} steps, {} tokens [{}]",
        snap.cumulative_cost,
        snap.cumulative_time_seconds,
        snap.step_count,
        snap.total_tokens,
        snap.status_color
    );

    println!("  recent history:");
    for entry in manifest.history.iter().rev().take(5) {
        let when = entry
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let what = entry
            .event
            .clone()
            .or_else(|| entry.action.clone())
            .unwrap_or_default();
        let model = entry
            .model
            .as_deref()
            .map(|m| format!(" [{m}]"))
            .unwrap_or_default();
        let summary = entry.summary.as_deref().unwrap_or("");
        println!("    {when} {what}{model} {summary}");
    }

    if recovery_check {
        let status = recovery_status_lines(&job_dir, &manifest);
        println!("  recovery:");
        for line in status {
            println!("    {line}");
        }
    }

    Ok(())
}

fn recovery_status_lines(job_dir: &Path, manifest: &crate::domain::Manifest) -> Vec<String> {
    let mut lines = Vec::new();

    let backups = std::fs::read_dir(job_dir.join(".backups"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    lines.push(format!("backups available: {backups}"));

    match recovery::detect_hung(manifest, recovery::DEFAULT_HUNG_TIMEOUT) {
        Some(action) => lines.push(format!("hung process detected: {}", action.as_str())),
        None => lines.push("no hung process detected".to_string()),
    }

    lines
}

pub fn lifecycle_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    action: StepAction,
) -> Result<()> {
    let verb = match action {
        StepAction::Approve => "approve",
        StepAction::Reject => "reject",
        StepAction::Resubmit => "resubmit",
        StepAction::Suspend => "suspend",
        StepAction::Resume => "resume",
        StepAction::Terminate => "terminate",
        _ => "lifecycle",
    };
    println!("steward job {verb}");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);

    let role = if action == StepAction::Resume {
        Role::System
    } else {
        Role::Human
    };
    let manifest = engine.apply_lifecycle_action(&job_id, role, action)?;
    println!("  job '{job_id}' is now {}", manifest.status);
    Ok(())
}

pub fn preview_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    detailed: bool,
) -> Result<()> {
    println!("steward job preview");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);
    let preview = engine.preview(&job_id)?;

    println!(
        "  phase '{}' as {} ({} chars, {} attachments)",
        preview.phase,
        preview.role,
        preview.prompt.len(),
        preview.attachments.len()
    );

    if detailed {
        println!("  attachments:");
        for attachment in &preview.attachments {
            println!("    {}", attachment.display());
        }
        println!("--- prompt ---");
        println!("{}", preview.prompt);
    }

    Ok(())
}
