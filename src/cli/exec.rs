//! Execution commands: step, run, restep, rerun, poststep.

use anyhow::{Result, bail};
use std::path::Path;

use crate::domain::{Role, parse_reply};
use crate::engine::{Engine, StepReport};
use crate::settings::Settings;

use super::{report_engine_error, require_job_id};

fn print_step_report(report: &StepReport) {
    println!(
        "  {} responded {} for phase '{}'",
        report.role, report.action, report.phase
    );
    println!("  summary: {}", report.summary);
    println!(
        "  metrics: ${:.4}, {:.1}s",
        report.metrics.cost_usd, report.metrics.duration_seconds
    );
    if !report.validated_evidence.is_empty() {
        println!("  evidence: {}", report.validated_evidence.join(", "));
    }
    for warning in &report.evidence_warnings {
        println!("  warning: {warning}");
    }
    match &report.commit_hash {
        Some(hash) => println!("  committed: {}", &hash[..hash.len().min(8)]),
        None => println!("  no workspace changes to commit"),
    }
    println!("  status -> {}", report.new_status);
}

pub async fn step_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    dry_run: bool,
    model: Option<&str>,
) -> Result<()> {
    println!("steward job step");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);

    if dry_run {
        let preview = engine.preview(&job_id)?;
        println!(
            "  would execute phase '{}' as {} with {} attachments",
            preview.phase,
            preview.role,
            preview.attachments.len()
        );
        println!("  dry run: no executor invocation, no state change");
        return Ok(());
    }

    match engine.step_with_retries(&job_id, model).await {
        Ok(report) => {
            if report.recovered_before_step {
                println!("  recovered stale state before stepping");
            }
            print_step_report(&report);
            Ok(())
        }
        Err(error) => {
            report_engine_error(&error);
            Err(error.into())
        }
    }
}

pub async fn run_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    resume: bool,
    model: Option<&str>,
) -> Result<()> {
    println!("steward job run");

    let engine = Engine::new(jobs_dir, settings);

    if resume {
        if let Some(id) = job_id {
            let job_dir = engine.job_dir(id)?;
            let report = crate::recovery::validate_state_persistence(engine.store(), &job_dir);
            if report.recovered {
                println!(
                    "  recovered before run ({})",
                    report.recovery_from.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    match engine.run(job_id, model).await {
        Ok(report) => {
            println!(
                "  job '{}' stopped after {} step(s): {}",
                report.job_id, report.steps_executed, report.final_status
            );
            match report.final_status {
                s if s.is_terminal() => println!("  job finished"),
                crate::domain::JobState::ApprovalRequired => {
                    println!("  next: 'job approve' or 'job reject'")
                }
                crate::domain::JobState::InterventionRequired => {
                    println!("  next: repair, then 'job resubmit' and 'job run'")
                }
                _ => {}
            }
            Ok(())
        }
        Err(error) => {
            report_engine_error(&error);
            Err(error.into())
        }
    }
}

pub fn restep_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    step: usize,
    dry_run: bool,
) -> Result<()> {
    println!("steward job restep");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);

    let target = engine.restep(&job_id, step, dry_run)?;
    if dry_run {
        println!("  would rewind job '{job_id}' to step {step} ('{target}'); no changes made");
    } else {
        println!("  job '{job_id}' rewound to step {step} ('{target}')");
        println!("  status unchanged; history preserved with a RESTEP marker");
    }
    Ok(())
}

pub fn rerun_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: &str,
    step: Option<usize>,
) -> Result<()> {
    println!("steward job rerun");

    let engine = Engine::new(jobs_dir, settings);
    let start_phase = engine.rerun(job_id, step)?;

    println!("  job '{job_id}' reset for a fresh run from phase '{start_phase}'");
    println!("  metrics zeroed, history cleared, workspace retained");
    println!("  next: 'steward job run {job_id}'");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn poststep_command(
    jobs_dir: &Path,
    settings: Settings,
    job_id: Option<&str>,
    response_file: Option<&Path>,
    response_string: Option<&str>,
    role: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    println!("steward job poststep");

    let raw = match (response_file, response_string) {
        (Some(_), Some(_)) => bail!("cannot provide both --response-file and --response-string"),
        (Some(path), None) => std::fs::read_to_string(path)?,
        (None, Some(inline)) => inline.to_string(),
        (None, None) => bail!("must provide either --response-file or --response-string"),
    };

    let reply = parse_reply(&raw)?;
    println!("  loaded reply with action {}", reply.action);

    let role = role
        .map(|r| r.parse::<Role>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;

    let job_id = require_job_id(job_id, jobs_dir)?;
    let engine = Engine::new(jobs_dir, settings);

    match engine.poststep(&job_id, &reply, role, dry_run) {
        Ok(report) => {
            if report.dry_run {
                println!("  dry run: no changes made");
                println!(
                    "  would transition to {} as {}",
                    report.would_transition_to, report.role
                );
                if !report.validated_evidence.is_empty() {
                    println!("  would commit: {}", report.validated_evidence.join(", "));
                }
            } else {
                println!(
                    "  applied reply as {}; status -> {}",
                    report.role, report.would_transition_to
                );
            }
            for warning in &report.evidence_warnings {
                println!("  warning: {warning}");
            }
            Ok(())
        }
        Err(error) => {
            report_engine_error(&error);
            Err(error.into())
        }
    }
}
