//! CLI command implementations.

pub mod exec;
pub mod init;
pub mod job;
pub mod metrics;
pub mod role;
pub mod workspace;

use anyhow::{Result, bail};
use std::path::Path;

use crate::engine::EngineError;
use crate::settings;

/// Resolve the job id from the argument, `STEWARD_JOB_ID`, or the current
/// selection.
pub(crate) fn require_job_id(arg: Option<&str>, jobs_dir: &Path) -> Result<String> {
    match settings::resolve_job_id(arg, jobs_dir) {
        Some(id) => Ok(id),
        None => bail!(
            "No job id provided and no current job is selected. \
             Use 'steward job select <id>' or pass an id."
        ),
    }
}

/// Print a classified failure the way operators see every failure: tag,
/// user message, suggested action, raw excerpt, next steps.
pub(crate) fn report_engine_error(error: &EngineError) {
    if let EngineError::Classified {
        classification,
        message,
        raw_excerpt,
    } = error
    {
        eprintln!(
            "error [{}] {} - {}",
            classification.correlation_id,
            classification.label(),
            classification.user_message
        );
        eprintln!("  detail: {message}");
        eprintln!("  suggested: {}", classification.suggested_action);
        if let Some(excerpt) = raw_excerpt {
            eprintln!("  output: {}", excerpt.replace('\n', " "));
        }
        eprintln!("  next steps: fix and 'job step', 'job rerun' for a fresh run, or 'job terminate'");
    } else {
        eprintln!("error: {error}");
    }
}
