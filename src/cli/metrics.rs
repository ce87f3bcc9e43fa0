//! `steward job metrics`: snapshot, projections, CSV export.

use anyhow::Result;
use std::path::Path;

use crate::engine::{budget, export};
use crate::store::{DirectoryManager, load_manifest};

use super::require_job_id;

pub fn metrics_command(
    jobs_dir: &Path,
    job_id: Option<&str>,
    csv: Option<&Path>,
    projections: bool,
    remaining_phases: usize,
) -> Result<()> {
    println!("steward job metrics");

    let job_id = require_job_id(job_id, jobs_dir)?;
    let directory = DirectoryManager::new(jobs_dir);
    let job_dir = directory.job_dir(&job_id)?;
    let manifest = load_manifest(&job_dir)?;

    let snap = budget::snapshot(&manifest);
    println!("  job: {job_id}");
    println!(
        "  cost: ${:.4}{}",
        snap.cumulative_cost,
        if snap.cost_threshold > 0.0 {
            format!(
                " of ${:.2} ({:.0}%, ${:.2} remaining)",
                snap.cost_threshold, snap.cost_percentage, snap.cost_remaining
            )
        } else {
            " (no budget cap)".to_string()
        }
    );
    println!(
        "  time: {:.1}s{}",
        snap.cumulative_time_seconds,
        if snap.time_threshold_minutes > 0.0 {
            format!(
                " of {:.0}m ({:.0}%, {:.1}m remaining)",
                snap.time_threshold_minutes, snap.time_percentage, snap.time_remaining_minutes
            )
        } else {
            " (no time cap)".to_string()
        }
    );
    println!(
        "  steps: {} total ({} completed, {} stuck/retry)",
        snap.step_count, snap.completed_steps, snap.failed_steps
    );
    println!(
        "  tokens: {} total, {} cache-read, {} cache hits",
        snap.total_tokens, snap.total_tokens_cache_read, snap.total_cache_hits
    );
    println!("  budget status: {}", snap.status_color);

    if projections {
        let projection = budget::project(&manifest, remaining_phases);
        println!("  projections ({} phases remaining):", remaining_phases);
        println!(
            "    cost: ${:.4} now, ${:.4}/step avg, ${:.4} projected total ({})",
            projection.current_cost,
            projection.average_cost_per_step,
            projection.projected_total_cost,
            projection.cost_status
        );
        println!(
            "    time: {:.1}m now, {:.1}m/step avg, {:.1}m projected total ({})",
            projection.current_time_minutes,
            projection.average_time_per_step_minutes,
            projection.projected_total_time_minutes,
            projection.time_status
        );
        for recommendation in &projection.recommendations {
            println!("    note: {recommendation}");
        }
        println!("    {}", projection.confidence);
    }

    if let Some(csv_path) = csv {
        let written = export::export_metrics_csv(&job_dir, &manifest, Some(csv_path))?;
        println!("  exported CSV: {}", written.display());
    }

    Ok(())
}
