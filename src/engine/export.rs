//! Per-step metrics export as CSV.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::domain::Manifest;

/// Write one row per history entry. Returns the output path
/// (`<job_dir>/metrics.csv` when none is given).
pub fn export_metrics_csv(
    job_dir: &Path,
    manifest: &Manifest,
    output: Option<&Path>,
) -> Result<PathBuf> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| job_dir.join("metrics.csv"));

    let mut writer = csv::Writer::from_path(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    writer.write_record([
        "timestamp",
        "step_number",
        "role",
        "action",
        "summary",
        "cost_usd",
        "time_seconds",
        "token_input",
        "token_output",
        "token_cache_read",
        "cache_hit",
        "ttft_seconds",
        "throughput_tokens_per_second",
        "total_tokens",
        "executor_task_id",
        "status_after",
    ])?;

    for (i, entry) in manifest.history.iter().enumerate() {
        let metrics = entry.metrics.clone().unwrap_or_default();
        writer.write_record([
            entry
                .timestamp
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            i.to_string(),
            entry
                .role
                .map(|r| r.to_string())
                .unwrap_or_default(),
            entry.action.clone().unwrap_or_default(),
            entry.summary.clone().unwrap_or_default(),
            format!("{:.6}", metrics.cost_usd),
            format!("{:.2}", metrics.duration_seconds),
            metrics.token_input.to_string(),
            metrics.token_output.to_string(),
            metrics.token_cache_read.to_string(),
            if metrics.cache_hit { "Yes" } else { "No" }.to_string(),
            metrics
                .ttft_seconds
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            metrics
                .throughput_tokens_per_second
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            metrics.total_tokens().to_string(),
            entry.executor_task_id.clone().unwrap_or_default(),
            entry
                .new_status
                .map(|s| s.to_string())
                .unwrap_or_default(),
        ])?;
    }

    writer.flush().context("Failed to flush metrics CSV")?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HistoryEntry, JobState, Role, StepMetrics, events};
    use tempfile::TempDir;

    #[test]
    fn exports_step_rows_with_headers() {
        let tmp = TempDir::new().unwrap();

        let mut manifest = Manifest::new("j1", None);
        manifest.history.clear();
        manifest.history.push(HistoryEntry::step(
            Role::Worker,
            "COMPLETED",
            Some("implemented parser".into()),
            StepMetrics {
                cost_usd: 0.123456,
                duration_seconds: 42.5,
                token_input: 1000,
                token_output: 500,
                token_cache_read: 200,
                cache_hit: true,
                ttft_seconds: Some(1.5),
                throughput_tokens_per_second: Some(35.0),
                ..Default::default()
            },
            Some("task-abc".into()),
            vec!["parser.rs".into()],
            JobState::ReviewRequired,
        ));
        manifest
            .history
            .push(HistoryEntry::lifecycle(events::RESTEP, "rewound"));

        let path = export_metrics_csv(tmp.path(), &manifest, None).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,step_number,role,action"));
        assert!(lines[1].contains("Worker"));
        assert!(lines[1].contains("0.123456"));
        assert!(lines[1].contains("task-abc"));
        assert!(lines[1].contains("1700")); // 1000 + 500 + 200
        assert!(lines[1].contains("REVIEW_REQUIRED"));
        // Lifecycle rows export with empty metric cells, not fake zeros
        // for tokens.
        assert!(lines[2].contains("rewound"));
    }

    #[test]
    fn explicit_output_path_wins() {
        let tmp = TempDir::new().unwrap();
        let manifest = Manifest::new("j1", None);
        let custom = tmp.path().join("out").join("report.csv");
        std::fs::create_dir_all(custom.parent().unwrap()).unwrap();

        let path = export_metrics_csv(tmp.path(), &manifest, Some(&custom)).unwrap();
        assert_eq!(path, custom);
        assert!(custom.exists());
    }
}
