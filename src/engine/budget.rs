//! Budget thresholds, metric snapshots, and cost projections.

use thiserror::Error;

use crate::domain::Manifest;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("cannot execute job - budget limits exceeded: {0}")]
    ThresholdExceeded(String),
}

/// Budget caps drawn from the manifest. Zero disables the matching gate.
#[derive(Debug, Clone, Copy)]
pub struct BudgetThresholds {
    pub cost_threshold_usd: f64,
    pub time_threshold_minutes: f64,
    pub warning_percentage: f64,
}

impl BudgetThresholds {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            cost_threshold_usd: manifest.cost_threshold,
            time_threshold_minutes: manifest.time_threshold_minutes,
            warning_percentage: manifest.warning_percentage.unwrap_or(75.0),
        }
    }
}

/// Discrete budget health for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for StatusColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusColor::Green => write!(f, "green"),
            StatusColor::Yellow => write!(f, "yellow"),
            StatusColor::Red => write!(f, "red"),
        }
    }
}

/// Complete metrics picture for one job.
#[derive(Debug)]
pub struct MetricsSnapshot {
    pub cumulative_cost: f64,
    pub cumulative_time_seconds: f64,
    pub total_tokens: u64,
    pub total_tokens_cache_read: u64,
    pub total_cache_hits: usize,
    pub step_count: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub cost_threshold: f64,
    pub time_threshold_minutes: f64,
    pub cost_percentage: f64,
    pub time_percentage: f64,
    pub cost_remaining: f64,
    pub time_remaining_minutes: f64,
    pub status_color: StatusColor,
}

/// Aggregate a job's metrics from its manifest and history.
pub fn snapshot(manifest: &Manifest) -> MetricsSnapshot {
    let thresholds = BudgetThresholds::from_manifest(manifest);

    let cumulative_cost = manifest.metrics.cumulative_cost;
    let cumulative_time_seconds = manifest.metrics.cumulative_time_seconds;

    let mut total_tokens = 0u64;
    let mut total_tokens_cache_read = 0u64;
    let mut total_cache_hits = 0usize;
    let mut completed_steps = 0usize;
    let mut failed_steps = 0usize;

    for entry in &manifest.history {
        match entry.action.as_deref() {
            Some("COMPLETED") => completed_steps += 1,
            Some("STUCK" | "RETRY") => failed_steps += 1,
            _ => {}
        }
        if let Some(metrics) = &entry.metrics {
            total_tokens += metrics.total_tokens();
            total_tokens_cache_read += metrics.token_cache_read;
            if metrics.cache_hit {
                total_cache_hits += 1;
            }
        }
    }

    let cost_percentage = if thresholds.cost_threshold_usd > 0.0 {
        cumulative_cost / thresholds.cost_threshold_usd * 100.0
    } else {
        0.0
    };
    let time_percentage = if thresholds.time_threshold_minutes > 0.0 {
        (cumulative_time_seconds / 60.0) / thresholds.time_threshold_minutes * 100.0
    } else {
        0.0
    };

    let status_color = if thresholds.cost_threshold_usd > 0.0 || thresholds.time_threshold_minutes > 0.0
    {
        let max_percentage = cost_percentage.max(time_percentage);
        if max_percentage >= 100.0 {
            StatusColor::Red
        } else if max_percentage >= thresholds.warning_percentage {
            StatusColor::Yellow
        } else {
            StatusColor::Green
        }
    } else {
        StatusColor::Green
    };

    MetricsSnapshot {
        cumulative_cost,
        cumulative_time_seconds,
        total_tokens,
        total_tokens_cache_read,
        total_cache_hits,
        step_count: manifest.history.len(),
        completed_steps,
        failed_steps,
        cost_threshold: thresholds.cost_threshold_usd,
        time_threshold_minutes: thresholds.time_threshold_minutes,
        cost_percentage,
        time_percentage,
        cost_remaining: (thresholds.cost_threshold_usd - cumulative_cost).max(0.0),
        time_remaining_minutes: (thresholds.time_threshold_minutes
            - cumulative_time_seconds / 60.0)
            .max(0.0),
        status_color,
    }
}

/// The pre-execution gate: fail fast before the executor is ever spawned.
pub fn check_thresholds(manifest: &Manifest) -> Result<(), BudgetError> {
    let snap = snapshot(manifest);
    let thresholds = BudgetThresholds::from_manifest(manifest);

    let mut violations = Vec::new();
    if thresholds.cost_threshold_usd > 0.0 && snap.cost_percentage >= 100.0 {
        violations.push(format!(
            "cost ${:.4} of ${:.4} ({:.0}%)",
            snap.cumulative_cost, thresholds.cost_threshold_usd, snap.cost_percentage
        ));
    }
    if thresholds.time_threshold_minutes > 0.0 && snap.time_percentage >= 100.0 {
        violations.push(format!(
            "time {:.1}m of {:.1}m ({:.0}%)",
            snap.cumulative_time_seconds / 60.0,
            thresholds.time_threshold_minutes,
            snap.time_percentage
        ));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(BudgetError::ThresholdExceeded(violations.join("; ")))
    }
}

/// Projection of where the budget lands after `remaining_phases` more
/// steps, from the mean of what the history cost so far.
#[derive(Debug)]
pub struct Projection {
    pub current_cost: f64,
    pub average_cost_per_step: f64,
    pub projected_total_cost: f64,
    pub cost_status: String,
    pub current_time_minutes: f64,
    pub average_time_per_step_minutes: f64,
    pub projected_total_time_minutes: f64,
    pub time_status: String,
    pub recommendations: Vec<String>,
    pub confidence: String,
}

pub fn project(manifest: &Manifest, remaining_phases: usize) -> Projection {
    let thresholds = BudgetThresholds::from_manifest(manifest);
    let total_cost = manifest.metrics.cumulative_cost;
    let total_time_seconds = manifest.metrics.cumulative_time_seconds;
    let step_count = manifest.history.len();

    let avg_cost = if step_count > 0 {
        total_cost / step_count as f64
    } else {
        0.0
    };
    let avg_time = if step_count > 0 {
        total_time_seconds / step_count as f64
    } else {
        0.0
    };

    let projected_total_cost = total_cost + avg_cost * remaining_phases as f64;
    let projected_total_time_minutes =
        (total_time_seconds + avg_time * remaining_phases as f64) / 60.0;

    let mut recommendations = Vec::new();
    let mut cost_status = "on track".to_string();
    let mut time_status = "on track".to_string();

    if thresholds.cost_threshold_usd > 0.0 {
        if projected_total_cost > thresholds.cost_threshold_usd {
            cost_status = format!(
                "projected ${projected_total_cost:.2} exceeds ${:.2} budget",
                thresholds.cost_threshold_usd
            );
            recommendations
                .push("Consider reducing job scope or increasing the cost budget".to_string());
        } else if (thresholds.cost_threshold_usd - total_cost) / thresholds.cost_threshold_usd
            < 0.25
        {
            cost_status = "low budget remaining".to_string();
            recommendations.push("Monitor cost closely over the remaining phases".to_string());
        }
    }

    if thresholds.time_threshold_minutes > 0.0 {
        if projected_total_time_minutes > thresholds.time_threshold_minutes {
            time_status = format!(
                "projected {projected_total_time_minutes:.1}m exceeds {:.1}m budget",
                thresholds.time_threshold_minutes
            );
            recommendations
                .push("Consider extending time limits or simplifying requirements".to_string());
        } else if (thresholds.time_threshold_minutes - total_time_seconds / 60.0)
            / thresholds.time_threshold_minutes
            < 0.25
        {
            time_status = "low time remaining".to_string();
            recommendations.push("Reassess progress priorities".to_string());
        }
    }

    if recommendations.is_empty() {
        recommendations.push("Budget and time tracking appear healthy".to_string());
    }

    Projection {
        current_cost: total_cost,
        average_cost_per_step: avg_cost,
        projected_total_cost,
        cost_status,
        current_time_minutes: total_time_seconds / 60.0,
        average_time_per_step_minutes: avg_time / 60.0,
        projected_total_time_minutes,
        time_status,
        recommendations,
        confidence: format!("Based on {step_count} completed steps"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HistoryEntry, JobState, Role, StepMetrics};

    fn manifest_with_steps(cost: f64, time: f64, steps: usize) -> Manifest {
        let mut manifest = Manifest::new("j1", None);
        manifest.history.clear();
        for _ in 0..steps {
            manifest.history.push(HistoryEntry::step(
                Role::Worker,
                "COMPLETED",
                None,
                StepMetrics {
                    cost_usd: cost / steps as f64,
                    token_input: 100,
                    token_output: 50,
                    cache_hit: true,
                    ..Default::default()
                },
                None,
                vec![],
                JobState::ReviewRequired,
            ));
        }
        manifest.metrics.cumulative_cost = cost;
        manifest.metrics.cumulative_time_seconds = time;
        manifest
    }

    #[test]
    fn zero_thresholds_disable_the_gate() {
        let manifest = manifest_with_steps(1000.0, 86_400.0, 4);
        assert!(check_thresholds(&manifest).is_ok());

        let snap = snapshot(&manifest);
        assert_eq!(snap.status_color, StatusColor::Green);
    }

    #[test]
    fn exceeded_cost_threshold_fails_fast() {
        let mut manifest = manifest_with_steps(5.0, 60.0, 2);
        manifest.cost_threshold = 4.0;

        let err = check_thresholds(&manifest).unwrap_err();
        assert!(err.to_string().contains("budget limits exceeded"));
    }

    #[test]
    fn warning_band_turns_yellow() {
        let mut manifest = manifest_with_steps(8.0, 0.0, 2);
        manifest.cost_threshold = 10.0;

        let snap = snapshot(&manifest);
        assert_eq!(snap.status_color, StatusColor::Yellow);
        assert!((snap.cost_percentage - 80.0).abs() < 1e-9);
        assert!((snap.cost_remaining - 2.0).abs() < 1e-9);
    }

    #[test]
    fn red_at_or_past_the_cap() {
        let mut manifest = manifest_with_steps(10.0, 0.0, 2);
        manifest.cost_threshold = 10.0;
        assert_eq!(snapshot(&manifest).status_color, StatusColor::Red);
    }

    #[test]
    fn time_threshold_counts_minutes() {
        let mut manifest = manifest_with_steps(0.0, 30.0 * 60.0, 2);
        manifest.time_threshold_minutes = 20.0;

        assert!(check_thresholds(&manifest).is_err());
        let snap = snapshot(&manifest);
        assert!((snap.time_percentage - 150.0).abs() < 1e-9);
        assert_eq!(snap.time_remaining_minutes, 0.0);
    }

    #[test]
    fn snapshot_aggregates_tokens_and_cache_hits() {
        let manifest = manifest_with_steps(1.0, 10.0, 3);
        let snap = snapshot(&manifest);

        assert_eq!(snap.total_tokens, 3 * 150);
        assert_eq!(snap.total_cache_hits, 3);
        assert_eq!(snap.completed_steps, 3);
        assert_eq!(snap.failed_steps, 0);
    }

    #[test]
    fn projection_uses_mean_per_step() {
        let mut manifest = manifest_with_steps(2.0, 120.0, 2);
        manifest.cost_threshold = 3.0;

        let projection = project(&manifest, 2);
        assert!((projection.average_cost_per_step - 1.0).abs() < 1e-9);
        assert!((projection.projected_total_cost - 4.0).abs() < 1e-9);
        assert!(projection.cost_status.contains("exceeds"));
        assert!(!projection.recommendations.is_empty());
    }

    #[test]
    fn projection_with_no_history_is_flat() {
        let mut manifest = Manifest::new("j1", None);
        manifest.history.clear();

        let projection = project(&manifest, 5);
        assert_eq!(projection.projected_total_cost, 0.0);
        assert_eq!(projection.confidence, "Based on 0 completed steps");
    }
}
