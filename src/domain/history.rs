//! Append-only history entries recorded in the manifest and mirrored into
//! the secondary `jobHistory.json` log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{JobState, Role};

/// Event markers distinguishing lifecycle records from executor steps.
pub mod events {
    pub const JOB_CREATED: &str = "JOB_CREATED";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const RESTEP: &str = "RESTEP";
    pub const RERUN: &str = "RERUN";
    pub const POSTSTEP: &str = "POSTSTEP";
    pub const AUTOMATIC_RECOVERY: &str = "AUTOMATIC_RECOVERY";
    pub const CRASH_RECOVERY: &str = "CRASH_RECOVERY";
    pub const WORKSPACE_CLEANUP: &str = "WORKSPACE_CLEANUP";
    pub const SENTINEL_INTERVENTION: &str = "SENTINEL_INTERVENTION";
}

/// Per-step metrics extracted from the executor's metadata file.
/// Missing fields default to zero / false / absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(default)]
    pub cost_usd: f64,

    #[serde(default)]
    pub duration_seconds: f64,

    #[serde(default)]
    pub token_input: u64,

    #[serde(default)]
    pub token_output: u64,

    #[serde(default)]
    pub token_cache_read: u64,

    #[serde(default)]
    pub token_cache_write: u64,

    #[serde(default)]
    pub cache_hit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_seconds: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_tokens_per_second: Option<f64>,
}

impl StepMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.token_input + self.token_output + self.token_cache_read
    }
}

/// One record in a job's history.
///
/// Executor steps carry role/action/summary/metrics; lifecycle records
/// carry an `event` marker and whatever extra payload fits the event
/// (classification dumps, restep snapshots, recovery reasons) in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Stamped by the store at append time when the caller omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,

    /// Model the executor was asked to use for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<JobState>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HistoryEntry {
    /// Blank entry; builders below fill in the common shapes.
    pub fn empty() -> Self {
        Self {
            timestamp: None,
            event: None,
            role: None,
            action: None,
            summary: None,
            evidence_files: Vec::new(),
            metrics: None,
            model: None,
            executor_task_id: None,
            new_status: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Lifecycle record: an event marker plus a human-readable action line.
    pub fn lifecycle(event: &str, action: impl Into<String>) -> Self {
        let mut entry = Self::empty();
        entry.event = Some(event.to_string());
        entry.action = Some(action.into());
        entry
    }

    /// Executor step record.
    pub fn step(
        role: Role,
        action: impl Into<String>,
        summary: Option<String>,
        metrics: StepMetrics,
        executor_task_id: Option<String>,
        evidence_files: Vec<String>,
        new_status: JobState,
    ) -> Self {
        let mut entry = Self::empty();
        entry.role = Some(role);
        entry.action = Some(action.into());
        entry.summary = summary;
        entry.metrics = Some(metrics);
        entry.executor_task_id = executor_task_id;
        entry.evidence_files = evidence_files;
        entry.new_status = Some(new_status);
        entry
    }

    /// Attach an event-specific payload field.
    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// True for entries that represent an actual executor invocation
    /// (these bump `metrics.step_count`; lifecycle records do not).
    pub fn is_executor_step(&self) -> bool {
        self.role.is_some() && self.metrics.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_entries_count_as_executor_steps() {
        let entry = HistoryEntry::step(
            Role::Worker,
            "COMPLETED",
            Some("done".into()),
            StepMetrics::default(),
            Some("task-1".into()),
            vec!["out.txt".into()],
            JobState::ReviewRequired,
        )
        .with_model(Some("grok-code-fast-1".into()));
        assert!(entry.is_executor_step());
        assert_eq!(entry.model.as_deref(), Some("grok-code-fast-1"));

        let lifecycle = HistoryEntry::lifecycle(events::RESTEP, "rewound");
        assert!(!lifecycle.is_executor_step());
    }

    #[test]
    fn extra_payload_round_trips() {
        let entry = HistoryEntry::lifecycle(events::CRASH_RECOVERY, "recovered")
            .with_detail("previous_status", serde_json::json!("RUNNING"));

        let json = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.extra.get("previous_status"),
            Some(&serde_json::json!("RUNNING"))
        );
    }

    #[test]
    fn missing_metric_fields_default() {
        let metrics: StepMetrics = serde_json::from_str(r#"{"cost_usd": 0.25}"#).unwrap();
        assert_eq!(metrics.cost_usd, 0.25);
        assert_eq!(metrics.token_input, 0);
        assert!(!metrics.cache_hit);
        assert!(metrics.ttft_seconds.is_none());
    }
}
