//! The job manifest: the canonical on-disk record of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::history::{HistoryEntry, events};
use super::state::{JobState, Role};

/// Errors raised while interpreting a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("job manifest is missing 'current_phase'")]
    MissingCurrentPhase,

    #[error("job manifest has no phases defined")]
    NoPhases,

    #[error("phase '{0}' not found in job manifest phases")]
    UnknownPhase(String),

    #[error("invalid step number {step}: job has {available} phases (0-{})", .available.saturating_sub(1))]
    InvalidStepNumber { step: usize, available: usize },
}

/// A named sub-step of a job. The active phase determines which role the
/// executor runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Role that executes this phase; Worker when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agent: Option<Role>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            active_agent: None,
        }
    }
}

/// Draft-time configuration: what the job is supposed to achieve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Relevant files, relative to the workspace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl JobConfig {
    pub fn is_empty(&self) -> bool {
        self.objective.is_none()
            && self.details.is_none()
            && self.acceptance.is_none()
            && self.prompt.is_none()
            && self.files.is_empty()
    }
}

/// Run-scoped cumulative metrics. Non-decreasing except across a rerun,
/// which zeroes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub cumulative_cost: f64,

    #[serde(default)]
    pub cumulative_time_seconds: f64,

    #[serde(default)]
    pub step_count: u64,
}

/// Rerun marker recorded in the manifest when a fresh run begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerunInfo {
    pub is_rerun: bool,
    pub start_phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// The canonical state of a job as stored in `job_manifest.json`.
///
/// Unknown fields survive a load/save round trip through `extra`, so users
/// can annotate manifests without the engine discarding their notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub status: JobState,

    #[serde(default)]
    pub current_phase: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,

    #[serde(default, skip_serializing_if = "JobConfig::is_empty")]
    pub config: JobConfig,

    #[serde(default)]
    pub metrics: Metrics,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Budget cap in USD; zero means unlimited.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cost_threshold: f64,

    /// Budget cap in minutes; zero means unlimited.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time_threshold_minutes: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_percentage: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Pid of the process last driving this job, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,

    #[serde(
        rename = "_rerun_info",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rerun_info: Option<RerunInfo>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Manifest {
    /// Fresh DRAFT manifest with a creation event in history.
    pub fn new(job_id: impl Into<String>, description: Option<String>) -> Self {
        let job_id = job_id.into();
        let now = Utc::now();

        let mut created = HistoryEntry::lifecycle(events::JOB_CREATED, "Job directory created");
        created.timestamp = Some(now);

        Self {
            description: description.or_else(|| Some(format!("Job {job_id}"))),
            job_id,
            status: JobState::Draft,
            current_phase: None,
            phases: Vec::new(),
            config: JobConfig::default(),
            metrics: Metrics::default(),
            history: vec![created],
            cost_threshold: 0.0,
            time_threshold_minutes: 0.0,
            warning_percentage: None,
            created_at: now,
            updated_at: now,
            process_id: None,
            rerun_info: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Look up a phase by name.
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phase by ordinal, validating the bound the way restep/rerun need.
    pub fn phase_at(&self, step: usize) -> Result<&Phase, ManifestError> {
        if self.phases.is_empty() {
            return Err(ManifestError::NoPhases);
        }
        self.phases.get(step).ok_or(ManifestError::InvalidStepNumber {
            step,
            available: self.phases.len(),
        })
    }

    /// Resolve the active phase and role for the next step.
    ///
    /// The phase's `active_agent` wins, defaulting to Worker; a review
    /// status forces Supervisor regardless of the phase declaration.
    pub fn current_phase_and_role(&self) -> Result<(String, Role), ManifestError> {
        let phase_name = self
            .current_phase
            .clone()
            .ok_or(ManifestError::MissingCurrentPhase)?;

        if self.phases.is_empty() {
            return Err(ManifestError::NoPhases);
        }

        let phase = self
            .phase(&phase_name)
            .ok_or_else(|| ManifestError::UnknownPhase(phase_name.clone()))?;

        let mut role = phase.active_agent.unwrap_or(Role::Worker);
        if self.status.is_review() {
            role = Role::Supervisor;
        }

        Ok((phase_name, role))
    }

    /// Most recent executor task id in history, newest first.
    pub fn latest_executor_task_id(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find_map(|e| e.executor_task_id.as_deref())
    }

    /// Timestamp of the newest timestamped history entry.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find_map(|e| e.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manifest_is_draft_with_creation_event() {
        let m = Manifest::new("j1", None);
        assert_eq!(m.status, JobState::Draft);
        assert_eq!(m.history.len(), 1);
        assert_eq!(m.history[0].event.as_deref(), Some(events::JOB_CREATED));
        assert_eq!(m.metrics.cumulative_cost, 0.0);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let mut m = Manifest::new("j1", None);
        m.extra.insert(
            "operator_note".to_string(),
            serde_json::json!("reviewed by alice"),
        );

        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.extra.get("operator_note"),
            Some(&serde_json::json!("reviewed by alice"))
        );

        // Canonical normalization: a second round trip is byte-identical.
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn role_resolution_defaults_to_worker() {
        let mut m = Manifest::new("j1", None);
        m.phases = vec![Phase::new("plan"), Phase::new("impl")];
        m.current_phase = Some("plan".to_string());
        m.status = JobState::Pending;

        let (phase, role) = m.current_phase_and_role().unwrap();
        assert_eq!(phase, "plan");
        assert_eq!(role, Role::Worker);
    }

    #[test]
    fn review_status_forces_supervisor() {
        let mut m = Manifest::new("j1", None);
        m.phases = vec![Phase::new("plan")];
        m.current_phase = Some("plan".to_string());
        m.status = JobState::ReviewRequired;

        let (_, role) = m.current_phase_and_role().unwrap();
        assert_eq!(role, Role::Supervisor);
    }

    #[test]
    fn phase_declared_supervisor_wins_over_worker_default() {
        let mut m = Manifest::new("j1", None);
        let mut review = Phase::new("review");
        review.active_agent = Some(Role::Supervisor);
        m.phases = vec![Phase::new("impl"), review];
        m.current_phase = Some("review".to_string());
        m.status = JobState::Pending;

        let (_, role) = m.current_phase_and_role().unwrap();
        assert_eq!(role, Role::Supervisor);
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let mut m = Manifest::new("j1", None);
        m.phases = vec![Phase::new("plan")];
        m.current_phase = Some("missing".to_string());

        assert!(matches!(
            m.current_phase_and_role(),
            Err(ManifestError::UnknownPhase(_))
        ));
    }

    #[test]
    fn phase_at_rejects_out_of_range() {
        let mut m = Manifest::new("j1", None);
        m.phases = vec![Phase::new("plan"), Phase::new("impl")];

        assert!(m.phase_at(0).is_ok());
        assert!(m.phase_at(1).is_ok());
        assert!(matches!(
            m.phase_at(2),
            Err(ManifestError::InvalidStepNumber { step: 2, available: 2 })
        ));
    }
}
