//! Job lifecycle states and the canonical transition table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{Classification, Severity};

/// Errors raised by the state machine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state transition: {from} + {role} + {action}")]
    InvalidTransition {
        from: JobState,
        role: Role,
        action: StepAction,
    },

    #[error("job is in terminal state {0} and accepts no transitions")]
    TerminalState(JobState),
}

/// The lifecycle state of a job.
///
/// The fine-grained `Provisioning`/`Executing`/`Harvesting`/`Recovering`
/// states are what the engine records for worker steps. `Running` and
/// `Reviewing` are the coarse single-state vocabulary older manifests used;
/// they still load, and recovery treats them as the worker/supervisor
/// executing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Configured but not yet activated for execution
    Draft,
    /// Ready to run, possibly queued
    Pending,
    /// Parked by a human; resumes only to Pending (or Canceled)
    Suspended,
    /// Workspace and attachments being prepared
    Provisioning,
    /// Executor invocation in flight (worker)
    Executing,
    /// Executor reply being extracted and validated
    Harvesting,
    /// Automatic recovery in progress
    Recovering,
    /// Legacy single executing state (worker pass)
    Running,
    /// Supervisor pass in flight
    Reviewing,
    /// Worker finished; a supervisor turn is next
    ReviewRequired,
    /// Supervisor finished; a human must approve or reject
    ApprovalRequired,
    /// Something went wrong that a human must repair
    InterventionRequired,
    /// Terminal: approved and done
    Success,
    /// Terminal: terminated by a human or a fatal error
    Canceled,
    /// Terminal: deprecated, kept so old manifests still load
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Canceled | JobState::Failed)
    }

    /// States a live step holds under the job lock.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            JobState::Provisioning
                | JobState::Executing
                | JobState::Harvesting
                | JobState::Recovering
                | JobState::Running
                | JobState::Reviewing
        )
    }

    /// States where the supervisor is the active role.
    pub fn is_review(&self) -> bool {
        matches!(self, JobState::ReviewRequired | JobState::Reviewing)
    }

    /// States where the run loop must stop and wait for a human.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            JobState::ApprovalRequired | JobState::InterventionRequired
        ) || self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Draft => "DRAFT",
            JobState::Pending => "PENDING",
            JobState::Suspended => "SUSPENDED",
            JobState::Provisioning => "PROVISIONING",
            JobState::Executing => "EXECUTING",
            JobState::Harvesting => "HARVESTING",
            JobState::Recovering => "RECOVERING",
            JobState::Running => "RUNNING",
            JobState::Reviewing => "REVIEWING",
            JobState::ReviewRequired => "REVIEW_REQUIRED",
            JobState::ApprovalRequired => "APPROVAL_REQUIRED",
            JobState::InterventionRequired => "INTERVENTION_REQUIRED",
            JobState::Success => "SUCCESS",
            JobState::Canceled => "CANCELED",
            JobState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The actor responsible for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Worker,
    Supervisor,
    System,
    Human,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Worker => write!(f, "Worker"),
            Role::Supervisor => write!(f, "Supervisor"),
            Role::System => write!(f, "System"),
            Role::Human => write!(f, "Human"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "worker" => Ok(Role::Worker),
            "supervisor" => Ok(Role::Supervisor),
            "system" => Ok(Role::System),
            "human" => Ok(Role::Human),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Actions that drive transitions: executor-reported outcomes plus
/// lifecycle events raised by the engine or a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepAction {
    Completed,
    Stuck,
    Retry,
    Activated,
    Suspend,
    Resume,
    StepStart,
    ProvisionOk,
    ProvisionFail,
    ExecuteOk,
    Recover,
    RecoverOk,
    HarvestSuccess,
    Approve,
    Reject,
    Resubmit,
    Terminate,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Compute the next state for `(current, role, action)`.
///
/// The table is the canonical one; two fallback rules apply afterwards:
/// any unlisted STUCK lands in `InterventionRequired`, any unlisted RETRY
/// is a self-loop. Guard rules are validated on the result: terminal
/// states accept nothing, `Suspended` resumes only to `Pending`/`Canceled`,
/// and `Draft` reaches only `Pending`/`Suspended`/`Canceled`.
pub fn transition(current: JobState, role: Role, action: StepAction) -> Result<JobState, StateError> {
    use JobState::*;
    use StepAction::*;

    if current.is_terminal() {
        return Err(StateError::TerminalState(current));
    }

    let next = match (current, role, action) {
        (Draft, Role::System, Activated) => Some(Pending),

        (_, _, Suspend) => Some(Suspended),
        (Suspended, Role::System, Resume) => Some(Pending),

        (Pending, Role::System, StepStart) => Some(Provisioning),
        (Provisioning, Role::System, ProvisionOk) => Some(Executing),
        (Provisioning, Role::System, ProvisionFail) => Some(InterventionRequired),
        (Executing, Role::System, ExecuteOk) => Some(Harvesting),
        (Executing, Role::System, Recover) => Some(Recovering),
        (Recovering, Role::System, RecoverOk) => Some(Executing),

        (Harvesting, Role::Worker, Completed) => Some(ReviewRequired),
        (Harvesting, Role::Worker, Stuck) => Some(InterventionRequired),
        // Worker RETRY returns to PENDING (mirrors the legacy RUNNING
        // row); a self-loop would wedge the job in a transient state.
        (Harvesting, Role::Worker, Retry) => Some(Pending),
        (Harvesting, Role::System, HarvestSuccess) => Some(Success),

        // Legacy coarse worker pass.
        (Running, Role::Worker, Completed) => Some(ReviewRequired),
        (Running, Role::Worker, Stuck) => Some(InterventionRequired),
        (Running, Role::Worker, Retry) => Some(Pending),

        (ReviewRequired | Reviewing, Role::Supervisor, Completed) => Some(ApprovalRequired),
        (ReviewRequired | Reviewing, Role::Supervisor, Stuck) => Some(InterventionRequired),
        (ReviewRequired | Reviewing, Role::Supervisor, Retry) => Some(ReviewRequired),

        (ApprovalRequired, Role::Human, Approve) => Some(Success),
        (ApprovalRequired, Role::Human, Reject) => Some(Pending),
        (InterventionRequired, Role::Human, Resubmit) => Some(Pending),

        (_, Role::Human, Terminate) => Some(Canceled),

        _ => None,
    };

    let next = match next {
        Some(n) => n,
        // Fallback rules for tuples the table does not list.
        None if action == Stuck => InterventionRequired,
        None if action == Retry => current,
        None => {
            return Err(StateError::InvalidTransition {
                from: current,
                role,
                action,
            });
        }
    };

    let allowed = match current {
        Draft => matches!(next, Pending | Suspended | Canceled),
        Suspended => matches!(next, Pending | Canceled),
        _ => true,
    };

    if !allowed {
        return Err(StateError::InvalidTransition {
            from: current,
            role,
            action,
        });
    }

    Ok(next)
}

/// Map a failure classification onto a status transition.
///
/// Transient failures leave the status alone so the caller can retry;
/// recoverable ones park the job for a human; fatal ones cancel it.
pub fn transition_on_error(current: JobState, classification: &Classification) -> Option<JobState> {
    if current.is_terminal() {
        return None;
    }

    match classification.severity {
        Severity::Transient => None,
        Severity::Recoverable => Some(JobState::InterventionRequired),
        Severity::Fatal => Some(JobState::Canceled),
    }
}
