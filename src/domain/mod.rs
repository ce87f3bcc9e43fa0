//! Core domain types for Steward

mod history;
mod manifest;
mod reply;
mod state;

pub use history::{HistoryEntry, StepMetrics, events};
pub use manifest::{JobConfig, Manifest, ManifestError, Metrics, Phase, RerunInfo};
pub use reply::{
    ExecutorReply, LatestOutcome, MAX_SUMMARY_LEN, ReplyAction, ReplyError, parse_reply,
};
pub use state::{JobState, Role, StateError, StepAction, transition, transition_on_error};
