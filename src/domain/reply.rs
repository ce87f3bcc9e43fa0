//! The structured reply the executor must produce, and its extraction from
//! free-form agent output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::history::StepMetrics;
use super::state::StepAction;

/// Longest summary the supervisor contract accepts.
pub const MAX_SUMMARY_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("could not find a JSON object in executor output")]
    NoJson,

    #[error("executor reply is not valid JSON: {0}")]
    Malformed(String),

    #[error("executor reply failed schema validation: {0}")]
    Schema(String),

    #[error("summary_for_supervisor exceeds {max} characters ({0})", max = MAX_SUMMARY_LEN)]
    SummaryTooLong(usize),
}

/// Outcome the executor reports for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyAction {
    Completed,
    Stuck,
    Retry,
}

impl From<ReplyAction> for StepAction {
    fn from(action: ReplyAction) -> Self {
        match action {
            ReplyAction::Completed => StepAction::Completed,
            ReplyAction::Stuck => StepAction::Stuck,
            ReplyAction::Retry => StepAction::Retry,
        }
    }
}

impl std::fmt::Display for ReplyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyAction::Completed => write!(f, "COMPLETED"),
            ReplyAction::Stuck => write!(f, "STUCK"),
            ReplyAction::Retry => write!(f, "RETRY"),
        }
    }
}

/// The validated reply schema. No additional properties are accepted, so a
/// reply that smuggles extra keys fails loudly instead of silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorReply {
    pub action: ReplyAction,
    pub evidence_files: Vec<String>,
    pub summary_for_supervisor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_manifest_url: Option<String>,
}

impl ExecutorReply {
    pub fn validate(&self) -> Result<(), ReplyError> {
        let len = self.summary_for_supervisor.chars().count();
        if len > MAX_SUMMARY_LEN {
            return Err(ReplyError::SummaryTooLong(len));
        }
        Ok(())
    }
}

/// Extract and validate a reply from raw agent output.
///
/// Accepts either a fenced ```json block or the outermost brace span, the
/// two shapes executors actually emit.
pub fn parse_reply(output: &str) -> Result<ExecutorReply, ReplyError> {
    let json_str = extract_json_candidate(output).ok_or(ReplyError::NoJson)?;

    let value: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| ReplyError::Malformed(e.to_string()))?;

    let reply: ExecutorReply =
        serde_json::from_value(value).map_err(|e| ReplyError::Schema(e.to_string()))?;

    reply.validate()?;
    Ok(reply)
}

fn extract_json_candidate(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let body = &output[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end > start {
        Some(&output[start..=end])
    } else {
        None
    }
}

/// Slim summary of the last reply, persisted as `latest-outcome.json` and
/// fed back into the next step's context and attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestOutcome {
    pub action: ReplyAction,
    pub summary_for_supervisor: String,

    #[serde(default)]
    pub evidence_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_task_id: Option<String>,

    #[serde(default)]
    pub metrics: StepMetrics,
}

impl LatestOutcome {
    pub fn from_reply(reply: &ExecutorReply, metrics: StepMetrics, task_id: Option<String>) -> Self {
        Self {
            action: reply.action,
            summary_for_supervisor: reply.summary_for_supervisor.clone(),
            evidence_files: reply.evidence_files.clone(),
            timestamp: Some(Utc::now()),
            executor_task_id: task_id,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_block() {
        let output = "Some preamble\n```json\n{\"action\": \"COMPLETED\", \"evidence_files\": [\"out.txt\"], \"summary_for_supervisor\": \"done\"}\n```\ntrailing";
        let reply = parse_reply(output).unwrap();
        assert_eq!(reply.action, ReplyAction::Completed);
        assert_eq!(reply.evidence_files, vec!["out.txt"]);
    }

    #[test]
    fn parses_bare_braces() {
        let output = r#"thinking... {"action": "STUCK", "evidence_files": [], "summary_for_supervisor": "blocked on credentials"} bye"#;
        let reply = parse_reply(output).unwrap();
        assert_eq!(reply.action, ReplyAction::Stuck);
    }

    #[test]
    fn rejects_unknown_action() {
        let output = r#"{"action": "DONE", "evidence_files": [], "summary_for_supervisor": "x"}"#;
        assert!(matches!(parse_reply(output), Err(ReplyError::Schema(_))));
    }

    #[test]
    fn rejects_additional_properties() {
        let output = r#"{"action": "COMPLETED", "evidence_files": [], "summary_for_supervisor": "x", "mood": "great"}"#;
        assert!(matches!(parse_reply(output), Err(ReplyError::Schema(_))));
    }

    #[test]
    fn rejects_missing_required_field() {
        let output = r#"{"action": "COMPLETED", "evidence_files": []}"#;
        assert!(matches!(parse_reply(output), Err(ReplyError::Schema(_))));
    }

    #[test]
    fn rejects_overlong_summary() {
        let summary = "x".repeat(MAX_SUMMARY_LEN + 1);
        let output = format!(
            r#"{{"action": "COMPLETED", "evidence_files": [], "summary_for_supervisor": "{summary}"}}"#
        );
        assert!(matches!(
            parse_reply(&output),
            Err(ReplyError::SummaryTooLong(_))
        ));
    }

    #[test]
    fn no_json_at_all() {
        assert!(matches!(parse_reply("nothing here"), Err(ReplyError::NoJson)));
    }

    #[test]
    fn optional_manifest_url_accepted() {
        let output = r#"{"action": "RETRY", "evidence_files": [], "summary_for_supervisor": "retrying", "job_manifest_url": "file:///tmp/m.json"}"#;
        let reply = parse_reply(output).unwrap();
        assert_eq!(reply.action, ReplyAction::Retry);
        assert!(reply.job_manifest_url.is_some());
    }
}
