//! Failure classification: couples executor failures to retry policy and
//! state transitions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ExecutorError;
use crate::domain::ReplyError;

/// How bad a failure is, which decides the status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Auto-retry; no status change, no intervention
    Transient,
    /// A human can fix it; job parks in INTERVENTION_REQUIRED
    Recoverable,
    /// Job cancellation required
    Fatal,
}

/// What kind of failure it was, which decides the retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Network,
    Validation,
    Resource,
    Execution,
    Configuration,
    System,
}

/// Complete diagnosis of a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    pub user_message: String,
    pub can_retry: bool,
    pub max_retries: u32,
    pub intervention_required: bool,
    pub suggested_action: String,
    /// Joins the history entry, the structured error log, and the
    /// per-incident correlation file.
    pub correlation_id: String,
}

impl Classification {
    /// Short `severity/category` tag for console output.
    pub fn label(&self) -> String {
        format!(
            "{}/{}",
            serde_json::to_string(&self.severity).unwrap_or_default().trim_matches('"'),
            serde_json::to_string(&self.category).unwrap_or_default().trim_matches('"'),
        )
    }
}

fn new_correlation_id() -> String {
    format!("error_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// The reusable part of a classifier rule: everything except the
/// per-incident correlation id.
#[derive(Debug, Clone)]
pub struct Template {
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    pub user_message: String,
    pub can_retry: bool,
    pub max_retries: u32,
    pub intervention_required: bool,
    pub suggested_action: String,
}

impl Template {
    fn instantiate(&self) -> Classification {
        Classification {
            severity: self.severity,
            category: self.category,
            description: self.description.clone(),
            user_message: self.user_message.clone(),
            can_retry: self.can_retry,
            max_retries: self.max_retries,
            intervention_required: self.intervention_required,
            suggested_action: self.suggested_action.clone(),
            correlation_id: new_correlation_id(),
        }
    }
}

/// One rule in the subprocess-failure table. A rule matches when the exit
/// code agrees (or the rule has none) and the pattern matches the
/// lowercased combined output (or the rule has none). First match wins.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub exit_code: Option<i32>,
    pub pattern: Option<Regex>,
    pub template: Template,
}

impl Rule {
    fn matches(&self, exit_code: Option<i32>, combined_lower: &str) -> bool {
        if let Some(expected) = self.exit_code {
            if exit_code != Some(expected) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(combined_lower) {
                return false;
            }
        }
        true
    }
}

/// Classifies failures. The subprocess heuristics live in an ordered rule
/// table so operators can extend the set at runtime; the default table is
/// sealed and always present as the tail.
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<Rule> {
    let rule = |name: &str,
                exit_code: Option<i32>,
                pattern: Option<&str>,
                template: Template| Rule {
        name: name.to_string(),
        exit_code,
        pattern: pattern.map(|p| Regex::new(p).expect("default classifier pattern")),
        template,
    };

    vec![
        rule(
            "executor_timeout",
            Some(124),
            None,
            Template {
                severity: Severity::Transient,
                category: Category::Execution,
                description: "Executor run timed out".into(),
                user_message: "LLM execution timed out. This is usually temporary.".into(),
                can_retry: true,
                max_retries: 2,
                intervention_required: false,
                suggested_action: "Automatic retry with increased timeout".into(),
            },
        ),
        rule(
            "authentication",
            Some(1),
            Some("api key|authentication"),
            Template {
                severity: Severity::Fatal,
                category: Category::Configuration,
                description: "API authentication failed".into(),
                user_message: "API key or authentication configuration error.".into(),
                can_retry: false,
                max_retries: 0,
                intervention_required: true,
                suggested_action: "Check API keys and authentication setup".into(),
            },
        ),
        rule(
            "quota",
            Some(1),
            Some("quota exceeded|rate limit"),
            Template {
                severity: Severity::Recoverable,
                category: Category::Resource,
                description: "API quota or rate limit exceeded".into(),
                user_message: "API quota exceeded. Please wait or check billing.".into(),
                can_retry: true,
                max_retries: 1,
                intervention_required: true,
                suggested_action: "Wait for quota reset or upgrade plan".into(),
            },
        ),
        rule(
            "network",
            Some(1),
            Some("network|connection"),
            Template {
                severity: Severity::Transient,
                category: Category::Network,
                description: "Network connectivity issue".into(),
                user_message: "Network connection failed. This is usually temporary.".into(),
                can_retry: true,
                max_retries: 3,
                intervention_required: false,
                suggested_action: "Automatic retry with exponential backoff".into(),
            },
        ),
        rule(
            "executor_error",
            Some(1),
            None,
            Template {
                severity: Severity::Recoverable,
                category: Category::Execution,
                description: "Executor run failed with code 1".into(),
                user_message: "LLM execution failed. Please check the error details.".into(),
                can_retry: true,
                max_retries: 1,
                intervention_required: true,
                suggested_action: "Review error output and job configuration".into(),
            },
        ),
        rule(
            "filesystem",
            Some(2),
            None,
            Template {
                severity: Severity::Recoverable,
                category: Category::System,
                description: "File system error in executor run".into(),
                user_message: "File system error occurred during execution.".into(),
                can_retry: false,
                max_retries: 0,
                intervention_required: true,
                suggested_action: "Check file permissions and workspace setup".into(),
            },
        ),
        rule(
            "unknown_exit",
            None,
            None,
            Template {
                severity: Severity::Recoverable,
                category: Category::Execution,
                description: "Unknown subprocess exit code".into(),
                user_message: "Unexpected error occurred.".into(),
                can_retry: true,
                max_retries: 1,
                intervention_required: true,
                suggested_action: "Review error output and retry operation".into(),
            },
        ),
    ]
}

impl Classifier {
    /// Register an operator rule ahead of the sealed defaults.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.insert(0, rule);
    }

    /// Classify a non-zero subprocess exit.
    pub fn classify_exit(&self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> Classification {
        let combined = format!("{stdout}{stderr}").to_lowercase();

        let mut classification = self
            .rules
            .iter()
            .find(|r| r.matches(exit_code, &combined))
            .map(|r| r.template.instantiate())
            // Unreachable with the sealed defaults present, but an
            // operator-supplied table could be empty.
            .unwrap_or_else(|| Template {
                severity: Severity::Recoverable,
                category: Category::Execution,
                description: "Unhandled subprocess failure".into(),
                user_message: "An unexpected error occurred.".into(),
                can_retry: true,
                max_retries: 1,
                intervention_required: true,
                suggested_action: "Review error details and retry operation".into(),
            }
            .instantiate());

        if let Some(code) = exit_code {
            classification.description = format!("{} (exit code {code})", classification.description);
        }
        classification
    }

    /// JSON parsing / schema validation failures in the executor's reply.
    pub fn classify_reply_error(&self, error: &ReplyError) -> Classification {
        let (description, suggested) = match error {
            ReplyError::NoJson | ReplyError::Malformed(_) => (
                "Executor returned malformed JSON".to_string(),
                "Executor may need better JSON formatting instructions",
            ),
            ReplyError::Schema(_) | ReplyError::SummaryTooLong(_) => (
                "Executor reply failed schema validation".to_string(),
                "Review reply format requirements with the executor",
            ),
        };

        Classification {
            severity: Severity::Recoverable,
            category: Category::Validation,
            description: format!("{description}: {error}"),
            user_message: "The executor reply did not match the expected format.".into(),
            can_retry: true,
            max_retries: 2,
            intervention_required: true,
            suggested_action: suggested.into(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Wall-clock timeouts raised by the adapter itself.
    pub fn classify_timeout(&self, timeout_seconds: u64, operation: &str) -> Classification {
        Classification {
            severity: Severity::Transient,
            category: Category::Execution,
            description: format!("{operation} timed out after {timeout_seconds} seconds"),
            user_message: "Operation timed out. This is usually temporary.".into(),
            can_retry: true,
            max_retries: 2,
            intervention_required: false,
            suggested_action: "Automatic retry with longer timeout".into(),
        correlation_id: new_correlation_id(),
        }
    }

    /// File system / permission level failures.
    pub fn classify_system(&self, error_text: &str, operation: &str) -> Classification {
        let lower = error_text.to_lowercase();

        if lower.contains("permission denied") || lower.contains("access denied") {
            return Classification {
                severity: Severity::Fatal,
                category: Category::System,
                description: format!("Permission denied during {operation}"),
                user_message: "File system permissions prevent operation.".into(),
                can_retry: false,
                max_retries: 0,
                intervention_required: true,
                suggested_action: "Check file permissions and user access rights".into(),
                correlation_id: new_correlation_id(),
            };
        }

        if lower.contains("no such file") || lower.contains("not found") {
            return Classification {
                severity: Severity::Recoverable,
                category: Category::System,
                description: format!("Required file missing during {operation}"),
                user_message: "Required file or directory is missing.".into(),
                can_retry: false,
                max_retries: 0,
                intervention_required: true,
                suggested_action: "Verify file paths and recreate missing files".into(),
                correlation_id: new_correlation_id(),
            };
        }

        // "disk full"/"disk space" plus ENOSPC's "no space left on device".
        if (lower.contains("disk") && (lower.contains("full") || lower.contains("space")))
            || lower.contains("no space left")
        {
            return Classification {
                severity: Severity::Fatal,
                category: Category::Resource,
                description: "Disk space exhausted".into(),
                user_message: "No disk space available for operation.".into(),
                can_retry: false,
                max_retries: 0,
                intervention_required: true,
                suggested_action: "Free up disk space and retry".into(),
                correlation_id: new_correlation_id(),
            };
        }

        Classification {
            severity: Severity::Recoverable,
            category: Category::System,
            description: format!("System error during {operation}: {error_text}"),
            user_message: "System-level error occurred during operation.".into(),
            can_retry: true,
            max_retries: 1,
            intervention_required: true,
            suggested_action: "Check system resources and configuration".into(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Turn any adapter error into a classification; subprocess failures
    /// already carry one.
    pub fn classify_executor_error(&self, error: &ExecutorError) -> Classification {
        match error {
            ExecutorError::Failed { classification, .. } => classification.clone(),
            ExecutorError::Timeout { seconds } => {
                self.classify_timeout(*seconds, "Executor run")
            }
            ExecutorError::Reply(reply_error) => self.classify_reply_error(reply_error),
            ExecutorError::NoTaskId
            | ExecutorError::TaskDirMissing(_)
            | ExecutorError::ConversationMissing(_)
            | ExecutorError::NoReplyInConversation => Classification {
                severity: Severity::Recoverable,
                category: Category::Validation,
                description: error.to_string(),
                user_message: "Could not locate the executor's task output.".into(),
                can_retry: true,
                max_retries: 1,
                intervention_required: true,
                suggested_action: "Check the executor installation and its data directory".into(),
                correlation_id: new_correlation_id(),
            },
            ExecutorError::Spawn(msg) => self.classify_system(msg, "executor spawn"),
            ExecutorError::Io(io) => self.classify_system(&io.to_string(), "executor I/O"),
        }
    }
}

/// Whether another attempt is allowed after `attempt` prior failures.
pub fn should_retry(classification: &Classification, attempt: u32) -> bool {
    classification.can_retry && attempt < classification.max_retries
}

/// Delay before the next attempt: exponential for network, linear for
/// quota/resource, a short fixed delay otherwise.
pub fn retry_delay(classification: &Classification, attempt: u32) -> Duration {
    match classification.category {
        Category::Network => Duration::from_secs(1 << attempt.min(6)),
        Category::Resource => Duration::from_secs(30 * (u64::from(attempt) + 1)),
        _ => Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_124_is_transient_execution() {
        let c = Classifier::default().classify_exit(Some(124), "", "");
        assert_eq!(c.severity, Severity::Transient);
        assert_eq!(c.category, Category::Execution);
        assert_eq!(c.max_retries, 2);
        assert!(!c.intervention_required);
    }

    #[test]
    fn auth_failure_is_fatal_configuration() {
        let c = Classifier::default().classify_exit(Some(1), "", "Authentication failed: bad key");
        assert_eq!(c.severity, Severity::Fatal);
        assert_eq!(c.category, Category::Configuration);
        assert!(!c.can_retry);
    }

    #[test]
    fn rate_limit_is_recoverable_resource() {
        let c = Classifier::default().classify_exit(Some(1), "rate limit reached", "");
        assert_eq!(c.severity, Severity::Recoverable);
        assert_eq!(c.category, Category::Resource);
        assert_eq!(c.max_retries, 1);
    }

    #[test]
    fn network_failure_is_transient_with_three_retries() {
        let c = Classifier::default().classify_exit(Some(1), "", "connection refused");
        assert_eq!(c.severity, Severity::Transient);
        assert_eq!(c.category, Category::Network);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn plain_exit_1_is_recoverable_execution() {
        let c = Classifier::default().classify_exit(Some(1), "something broke", "");
        assert_eq!(c.severity, Severity::Recoverable);
        assert_eq!(c.category, Category::Execution);
    }

    #[test]
    fn exit_2_is_filesystem() {
        let c = Classifier::default().classify_exit(Some(2), "", "");
        assert_eq!(c.category, Category::System);
        assert!(!c.can_retry);
    }

    #[test]
    fn unknown_exit_falls_through() {
        let c = Classifier::default().classify_exit(Some(42), "", "");
        assert_eq!(c.severity, Severity::Recoverable);
        assert_eq!(c.category, Category::Execution);
    }

    #[test]
    fn operator_rules_take_priority() {
        let mut classifier = Classifier::default();
        classifier.add_rule(Rule {
            name: "proxy_flake".into(),
            exit_code: Some(1),
            pattern: Some(Regex::new("proxy unreachable").unwrap()),
            template: Template {
                severity: Severity::Transient,
                category: Category::Network,
                description: "Corp proxy flake".into(),
                user_message: "Proxy unreachable".into(),
                can_retry: true,
                max_retries: 5,
                intervention_required: false,
                suggested_action: "Retry".into(),
            },
        });

        let c = classifier.classify_exit(Some(1), "", "proxy unreachable");
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.category, Category::Network);
    }

    #[test]
    fn system_error_heuristics() {
        let classifier = Classifier::default();

        let c = classifier.classify_system("Permission denied (os error 13)", "manifest write");
        assert_eq!(c.severity, Severity::Fatal);
        assert_eq!(c.category, Category::System);

        let c = classifier.classify_system("No such file or directory", "prompt write");
        assert_eq!(c.severity, Severity::Recoverable);
        assert!(!c.can_retry);

        for text in ["disk full", "insufficient disk space", "No space left on device"] {
            let c = classifier.classify_system(text, "workspace archive");
            assert_eq!(c.severity, Severity::Fatal, "{text}");
            assert_eq!(c.category, Category::Resource, "{text}");
            assert!(!c.can_retry, "{text}");
        }
    }

    #[test]
    fn retry_schedule_by_category() {
        let mut c = Classifier::default().classify_exit(Some(1), "", "network down");
        assert_eq!(retry_delay(&c, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(&c, 2), Duration::from_secs(4));

        c.category = Category::Resource;
        assert_eq!(retry_delay(&c, 0), Duration::from_secs(30));
        assert_eq!(retry_delay(&c, 1), Duration::from_secs(60));

        c.category = Category::Validation;
        assert_eq!(retry_delay(&c, 3), Duration::from_secs(1));
    }

    #[test]
    fn should_retry_respects_limits() {
        let c = Classifier::default().classify_exit(Some(124), "", "");
        assert!(should_retry(&c, 0));
        assert!(should_retry(&c, 1));
        assert!(!should_retry(&c, 2));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let classifier = Classifier::default();
        let a = classifier.classify_exit(Some(1), "", "");
        let b = classifier.classify_exit(Some(1), "", "");
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.correlation_id.starts_with("error_"));
    }
}
