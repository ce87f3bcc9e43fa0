//! Advisory log-pattern state inference.
//!
//! The observer scans raw log content against a dictionary of named regex
//! patterns, each annotated with the states it can indicate. It only ever
//! advises: the sentinel uses it for secondary evidence and diagnostic
//! commands print its reports, but nothing here writes job state.

use regex::Regex;
use std::collections::HashMap;

use crate::domain::JobState;

/// How sure a detection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
    Certain,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
            Confidence::Certain => write!(f, "certain"),
        }
    }
}

/// One per-line detection.
#[derive(Debug, Clone)]
pub struct StateDetection {
    pub state: String,
    pub confidence: Confidence,
    pub pattern_name: String,
    pub matched_text: String,
    pub line_number: usize,
}

/// A transition the observer believes it saw, filtered for consistency
/// with the state machine.
#[derive(Debug, Clone)]
pub struct TransitionDetection {
    pub from_state: String,
    pub to_state: String,
    pub confidence: Confidence,
    pub trigger_pattern: String,
}

/// Full analysis of a log blob.
#[derive(Debug)]
pub struct ObserverReport {
    pub detections: Vec<StateDetection>,
    pub inferred_state: Option<String>,
    pub transitions: Vec<TransitionDetection>,
    pub recommendation: String,
}

struct PatternEntry {
    name: String,
    regex: Regex,
    associated_states: Vec<String>,
    #[allow(dead_code)]
    description: String,
}

/// The pattern dictionary plus analysis over it.
pub struct LogObserver {
    patterns: Vec<PatternEntry>,
    names: HashMap<String, usize>,
}

impl Default for LogObserver {
    fn default() -> Self {
        let mut observer = Self {
            patterns: Vec::new(),
            names: HashMap::new(),
        };

        let defaults: &[(&str, &str, &[&str], &str)] = &[
            (
                "job_started",
                r"(?i)(?:job|task|process)\s+(?:started|initiated|beginning|launch)",
                &["DRAFT", "PENDING"],
                "Job startup messages",
            ),
            (
                "execution_begun",
                r"(?i)(?:execution|running|active|processing)\s+(?:started|began|initiated)",
                &["PENDING", "RUNNING"],
                "Execution actually beginning",
            ),
            (
                "worker_activation",
                r"(?i)(?:worker|agent)\s+(?:activated|engaged|running|executing)",
                &["RUNNING"],
                "Worker activation",
            ),
            (
                "supervisor_review",
                r"(?i)(?:supervisor|reviewer|checker)\s+(?:activated|engaged|reviewing|analyzing)",
                &["REVIEW_REQUIRED", "REVIEWING"],
                "Supervisor review activation",
            ),
            (
                "worker_completed",
                r"(?i)(?:worker|agent)\s+(?:completed|finished|done)\s+(?:task|work|execution)",
                &["REVIEW_REQUIRED"],
                "Worker completion requiring review",
            ),
            (
                "supervisor_approved",
                r"(?i)(?:supervisor|reviewer)\s+(?:approved|accepted|confirmed|validated)",
                &["APPROVAL_REQUIRED", "SUCCESS"],
                "Supervisor approval",
            ),
            (
                "stuck_detected",
                r"(?i)(?:stuck|hung|frozen|deadlock|unresponsive)",
                &["INTERVENTION_REQUIRED"],
                "Stuck or hung processes",
            ),
            (
                "error_occurred",
                r"(?i)(?:error|exception|failure|fault)\s+(?:occurred|detected|found|raised)",
                &["INTERVENTION_REQUIRED", "CANCELED", "FAILED"],
                "General error conditions",
            ),
            (
                "network_error",
                r"(?i)(?:network|connection|timeout|unreachable|dns|ssl)\s+(?:error|failure|issue)",
                &["INTERVENTION_REQUIRED"],
                "Network-related errors",
            ),
            (
                "retry_needed",
                r"(?i)(?:retry|re-attempt|try\s+again)\s+(?:needed|required|requested)",
                &["PENDING"],
                "Retry requested",
            ),
            (
                "waiting_input",
                r"(?i)(?:waiting|awaiting|pending)\s+(?:input|response|approval|confirmation)",
                &["REVIEW_REQUIRED", "APPROVAL_REQUIRED"],
                "Waiting for a human",
            ),
        ];

        for (name, pattern, states, description) in defaults {
            observer
                .register(name, pattern, states, description)
                .expect("default observer pattern");
        }

        observer
    }
}

impl LogObserver {
    /// Register a custom pattern. Duplicate names are rejected so an
    /// operator addition can't silently shadow a default.
    pub fn register(
        &mut self,
        name: &str,
        pattern: &str,
        associated_states: &[&str],
        description: &str,
    ) -> Result<(), String> {
        if self.names.contains_key(name) {
            return Err(format!("pattern '{name}' already exists"));
        }
        let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern '{name}': {e}"))?;

        self.names.insert(name.to_string(), self.patterns.len());
        self.patterns.push(PatternEntry {
            name: name.to_string(),
            regex,
            associated_states: associated_states.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
        });
        Ok(())
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }

    /// Patterns that can indicate a given state.
    pub fn patterns_for_state(&self, state: &str) -> Vec<&str> {
        self.patterns
            .iter()
            .filter(|p| p.associated_states.iter().any(|s| s == state))
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Analyze one line. The narrower a pattern's state set, the higher
    /// the confidence; a context state that agrees bumps it further.
    pub fn detect_line(
        &self,
        line: &str,
        line_number: usize,
        context_state: Option<&str>,
    ) -> Option<StateDetection> {
        let mut best: Option<StateDetection> = None;

        for pattern in &self.patterns {
            let Some(matched) = pattern.regex.find(line) else {
                continue;
            };
            if pattern.associated_states.is_empty() {
                continue;
            }

            let mut confidence = match pattern.associated_states.len() {
                1 => Confidence::High,
                2 => Confidence::Medium,
                _ => Confidence::Low,
            };

            // Pick the state: context agreement wins, else the first.
            let state = context_state
                .filter(|ctx| pattern.associated_states.iter().any(|s| s == ctx))
                .map(|ctx| {
                    confidence = bump(confidence);
                    ctx.to_string()
                })
                .unwrap_or_else(|| pattern.associated_states[0].clone());

            let candidate = StateDetection {
                state,
                confidence,
                pattern_name: pattern.name.clone(),
                matched_text: matched.as_str().to_string(),
                line_number,
            };

            if best
                .as_ref()
                .map(|b| candidate.confidence > b.confidence)
                .unwrap_or(true)
            {
                best = Some(candidate);
            }
        }

        best
    }

    /// Scan a whole log: per-line detections, the inferred current state
    /// (most recent high-confidence detection), transitions consistent
    /// with the state machine, and a recommendation.
    pub fn analyze(&self, content: &str, context_state: Option<&str>) -> ObserverReport {
        let mut detections = Vec::new();

        for (i, line) in content.lines().enumerate() {
            if let Some(detection) = self.detect_line(line, i + 1, context_state) {
                detections.push(detection);
            }
        }

        let inferred_state = detections
            .iter()
            .rev()
            .find(|d| d.confidence >= Confidence::High)
            .or_else(|| detections.last())
            .map(|d| d.state.clone());

        let mut transitions = Vec::new();
        for pair in detections.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if from.state != to.state && plausible_transition(&from.state, &to.state) {
                transitions.push(TransitionDetection {
                    from_state: from.state.clone(),
                    to_state: to.state.clone(),
                    confidence: from.confidence.min(to.confidence),
                    trigger_pattern: to.pattern_name.clone(),
                });
            }
        }

        let recommendation = match inferred_state.as_deref() {
            Some("INTERVENTION_REQUIRED" | "CANCELED" | "FAILED") => {
                "immediate attention: job appears to be in an error state".to_string()
            }
            Some("REVIEW_REQUIRED" | "APPROVAL_REQUIRED") => {
                "manual review: job is waiting on a human".to_string()
            }
            Some(_) => "no action needed".to_string(),
            None => "no state evidence found in log".to_string(),
        };

        ObserverReport {
            detections,
            inferred_state,
            transitions,
            recommendation,
        }
    }
}

fn bump(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::Low => Confidence::Medium,
        Confidence::Medium => Confidence::High,
        Confidence::High | Confidence::Certain => Confidence::Certain,
    }
}

/// Cheap consistency filter: both states must parse, the source must not
/// be terminal, and the guarded states only reach their allowed targets.
fn plausible_transition(from: &str, to: &str) -> bool {
    let parse = |s: &str| serde_json::from_value::<JobState>(serde_json::json!(s)).ok();
    let (Some(from), Some(to)) = (parse(from), parse(to)) else {
        return false;
    };

    if from.is_terminal() {
        return false;
    }
    match from {
        JobState::Draft => matches!(
            to,
            JobState::Pending | JobState::Suspended | JobState::Canceled
        ),
        JobState::Suspended => matches!(to, JobState::Pending | JobState::Canceled),
        _ => true,
    }
}
