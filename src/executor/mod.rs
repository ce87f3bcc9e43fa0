//! Executor adapter: invoking the external LLM CLI and harvesting its
//! structured reply.
//!
//! The executor is called in argv form only (never a shell string), with a
//! one-shot flag, `--file <prompt>`, and one `--file` per attachment. Its
//! reply and metrics are read back from the task directory it persists
//! out-of-band.

mod classify;
mod harvest;

pub use classify::{
    Category, Classification, Classifier, Rule, Severity, Template, retry_delay, should_retry,
};
pub use harvest::{harvest_task, parse_task_id};

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::domain::{ExecutorReply, ReplyError, StepMetrics};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn executor: {0}")]
    Spawn(String),

    #[error("executor run timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("executor run failed: {}", .classification.user_message)]
    Failed {
        classification: Classification,
        stdout: String,
        stderr: String,
    },

    #[error("could not extract executor task id from output")]
    NoTaskId,

    #[error("executor task directory not found: {}", .0.display())]
    TaskDirMissing(PathBuf),

    #[error("conversation history not found: {}", .0.display())]
    ConversationMissing(PathBuf),

    #[error("no valid reply found in conversation history")]
    NoReplyInConversation,

    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How to invoke the executor binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Executor binary name or path.
    pub binary: String,

    /// Flags that put the executor into one-shot, non-interactive mode.
    pub oneshot_flags: Vec<String>,

    /// Where the executor persists task directories; defaults to
    /// `~/.<binary>/data`.
    pub data_dir: Option<PathBuf>,

    /// Per-invocation wall-clock budget.
    pub timeout_seconds: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            binary: "cline".to_string(),
            oneshot_flags: vec!["--yolo".to_string(), "--oneshot".to_string()],
            data_dir: None,
            timeout_seconds: 300,
        }
    }
}

impl ExecutorSettings {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(format!(".{}", self.binary))
                .join("data")
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// One step's worth of executor input.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub prompt_file: PathBuf,
    pub attachments: Vec<PathBuf>,
    pub workspace: PathBuf,
    pub timeout: Duration,
    /// Model the executor should use; omitted when the operator did not
    /// ask for one.
    pub model: Option<String>,
}

/// Everything a successful invocation yields.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub reply: ExecutorReply,
    pub metrics: StepMetrics,
    pub task_id: String,
    pub raw_output: String,
}

/// Drives one executor invocation end to end: spawn, wait, locate the task
/// directory, extract the reply. Implementations other than the real CLI
/// exist only for tests.
#[async_trait]
pub trait ExecutorRunner: Send + Sync {
    fn id(&self) -> &str;

    async fn run_step(&self, request: &StepRequest) -> Result<StepOutput, ExecutorError>;
}

/// The real executor: an external CLI spawned per step.
pub struct CliExecutor {
    settings: ExecutorSettings,
    classifier: Classifier,
}

impl CliExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            classifier: Classifier::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        std::process::Command::new("which")
            .arg(&self.settings.binary)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn build_args(&self, request: &StepRequest) -> Vec<String> {
        let mut args = self.settings.oneshot_flags.clone();
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--file".to_string());
        args.push(request.prompt_file.display().to_string());
        for attachment in &request.attachments {
            args.push("--file".to_string());
            args.push(attachment.display().to_string());
        }
        args
    }
}

#[async_trait]
impl ExecutorRunner for CliExecutor {
    fn id(&self) -> &str {
        &self.settings.binary
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepOutput, ExecutorError> {
        let args = self.build_args(request);
        let started = Instant::now();

        tracing::debug!(
            executor = %self.settings.binary,
            workspace = %request.workspace.display(),
            "spawning executor"
        );

        let mut child = tokio::process::Command::new(&self.settings.binary)
            .args(&args)
            .current_dir(&request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.settings.binary)))?;

        let output = match tokio::time::timeout(request.timeout, async {
            let stdout = child.stdout.take().expect("stdout captured");
            let stderr = child.stderr.take().expect("stderr captured");

            let (stdout, stderr) = tokio::join!(
                read_to_string(stdout),
                read_to_string(stderr)
            );
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout?, stderr?))
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(ExecutorError::Timeout {
                    seconds: request.timeout.as_secs(),
                });
            }
        };

        let (status, stdout, stderr) = output;
        let elapsed = started.elapsed().as_secs_f64();

        if !status.success() {
            let classification = self.classifier.classify_exit(status.code(), &stdout, &stderr);
            return Err(ExecutorError::Failed {
                classification,
                stdout,
                stderr,
            });
        }

        let combined = format!("{stdout}{stderr}");
        let task_id = parse_task_id(&combined).ok_or(ExecutorError::NoTaskId)?;

        let (reply, metrics) =
            harvest_task(&self.settings.resolved_data_dir(), &task_id, elapsed)?;

        Ok(StepOutput {
            reply,
            metrics,
            task_id,
            raw_output: combined,
        })
    }
}

async fn read_to_string<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    reader.read_to_string(&mut buf).await?;
    Ok(buf)
}
