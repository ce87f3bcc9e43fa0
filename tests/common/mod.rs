//! Shared test utilities: a temp git repo with a jobs directory inside it,
//! and a scripted executor that stands in for the real CLI.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use steward::domain::{ExecutorReply, JobState, Phase, ReplyAction, StepMetrics};
use steward::executor::{
    Classifier, ExecutorError, ExecutorRunner, StepOutput, StepRequest,
};
use steward::settings::Settings;
use steward::store::{DirectoryManager, load_manifest, save_manifest};
use steward::Engine;

/// Run git in a directory, asserting success.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed:\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A main repo with one commit on `main`, plus an initialized jobs
/// directory inside it.
pub struct Fixture {
    pub tmp: TempDir,
    pub repo: PathBuf,
    pub jobs_dir: PathBuf,
}

pub fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let repo = tmp.path().join("repo");
    fs::create_dir_all(&repo).unwrap();

    git(&repo, &["init"]);
    git(&repo, &["config", "user.email", "test@test.com"]);
    git(&repo, &["config", "user.name", "Test User"]);
    fs::write(repo.join("README.md"), "hello\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "Initial commit"]);
    git(&repo, &["branch", "-m", "main"]);

    let jobs_dir = repo.join("jobs");
    let directory = DirectoryManager::new(&jobs_dir);
    directory.ensure_base_structure().unwrap();
    steward::roles::write_default_roles(&jobs_dir).unwrap();

    Fixture {
        tmp,
        repo,
        jobs_dir,
    }
}

impl Fixture {
    /// Create a DRAFT job with the given phases and return its directory.
    pub fn create_job(&self, job_id: &str, phases: &[&str]) -> PathBuf {
        let directory = DirectoryManager::new(&self.jobs_dir);
        directory.create_job(Path::new(job_id), false).unwrap();
        let job_dir = directory.job_dir(job_id).unwrap();

        let mut manifest = load_manifest(&job_dir).unwrap();
        manifest.phases = phases.iter().map(|p| Phase::new(*p)).collect();
        save_manifest(&job_dir, &manifest).unwrap();

        job_dir
    }

    /// Create, configure, and activate a job ready to run.
    pub fn create_active_job(&self, engine: &Engine, job_id: &str, phases: &[&str]) -> PathBuf {
        let job_dir = self.create_job(job_id, phases);
        engine.activate(job_id, None).unwrap();
        assert_eq!(
            load_manifest(&job_dir).unwrap().status,
            JobState::Pending
        );
        job_dir
    }

    pub fn engine(&self, executor: Arc<ScriptedExecutor>) -> Engine {
        Engine::with_executor(&self.jobs_dir, Settings::default(), executor)
            .with_error_logger(steward::errlog::ErrorLogger::with_root(
                &self.tmp.path().join("app-home"),
            ))
    }
}

/// One scripted executor outcome.
pub enum Scripted {
    /// Write the given files into the workspace, then reply.
    Reply {
        action: ReplyAction,
        files: Vec<(String, String)>,
        evidence: Vec<String>,
        summary: String,
    },
    /// Fail like a subprocess with this exit code and output.
    Fail {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

impl Scripted {
    pub fn completed(file: &str, content: &str, summary: &str) -> Self {
        Scripted::Reply {
            action: ReplyAction::Completed,
            files: vec![(file.to_string(), content.to_string())],
            evidence: vec![file.to_string()],
            summary: summary.to_string(),
        }
    }

    pub fn completed_with_evidence(evidence: &[&str], summary: &str) -> Self {
        Scripted::Reply {
            action: ReplyAction::Completed,
            files: Vec::new(),
            evidence: evidence.iter().map(|s| s.to_string()).collect(),
            summary: summary.to_string(),
        }
    }

    pub fn stuck(summary: &str) -> Self {
        Scripted::Reply {
            action: ReplyAction::Stuck,
            files: Vec::new(),
            evidence: Vec::new(),
            summary: summary.to_string(),
        }
    }

    pub fn exit(exit_code: i32, stderr: &str) -> Self {
        Scripted::Fail {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Deterministic stand-in for the executor CLI: pops scripted outcomes in
/// order and materializes evidence files in the workspace.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
    invocations: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutorRunner for ScriptedExecutor {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepOutput, ExecutorError> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted executor ran out of outcomes");

        match outcome {
            Scripted::Fail {
                exit_code,
                stdout,
                stderr,
            } => {
                let classification =
                    Classifier::default().classify_exit(Some(exit_code), &stdout, &stderr);
                Err(ExecutorError::Failed {
                    classification,
                    stdout,
                    stderr,
                })
            }
            Scripted::Reply {
                action,
                files,
                evidence,
                summary,
            } => {
                for (path, content) in files {
                    let full = request.workspace.join(&path);
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent).unwrap();
                    }
                    fs::write(full, content).unwrap();
                }

                let reply = ExecutorReply {
                    action,
                    evidence_files: evidence,
                    summary_for_supervisor: summary,
                    job_manifest_url: None,
                };

                Ok(StepOutput {
                    reply,
                    metrics: StepMetrics {
                        cost_usd: 0.25,
                        duration_seconds: 2.0,
                        token_input: 1000,
                        token_output: 400,
                        ..Default::default()
                    },
                    task_id: format!("task-{n}"),
                    raw_output: format!("Task created: task-{n}\n"),
                })
            }
        }
    }
}
