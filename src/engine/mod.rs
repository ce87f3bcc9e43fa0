//! The execution orchestrator: one `step` drives one executor invocation
//! from prompt assembly through manifest commit; `run` loops steps until a
//! blocking or terminal state.

pub mod budget;
pub mod context;
pub mod export;

pub use budget::{BudgetError, MetricsSnapshot, Projection, StatusColor};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{
    ExecutorReply, HistoryEntry, JobState, LatestOutcome, Manifest, ManifestError, Phase,
    ReplyAction, RerunInfo, Role, StateError, StepAction, StepMetrics, events, transition,
    transition_on_error,
};
use crate::errlog::ErrorLogger;
use crate::executor::{
    Classification, Classifier, CliExecutor, ExecutorError, ExecutorRunner, Severity, StepRequest,
    retry_delay, should_retry,
};
use crate::recovery;
use crate::roles;
use crate::settings::Settings;
use crate::store::{
    DirectoryManager, LockError, LockManager, ManifestStore, ManifestUpdate, StoreError,
    write_json_atomic,
};
use crate::workspace::{CommitOutcome, WorkspaceManager, find_git_root};

const JOB_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_LOOP_DELAY: Duration = Duration::from_millis(500);
const RAW_OUTPUT_EXCERPT: usize = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("job is in state {status}: {hint}")]
    NotSteppable { status: JobState, hint: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// A classified execution failure; the classification has already been
    /// recorded in history and the structured error log.
    #[error("[{}] {}", .classification.correlation_id, .classification.user_message)]
    Classified {
        classification: Classification,
        message: String,
        raw_excerpt: Option<String>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// User-facing errors exit 1; everything else is internal (exit 2).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EngineError::JobNotFound(_)
                | EngineError::NotSteppable { .. }
                | EngineError::Manifest(_)
                | EngineError::Budget(_)
                | EngineError::Classified { .. }
        )
    }
}

/// What one step accomplished.
#[derive(Debug)]
pub struct StepReport {
    pub job_id: String,
    pub phase: String,
    pub role: Role,
    pub action: ReplyAction,
    pub summary: String,
    pub new_status: JobState,
    pub validated_evidence: Vec<String>,
    pub evidence_warnings: Vec<String>,
    pub commit_hash: Option<String>,
    pub metrics: StepMetrics,
    pub executor_task_id: Option<String>,
    pub recovered_before_step: bool,
}

/// Outcome of a `run` loop.
#[derive(Debug)]
pub struct RunReport {
    pub job_id: String,
    pub steps_executed: usize,
    pub final_status: JobState,
}

/// What poststep did (or would do, for dry runs).
#[derive(Debug)]
pub struct PoststepReport {
    pub job_id: String,
    pub dry_run: bool,
    pub role: Role,
    pub action: ReplyAction,
    pub would_transition_to: JobState,
    pub validated_evidence: Vec<String>,
    pub evidence_warnings: Vec<String>,
    pub applied: bool,
}

/// Rendered prompt preview.
#[derive(Debug)]
pub struct PreviewReport {
    pub job_id: String,
    pub phase: String,
    pub role: Role,
    pub prompt: String,
    pub attachments: Vec<PathBuf>,
}

/// The orchestration engine for one jobs directory.
pub struct Engine {
    jobs_dir: PathBuf,
    settings: Settings,
    store: ManifestStore,
    directory: DirectoryManager,
    locks: LockManager,
    executor: Arc<dyn ExecutorRunner>,
    classifier: Classifier,
    errlog: ErrorLogger,
}

impl Engine {
    pub fn new(jobs_dir: impl Into<PathBuf>, settings: Settings) -> Self {
        let executor: Arc<dyn ExecutorRunner> =
            Arc::new(CliExecutor::new(settings.executor.clone()));
        Self::with_executor(jobs_dir, settings, executor)
    }

    /// Substitute the executor; tests drive the engine with a scripted one.
    pub fn with_executor(
        jobs_dir: impl Into<PathBuf>,
        settings: Settings,
        executor: Arc<dyn ExecutorRunner>,
    ) -> Self {
        let jobs_dir = jobs_dir.into();
        Self {
            store: ManifestStore::new(&jobs_dir).with_cleanup_policy(settings.cleanup.clone()),
            directory: DirectoryManager::new(&jobs_dir),
            locks: LockManager::new(&jobs_dir),
            executor,
            classifier: Classifier::default(),
            errlog: ErrorLogger::default(),
            settings,
            jobs_dir,
        }
    }

    pub fn with_error_logger(mut self, errlog: ErrorLogger) -> Self {
        self.errlog = errlog;
        self
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn directory(&self) -> &DirectoryManager {
        &self.directory
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf, EngineError> {
        self.directory
            .job_dir(job_id)
            .map_err(|_| EngineError::JobNotFound(job_id.to_string()))
    }

    fn main_repo(&self) -> Option<PathBuf> {
        find_git_root(&self.jobs_dir)
            .or_else(|| std::env::current_dir().ok().and_then(|cwd| find_git_root(&cwd)))
    }

    fn commit_author(&self) -> (&str, &str) {
        (
            &self.settings.git.author_name,
            &self.settings.git.author_email,
        )
    }

    /// Reject steps from states that cannot take one, with a next-step
    /// hint for the operator.
    fn guard_steppable(&self, manifest: &Manifest) -> Result<(), EngineError> {
        let status = manifest.status;
        let hint = match status {
            JobState::Pending | JobState::ReviewRequired | JobState::Reviewing => return Ok(()),
            s if s.is_terminal() => "job is finished; use 'job rerun' for a fresh run",
            JobState::Suspended => "resume the job first with 'job resume'",
            JobState::Draft => "configure and activate the job first with 'job activate'",
            JobState::ApprovalRequired => "use 'job approve' or 'job reject'",
            JobState::InterventionRequired => "repair the issue, then 'job resubmit'",
            _ => "another process is executing this job",
        };
        Err(EngineError::NotSteppable {
            status,
            hint: hint.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // step
    // ------------------------------------------------------------------

    /// Execute one phase: recover, guard, provision, invoke, harvest,
    /// validate, transition, commit. The model hint, when given, is passed
    /// to the executor and recorded in the step's history entry.
    pub async fn step(&self, job_id: &str, model: Option<&str>) -> Result<StepReport, EngineError> {
        let job_dir = self.job_dir(job_id)?;

        // 1. Recover first.
        let persistence = recovery::validate_state_persistence(&self.store, &job_dir);
        if !persistence.valid {
            return Err(EngineError::Other(anyhow::anyhow!(
                "state validation failed: {}",
                persistence.errors.join("; ")
            )));
        }
        let recovered_before_step = persistence.recovered;

        // 2. Load & guard, then budget gate before any executor spend.
        let manifest = self.store.load(&job_dir)?;
        self.guard_steppable(&manifest)?;
        budget::check_thresholds(&manifest)?;

        // 4. Serialize on the job lock, then re-check: a concurrent run
        // may have taken this step while we waited.
        let _guard = self.locks.lock_job(job_id, JOB_LOCK_TIMEOUT)?;
        let manifest = self.store.load(&job_dir)?;
        self.guard_steppable(&manifest)?;

        // 3. Resolve phase & role.
        let (phase_name, role) = manifest.current_phase_and_role()?;
        let entry_status = manifest.status;

        let ws = WorkspaceManager::new(&job_dir);

        // Provision workspace and record the transient states.
        if role == Role::Worker {
            let provisioning = transition(entry_status, Role::System, StepAction::StepStart)?;
            self.store
                .update(&job_dir, ManifestUpdate::status(provisioning))?;

            if let Err(e) = self.ensure_workspace(&ws, job_id) {
                let failed =
                    transition(provisioning, Role::System, StepAction::ProvisionFail)?;
                let entry = HistoryEntry::lifecycle(
                    events::EXECUTION_ERROR,
                    format!("Workspace provisioning failed: {e}"),
                );
                self.store
                    .update(&job_dir, ManifestUpdate::status(failed).with_history(entry))?;
                return Err(EngineError::Other(e));
            }

            let _ = ws.copy_attachments();
            self.stage_previous_outcome(&job_dir, &ws);

            let executing = transition(provisioning, Role::System, StepAction::ProvisionOk)?;
            self.store
                .update(&job_dir, ManifestUpdate::status(executing))?;
        } else {
            if let Err(e) = self.ensure_workspace(&ws, job_id) {
                return Err(EngineError::Other(e));
            }
            let _ = ws.copy_attachments();
            self.stage_previous_outcome(&job_dir, &ws);

            self.store
                .update(&job_dir, ManifestUpdate::status(JobState::Reviewing))?;
        }

        // 5. Assemble the prompt and write it into the workspace.
        let manifest = self.store.load(&job_dir)?;
        let ctx = context::assemble(&job_dir, &manifest, &self.jobs_dir, &phase_name, role, true)?;
        let prompt = context::render(&ctx);

        let tmp_dir = ws.workspace_dir().join("tmp");
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("failed to create tmp dir: {e}")))?;
        let prompt_file = tmp_dir.join(format!("prompt-{job_id}.md"));
        std::fs::write(&prompt_file, &prompt)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("failed to write prompt: {e}")))?;

        let attachments = self.collect_attachments(&ws, &prompt);

        // 6-7. Invoke the executor and harvest its reply.
        let request = StepRequest {
            prompt_file,
            attachments,
            workspace: ws.workspace_dir(),
            timeout: self.settings.executor.timeout(),
            model: model.map(str::to_string),
        };

        match self.executor.run_step(&request).await {
            Ok(output) => {
                // 8-13 share the poststep tail.
                self.finish_step(FinishStep {
                    job_dir: &job_dir,
                    ws: &ws,
                    phase: &phase_name,
                    role,
                    reply: &output.reply,
                    metrics: output.metrics,
                    task_id: Some(output.task_id),
                    model: model.map(str::to_string),
                    recovered_before_step,
                })
            }
            Err(error) => Err(self.handle_execution_error(&job_dir, job_id, role, entry_status, &error)),
        }
    }

    fn ensure_workspace(&self, ws: &WorkspaceManager, job_id: &str) -> anyhow::Result<()> {
        if ws.verify() {
            return Ok(());
        }
        let main_repo = self
            .main_repo()
            .ok_or_else(|| anyhow::anyhow!("not inside a git repository"))?;
        ws.provision(job_id, &self.settings.git.base_branch, &main_repo)?;
        Ok(())
    }

    /// Make the previous step's outcome available to the next prompt as an
    /// attachment.
    fn stage_previous_outcome(&self, job_dir: &Path, ws: &WorkspaceManager) {
        let outcome = job_dir.join("latest-outcome.json");
        if !outcome.exists() {
            return;
        }
        let dest_dir = ws.workspace_dir().join("attachments");
        if std::fs::create_dir_all(&dest_dir).is_ok() {
            let _ = std::fs::copy(&outcome, dest_dir.join("latest-outcome.json"));
        }
    }

    /// Discovered workspace files + collected attachments + the system
    /// role file, deduplicated.
    fn collect_attachments(&self, ws: &WorkspaceManager, prompt: &str) -> Vec<PathBuf> {
        let mut attachments = ws.discover_file_arguments(prompt);

        let attachments_dir = ws.workspace_dir().join("attachments");
        if let Ok(entries) = std::fs::read_dir(&attachments_dir) {
            attachments.extend(entries.flatten().map(|e| e.path()).filter(|p| p.is_file()));
        }

        if let Some(system) = roles::system_role_file(&self.jobs_dir) {
            attachments.push(system);
        }

        attachments.sort();
        attachments.dedup();
        attachments
    }

    fn handle_execution_error(
        &self,
        job_dir: &Path,
        job_id: &str,
        role: Role,
        entry_status: JobState,
        error: &ExecutorError,
    ) -> EngineError {
        let classification = self.classifier.classify_executor_error(error);

        let raw_excerpt = match error {
            ExecutorError::Failed { stdout, stderr, .. } => {
                let combined = format!("{stdout}{stderr}");
                let excerpt: String = combined.chars().take(RAW_OUTPUT_EXCERPT).collect();
                (!excerpt.is_empty()).then_some(excerpt)
            }
            _ => None,
        };

        self.errlog.log_error(
            &classification,
            job_id,
            job_dir,
            &error.to_string(),
            serde_json::json!({
                "operation": format!("job '{job_id}' execution"),
                "role": role.to_string(),
            }),
        );

        // Transient failures restore the status the step entered with so
        // the caller can simply step again; the rest follow the severity
        // mapping.
        let current = self.store.load(job_dir).map(|m| m.status).unwrap_or(entry_status);
        let new_status = match transition_on_error(current, &classification) {
            Some(status) => Some(status),
            None if current.is_executing() => Some(entry_status),
            None => None,
        };

        let entry = HistoryEntry::lifecycle(
            events::EXECUTION_ERROR,
            format!("Execution failed: {}", classification.description),
        )
        .with_detail(
            "error_classification",
            serde_json::to_value(&classification).unwrap_or_default(),
        )
        .with_detail("error_message", serde_json::json!(error.to_string()))
        .with_detail("can_retry", serde_json::json!(classification.can_retry))
        .with_detail("max_retries", serde_json::json!(classification.max_retries))
        .with_detail(
            "intervention_required",
            serde_json::json!(classification.intervention_required),
        );

        let update = ManifestUpdate {
            new_status,
            history_entry: Some(entry),
            ..Default::default()
        };
        if let Err(e) = self.store.update(job_dir, update) {
            tracing::error!(job_id, "failed to record execution error: {e}");
        }

        EngineError::Classified {
            classification,
            message: error.to_string(),
            raw_excerpt,
        }
    }

    fn finish_step(&self, args: FinishStep<'_>) -> Result<StepReport, EngineError> {
        let FinishStep {
            job_dir,
            ws,
            phase,
            role,
            reply,
            metrics,
            task_id,
            model,
            recovered_before_step,
        } = args;

        // 9. Persist the slim outcome.
        let outcome = LatestOutcome::from_reply(reply, metrics.clone(), task_id.clone());
        if let Err(e) = write_json_atomic(&job_dir.join("latest-outcome.json"), &outcome) {
            tracing::warn!("failed to save latest outcome: {e}");
        }

        // 10. Validate evidence: warn-and-continue, never a failure.
        let mut validated_evidence = Vec::new();
        let mut evidence_warnings = Vec::new();
        for evidence in &reply.evidence_files {
            match ws.validate_evidence_file(evidence) {
                Ok(relative) => validated_evidence.push(relative),
                Err(e) => evidence_warnings.push(e.to_string()),
            }
        }

        // 11. Compute the next state and append the step to history.
        let manifest = self.store.load(job_dir)?;
        let action = StepAction::from(reply.action);
        let new_status = match role {
            Role::Worker | Role::System | Role::Human => {
                let harvesting =
                    transition(manifest.status, Role::System, StepAction::ExecuteOk)?;
                self.store
                    .update(job_dir, ManifestUpdate::status(harvesting))?;
                transition(harvesting, Role::Worker, action)?
            }
            Role::Supervisor => transition(manifest.status, Role::Supervisor, action)?,
        };

        let mut entry = HistoryEntry::step(
            if role == Role::Supervisor {
                Role::Supervisor
            } else {
                Role::Worker
            },
            reply.action.to_string(),
            Some(reply.summary_for_supervisor.clone()),
            metrics.clone(),
            task_id.clone(),
            reply.evidence_files.clone(),
            new_status,
        )
        .with_model(model.clone());
        if !evidence_warnings.is_empty() {
            entry.extra.insert(
                "evidence_warnings".to_string(),
                serde_json::json!(evidence_warnings),
            );
        }

        let update = ManifestUpdate {
            new_status: Some(new_status),
            cost_delta: metrics.cost_usd,
            time_delta: metrics.duration_seconds,
            history_entry: Some(entry),
            ..Default::default()
        };
        let manifest = self.store.update(job_dir, update)?;

        // Secondary interaction log, best-effort.
        self.store.record_interaction(
            job_dir,
            serde_json::json!({
                "timestamp": Utc::now().to_rfc3339(),
                "model": model,
                "request": {"operation": "step", "job_id": manifest.job_id, "phase": phase, "role": role.to_string()},
                "response": {
                    "action": reply.action.to_string(),
                    "summary_for_supervisor": reply.summary_for_supervisor,
                    "evidence_files": reply.evidence_files,
                    "metrics": metrics,
                },
                "executor_task_id": task_id,
            }),
        );

        // 12. Commit evidence; failure is reported, never fatal, and the
        // next step retries it.
        let commit_hash = match ws.commit(
            &reply.evidence_files,
            &reply.summary_for_supervisor,
            Some(self.commit_author()),
        ) {
            Ok(CommitOutcome::Committed { commit_hash, .. }) => Some(commit_hash),
            Ok(CommitOutcome::NoChanges) => None,
            Err(e) => {
                tracing::warn!(job_id = %manifest.job_id, "git commit failed: {e}");
                None
            }
        };

        Ok(StepReport {
            job_id: manifest.job_id.clone(),
            phase: phase.to_string(),
            role,
            action: reply.action,
            summary: reply.summary_for_supervisor.clone(),
            new_status,
            validated_evidence,
            evidence_warnings,
            commit_hash,
            metrics,
            executor_task_id: task_id,
            recovered_before_step,
        })
    }

    // ------------------------------------------------------------------
    // run
    // ------------------------------------------------------------------

    /// Step with the caller-side retry loop for transient failures.
    pub async fn step_with_retries(
        &self,
        job_id: &str,
        model: Option<&str>,
    ) -> Result<StepReport, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.step(job_id, model).await {
                Err(EngineError::Classified {
                    classification,
                    message,
                    raw_excerpt: _,
                }) if classification.severity == Severity::Transient
                    && should_retry(&classification, attempt) =>
                {
                    let delay = retry_delay(&classification, attempt);
                    self.errlog.log_retry(
                        &classification.correlation_id,
                        attempt,
                        delay.as_secs_f64(),
                    );
                    tracing::info!(
                        job_id,
                        attempt,
                        delay_s = delay.as_secs_f64(),
                        "transient failure, retrying: {message}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Loop `step` until the job reaches a blocking or terminal state.
    /// Without an id, the queue head is taken; the dequeue-to-run race is
    /// resolved on the per-job lock, and the loser exits cleanly.
    pub async fn run(
        &self,
        job_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<RunReport, EngineError> {
        let job_id = match job_id {
            Some(id) => id.to_string(),
            None => {
                let index = self.store.index().read();
                index
                    .queue
                    .first()
                    .cloned()
                    .ok_or_else(|| EngineError::JobNotFound("(queue is empty)".to_string()))?
            }
        };

        let job_dir = self.job_dir(&job_id)?;
        let mut steps_executed = 0usize;

        loop {
            let manifest = self.store.load(&job_dir)?;
            if manifest.status.is_blocking() {
                return Ok(RunReport {
                    job_id,
                    steps_executed,
                    final_status: manifest.status,
                });
            }

            match self.step_with_retries(&job_id, model).await {
                Ok(report) => {
                    steps_executed += 1;
                    if report.new_status.is_blocking() {
                        return Ok(RunReport {
                            job_id,
                            steps_executed,
                            final_status: report.new_status,
                        });
                    }
                }
                // Someone else ran the job out from under us; that is a
                // clean exit, not a failure.
                Err(EngineError::NotSteppable { status, .. }) => {
                    return Ok(RunReport {
                        job_id,
                        steps_executed,
                        final_status: status,
                    });
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(RUN_LOOP_DELAY).await;
        }
    }

    // ------------------------------------------------------------------
    // restep / rerun
    // ------------------------------------------------------------------

    /// Rewind the current run to phase `step_number`. History and metrics
    /// are preserved; only the position (and a RESTEP marker) change.
    pub fn restep(
        &self,
        job_id: &str,
        step_number: usize,
        dry_run: bool,
    ) -> Result<String, EngineError> {
        let job_dir = self.job_dir(job_id)?;
        let manifest = self.store.load(&job_dir)?;

        let target = manifest.phase_at(step_number)?.name.clone();

        if dry_run {
            return Ok(target);
        }

        let entry = HistoryEntry::lifecycle(
            events::RESTEP,
            format!("Restepped to checkpoint step {step_number} ('{target}')"),
        )
        .with_detail(
            "previous_phase",
            serde_json::json!(manifest.current_phase),
        )
        .with_detail(
            "previous_status",
            serde_json::json!(manifest.status.to_string()),
        )
        .with_detail("target_step", serde_json::json!(step_number))
        .with_detail(
            "metrics_before_restep",
            serde_json::to_value(&manifest.metrics).unwrap_or_default(),
        );

        let update = ManifestUpdate {
            new_phase: Some(target.clone()),
            history_entry: Some(entry),
            ..Default::default()
        };
        self.store.update(&job_dir, update)?;

        Ok(target)
    }

    /// Begin a fresh run: status PENDING, phase `from` (0 by default),
    /// run-scoped metrics zeroed, history cleared, rerun marker recorded.
    /// The workspace is retained and the job branch is not recreated.
    pub fn rerun(&self, job_id: &str, from: Option<usize>) -> Result<String, EngineError> {
        let job_dir = self.job_dir(job_id)?;
        let mut manifest = self.store.load(&job_dir)?;

        if manifest.phases.is_empty() {
            manifest.phases = vec![Phase::new("default")];
        }
        let start = from.unwrap_or(0);
        let start_phase = manifest.phase_at(start)?.name.clone();

        if let Err(e) = recovery::create_backup(&job_dir) {
            tracing::warn!("failed to create backup before rerun: {e}");
        }

        manifest.status = JobState::Pending;
        manifest.current_phase = Some(start_phase.clone());
        manifest.metrics.cumulative_cost = 0.0;
        manifest.metrics.cumulative_time_seconds = 0.0;
        manifest.metrics.step_count = 0;
        manifest.history.clear();

        let mut entry = HistoryEntry::lifecycle(
            events::RERUN,
            format!("Fresh run started from phase '{start_phase}'"),
        );
        entry.timestamp = Some(Utc::now());
        manifest.history.push(entry);

        manifest.rerun_info = Some(RerunInfo {
            is_rerun: true,
            start_phase: start_phase.clone(),
            started_at: None,
        });
        manifest.updated_at = Utc::now();

        crate::store::save_manifest(&job_dir, &manifest)?;

        Ok(start_phase)
    }

    // ------------------------------------------------------------------
    // poststep
    // ------------------------------------------------------------------

    /// Apply an externally-authored reply: validation, persistence,
    /// evidence, transition, and commit, with no executor invocation and
    /// no cost/time increments.
    pub fn poststep(
        &self,
        job_id: &str,
        reply: &ExecutorReply,
        role_override: Option<Role>,
        dry_run: bool,
    ) -> Result<PoststepReport, EngineError> {
        reply
            .validate()
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;

        let job_dir = self.job_dir(job_id)?;
        let manifest = self.store.load(&job_dir)?;

        let role = match role_override {
            Some(role) => role,
            None => manifest.current_phase_and_role()?.1,
        };
        let phase = manifest.current_phase.clone().unwrap_or_default();

        // Map the resting status onto the state the reply conceptually
        // arrives in: a worker reply harvests, a supervisor reply reviews.
        let conceptual = match role {
            Role::Supervisor if manifest.status.is_review() => JobState::Reviewing,
            Role::Supervisor => manifest.status,
            _ if manifest.status == JobState::Pending => JobState::Harvesting,
            _ => manifest.status,
        };
        let action = StepAction::from(reply.action);
        let would_transition_to = transition(
            conceptual,
            if role == Role::Supervisor {
                Role::Supervisor
            } else {
                Role::Worker
            },
            action,
        )?;

        let ws = WorkspaceManager::new(&job_dir);
        let mut validated_evidence = Vec::new();
        let mut evidence_warnings = Vec::new();
        for evidence in &reply.evidence_files {
            match ws.validate_evidence_file(evidence) {
                Ok(relative) => validated_evidence.push(relative),
                Err(e) => evidence_warnings.push(e.to_string()),
            }
        }

        if dry_run {
            return Ok(PoststepReport {
                job_id: job_id.to_string(),
                dry_run: true,
                role,
                action: reply.action,
                would_transition_to,
                validated_evidence,
                evidence_warnings,
                applied: false,
            });
        }

        let _guard = self.locks.lock_job(job_id, JOB_LOCK_TIMEOUT)?;

        let outcome = LatestOutcome::from_reply(reply, StepMetrics::default(), None);
        if let Err(e) = write_json_atomic(&job_dir.join("latest-outcome.json"), &outcome) {
            tracing::warn!("failed to save latest outcome: {e}");
        }

        let mut entry = HistoryEntry::step(
            if role == Role::Supervisor {
                Role::Supervisor
            } else {
                Role::Worker
            },
            reply.action.to_string(),
            Some(reply.summary_for_supervisor.clone()),
            StepMetrics::default(),
            None,
            reply.evidence_files.clone(),
            would_transition_to,
        );
        entry.event = Some(events::POSTSTEP.to_string());
        if !evidence_warnings.is_empty() {
            entry.extra.insert(
                "evidence_warnings".to_string(),
                serde_json::json!(evidence_warnings),
            );
        }

        self.store.update(
            &job_dir,
            ManifestUpdate {
                new_status: Some(would_transition_to),
                history_entry: Some(entry),
                ..Default::default()
            },
        )?;

        if ws.verify() {
            if let Err(e) = ws.commit(
                &reply.evidence_files,
                &reply.summary_for_supervisor,
                Some(self.commit_author()),
            ) {
                tracing::warn!("poststep commit failed: {e}");
            }
        }

        Ok(PoststepReport {
            job_id: job_id.to_string(),
            dry_run: false,
            role,
            action: reply.action,
            would_transition_to,
            validated_evidence,
            evidence_warnings,
            applied: true,
        })
    }

    // ------------------------------------------------------------------
    // preview / lifecycle
    // ------------------------------------------------------------------

    /// Dry-assemble the next prompt without executing anything.
    pub fn preview(&self, job_id: &str) -> Result<PreviewReport, EngineError> {
        let job_dir = self.job_dir(job_id)?;
        let manifest = self.store.load(&job_dir)?;
        let (phase, role) = manifest.current_phase_and_role()?;

        let ctx = context::assemble(&job_dir, &manifest, &self.jobs_dir, &phase, role, true)?;
        let prompt = context::render(&ctx);

        let ws = WorkspaceManager::new(&job_dir);
        let attachments = self.collect_attachments(&ws, &prompt);

        Ok(PreviewReport {
            job_id: job_id.to_string(),
            phase,
            role,
            prompt,
            attachments,
        })
    }

    /// Activate a DRAFT job: transition to PENDING, default the phases
    /// when none are configured, enqueue at `rank`, and generate
    /// `prompt.md` from the config.
    pub fn activate(&self, job_id: &str, rank: Option<usize>) -> Result<usize, EngineError> {
        let job_dir = self.job_dir(job_id)?;
        let mut manifest = self.store.load(&job_dir)?;

        let new_status = transition(manifest.status, Role::System, StepAction::Activated)?;

        if let Err(e) = recovery::create_backup(&job_dir) {
            tracing::warn!("failed to create backup before activate: {e}");
        }

        if manifest.phases.is_empty() {
            let mut phase = Phase::new("default");
            phase.description = Some("Default single phase".to_string());
            manifest.phases = vec![phase];
        }
        if manifest.current_phase.is_none() {
            manifest.current_phase = Some(manifest.phases[0].name.clone());
        }
        manifest.status = new_status;
        manifest.updated_at = Utc::now();
        crate::store::save_manifest(&job_dir, &manifest)?;

        let position = self
            .store
            .index()
            .with_lock(JOB_LOCK_TIMEOUT, |index| {
                index.enqueue(job_id, rank);
                index.queue_position(job_id).unwrap_or(0)
            })?;

        self.write_prompt_file(&job_dir, &manifest);

        Ok(position)
    }

    fn write_prompt_file(&self, job_dir: &Path, manifest: &Manifest) {
        let config = &manifest.config;
        let mut sections = Vec::new();
        if let Some(prompt) = &config.prompt {
            sections.push(prompt.clone());
        }
        for (tag, value) in [
            ("objective", &config.objective),
            ("details", &config.details),
            ("acceptance", &config.acceptance),
        ] {
            if let Some(value) = value {
                sections.push(format!("<{tag}>\n{value}\n</{tag}>"));
            }
        }
        if sections.is_empty() {
            return;
        }
        if let Err(e) = std::fs::write(job_dir.join("prompt.md"), sections.join("\n\n")) {
            tracing::warn!("failed to write prompt.md: {e}");
        }
    }

    /// Human / system lifecycle transitions: approve, reject, resubmit,
    /// suspend, resume, terminate.
    pub fn apply_lifecycle_action(
        &self,
        job_id: &str,
        role: Role,
        action: StepAction,
    ) -> Result<Manifest, EngineError> {
        let job_dir = self.job_dir(job_id)?;
        let _guard = self.locks.lock_job(job_id, JOB_LOCK_TIMEOUT)?;

        let manifest = self.store.load(&job_dir)?;
        let new_status = transition(manifest.status, role, action)?;

        let entry = HistoryEntry::lifecycle(
            match action {
                StepAction::Approve => "APPROVED",
                StepAction::Reject => "REJECTED",
                StepAction::Resubmit => "RESUBMITTED",
                StepAction::Suspend => "SUSPENDED",
                StepAction::Resume => "RESUMED",
                StepAction::Terminate => "TERMINATED",
                _ => "LIFECYCLE",
            },
            format!("{} by {role}: {} -> {new_status}", action, manifest.status),
        );

        let manifest = self.store.update(
            &job_dir,
            ManifestUpdate::status(new_status).with_history(entry),
        )?;

        Ok(manifest)
    }
}

struct FinishStep<'a> {
    job_dir: &'a Path,
    ws: &'a WorkspaceManager,
    phase: &'a str,
    role: Role,
    reply: &'a ExecutorReply,
    metrics: StepMetrics,
    task_id: Option<String>,
    model: Option<String>,
    recovered_before_step: bool,
}
