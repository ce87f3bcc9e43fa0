//! End-to-end orchestrator scenarios with a scripted executor.

mod common;

use common::{Scripted, ScriptedExecutor, fixture};
use steward::domain::{JobState, ReplyAction, Role, events};
use steward::engine::EngineError;
use steward::store::load_manifest;
use steward::workspace::WorkspaceManager;

fn step_entries(manifest: &steward::domain::Manifest) -> usize {
    manifest
        .history
        .iter()
        .filter(|e| e.is_executor_step())
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_worker_then_supervisor() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![
        Scripted::completed("out.txt", "worker output\n", "implemented the plan"),
        Scripted::completed("review.txt", "review notes\n", "looks good"),
    ]);
    let engine = fx.engine(executor.clone());
    let job_dir = fx.create_active_job(&engine, "j1", &["plan", "impl"]);

    // Worker turn, with an explicit model hint.
    let report = engine
        .step("j1", Some("grok-code-fast-1"))
        .await
        .expect("worker step");
    assert_eq!(report.role, Role::Worker);
    assert_eq!(report.action, ReplyAction::Completed);
    assert_eq!(report.new_status, JobState::ReviewRequired);
    assert_eq!(report.validated_evidence, vec!["out.txt".to_string()]);
    assert!(report.commit_hash.is_some());

    // Supervisor turn.
    let report = engine.step("j1", None).await.expect("supervisor step");
    assert_eq!(report.role, Role::Supervisor);
    assert_eq!(report.new_status, JobState::ApprovalRequired);

    let manifest = load_manifest(&job_dir).unwrap();
    assert_eq!(manifest.status, JobState::ApprovalRequired);
    assert_eq!(step_entries(&manifest), 2);
    assert_eq!(manifest.metrics.step_count, 2);
    assert!((manifest.metrics.cumulative_cost - 0.5).abs() < 1e-9);

    // The worker step recorded the model it was asked to use; the
    // supervisor step carried no hint.
    let steps: Vec<_> = manifest
        .history
        .iter()
        .filter(|e| e.is_executor_step())
        .collect();
    assert_eq!(steps[0].model.as_deref(), Some("grok-code-fast-1"));
    assert!(steps[1].model.is_none());

    // Two step commits on top of the initial one.
    let ws = WorkspaceManager::new(&job_dir);
    assert_eq!(ws.commit_count().unwrap(), 3);

    // Still queued until the human approves.
    let index = engine.store().index().read();
    assert_eq!(index.queue_position("j1"), Some(0));

    engine
        .apply_lifecycle_action("j1", Role::Human, steward::domain::StepAction::Approve)
        .unwrap();

    let manifest = load_manifest(&job_dir).unwrap();
    assert_eq!(manifest.status, JobState::Success);
    assert!(engine.store().index().read().queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loops_until_blocking_state() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![
        Scripted::completed("a.txt", "a\n", "phase one done"),
        Scripted::completed("b.txt", "b\n", "reviewed"),
    ]);
    let engine = fx.engine(executor.clone());
    fx.create_active_job(&engine, "j1", &["plan"]);

    let report = engine.run(Some("j1"), None).await.expect("run");
    assert_eq!(report.steps_executed, 2);
    assert_eq!(report.final_status, JobState::ApprovalRequired);
    assert_eq!(executor.invocations(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_retry_then_succeed() {
    let fx = fixture();
    // Exit 124 is transient with two retries; the third attempt lands.
    let executor = ScriptedExecutor::new(vec![
        Scripted::exit(124, "timed out"),
        Scripted::exit(124, "timed out"),
        Scripted::completed("out.txt", "done\n", "made it"),
    ]);
    let engine = fx.engine(executor.clone());
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let report = engine.step_with_retries("j1", None).await.expect("third attempt");
    assert_eq!(report.new_status, JobState::ReviewRequired);
    assert_eq!(executor.invocations(), 3);

    let manifest = load_manifest(&job_dir).unwrap();
    let error_entries: Vec<usize> = manifest
        .history
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event.as_deref() == Some(events::EXECUTION_ERROR))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(error_entries.len(), 2);
    assert_eq!(step_entries(&manifest), 1);

    // Both errors precede the successful step entry.
    let success_index = manifest
        .history
        .iter()
        .position(|e| e.is_executor_step())
        .unwrap();
    assert!(error_entries.iter().all(|i| *i < success_index));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_configuration_error_cancels_and_dequeues() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::exit(1, "authentication failed: bad key")]);
    let engine = fx.engine(executor.clone());
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let error = engine.step("j1", None).await.expect_err("fatal");
    match &error {
        EngineError::Classified { classification, .. } => {
            assert!(!classification.can_retry);
        }
        other => panic!("expected Classified, got {other:?}"),
    }

    let manifest = load_manifest(&job_dir).unwrap();
    assert_eq!(manifest.status, JobState::Canceled);

    let errors: Vec<_> = manifest
        .history
        .iter()
        .filter(|e| e.event.as_deref() == Some(events::EXECUTION_ERROR))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].extra["error_classification"]["severity"],
        serde_json::json!("fatal")
    );
    assert_eq!(
        errors[0].extra["error_classification"]["category"],
        serde_json::json!("configuration")
    );

    // Terminal transition removed the job from the queue.
    assert!(engine.store().index().read().queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_stuck_parks_for_intervention() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::stuck("cannot find the API schema")]);
    let engine = fx.engine(executor);
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let report = engine.step("j1", None).await.expect("step");
    assert_eq!(report.action, ReplyAction::Stuck);
    assert_eq!(report.new_status, JobState::InterventionRequired);

    // Resubmit sends it back to the queue-ready state.
    engine
        .apply_lifecycle_action("j1", Role::Human, steward::domain::StepAction::Resubmit)
        .unwrap();
    assert_eq!(load_manifest(&job_dir).unwrap().status, JobState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_evidence_warns_but_does_not_fail() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed_with_evidence(
        &["ghost.txt"],
        "claimed a file that does not exist",
    )]);
    let engine = fx.engine(executor);
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let report = engine.step("j1", None).await.expect("step succeeds anyway");
    assert!(report.validated_evidence.is_empty());
    assert_eq!(report.evidence_warnings.len(), 1);
    assert!(report.evidence_warnings[0].contains("ghost.txt"));

    let manifest = load_manifest(&job_dir).unwrap();
    let step = manifest.history.iter().find(|e| e.is_executor_step()).unwrap();
    assert!(step.extra.contains_key("evidence_warnings"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn budget_gate_blocks_before_invocation() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed("x", "x", "never runs")]);
    let engine = fx.engine(executor.clone());
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let mut manifest = load_manifest(&job_dir).unwrap();
    manifest.cost_threshold = 1.0;
    manifest.metrics.cumulative_cost = 1.5;
    steward::store::save_manifest(&job_dir, &manifest).unwrap();

    let error = engine.step("j1", None).await.expect_err("threshold exceeded");
    assert!(matches!(error, EngineError::Budget(_)));

    // The executor was never spawned.
    assert_eq!(executor.invocations(), 0);
    assert_eq!(load_manifest(&job_dir).unwrap().status, JobState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn step_rejects_unsteppable_states_with_hints() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![]);
    let engine = fx.engine(executor);
    fx.create_job("j1", &["plan"]); // still DRAFT

    let error = engine.step("j1", None).await.expect_err("draft is not steppable");
    match error {
        EngineError::NotSteppable { status, hint } => {
            assert_eq!(status, JobState::Draft);
            assert!(hint.contains("activate"));
        }
        other => panic!("expected NotSteppable, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restep_is_idempotent_and_preserves_history() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed("out.txt", "x\n", "done")]);
    let engine = fx.engine(executor);
    let job_dir = fx.create_active_job(&engine, "j1", &["plan", "impl"]);

    engine.step("j1", None).await.expect("step");
    let before = load_manifest(&job_dir).unwrap();

    engine.restep("j1", 0, false).expect("first restep");
    engine.restep("j1", 0, false).expect("second restep");

    let after = load_manifest(&job_dir).unwrap();
    assert_eq!(after.current_phase.as_deref(), Some("plan"));
    // Status and metrics untouched; two RESTEP markers appended.
    assert_eq!(after.status, before.status);
    assert_eq!(
        after.metrics.cumulative_cost,
        before.metrics.cumulative_cost
    );
    let restep_entries = after
        .history
        .iter()
        .filter(|e| e.event.as_deref() == Some(events::RESTEP))
        .count();
    assert_eq!(restep_entries, 2);
    assert_eq!(after.history.len(), before.history.len() + 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restep_out_of_range_is_rejected() {
    let fx = fixture();
    let engine = fx.engine(ScriptedExecutor::new(vec![]));
    fx.create_active_job(&engine, "j1", &["plan", "impl"]);

    assert!(engine.restep("j1", 0, true).is_ok());
    let error = engine.restep("j1", 2, false).expect_err("out of range");
    assert!(matches!(error, EngineError::Manifest(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_zeroes_metrics_and_clears_history() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed("out.txt", "x\n", "done")]);
    let engine = fx.engine(executor);
    let job_dir = fx.create_active_job(&engine, "j1", &["plan", "impl"]);

    engine.step("j1", None).await.expect("step");
    let before = load_manifest(&job_dir).unwrap();
    assert!(before.metrics.cumulative_cost > 0.0);

    engine.rerun("j1", Some(1)).expect("rerun");

    let after = load_manifest(&job_dir).unwrap();
    assert_eq!(after.status, JobState::Pending);
    assert_eq!(after.current_phase.as_deref(), Some("impl"));
    assert_eq!(after.metrics.cumulative_cost, 0.0);
    assert_eq!(after.metrics.cumulative_time_seconds, 0.0);
    assert_eq!(after.metrics.step_count, 0);
    assert!(after.rerun_info.as_ref().unwrap().is_rerun);
    // Only the rerun marker remains.
    assert_eq!(after.history.len(), 1);
    assert_eq!(after.history[0].event.as_deref(), Some(events::RERUN));

    // Workspace survives the rerun.
    assert!(WorkspaceManager::new(&job_dir).verify());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poststep_applies_offline_reply() {
    let fx = fixture();
    let engine = fx.engine(ScriptedExecutor::new(vec![]));
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    let reply = steward::domain::parse_reply(
        r#"{"action": "COMPLETED", "evidence_files": [], "summary_for_supervisor": "authored offline"}"#,
    )
    .unwrap();

    // Dry run reports and changes nothing.
    let report = engine.poststep("j1", &reply, None, true).expect("dry run");
    assert!(report.dry_run);
    assert_eq!(report.would_transition_to, JobState::ReviewRequired);
    assert_eq!(load_manifest(&job_dir).unwrap().status, JobState::Pending);

    // Applying it advances the state with a POSTSTEP marker and no spend.
    let report = engine.poststep("j1", &reply, None, false).expect("apply");
    assert!(report.applied);

    let manifest = load_manifest(&job_dir).unwrap();
    assert_eq!(manifest.status, JobState::ReviewRequired);
    assert_eq!(manifest.metrics.cumulative_cost, 0.0);
    let entry = manifest.history.last().unwrap();
    assert_eq!(entry.event.as_deref(), Some(events::POSTSTEP));
    assert!(job_dir.join("latest-outcome.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn previous_outcome_feeds_the_next_prompt() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed(
        "out.txt",
        "x\n",
        "a very recognizable summary",
    )]);
    let engine = fx.engine(executor);
    fx.create_active_job(&engine, "j1", &["plan"]);

    engine.step("j1", None).await.expect("worker step");

    let preview = engine.preview("j1").expect("preview");
    assert_eq!(preview.role, Role::Supervisor);
    assert!(preview.prompt.contains("a very recognizable summary"));
}
