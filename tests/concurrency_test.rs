//! Concurrent access: the dequeue-to-run race and lock semantics.

mod common;

use common::{Scripted, ScriptedExecutor, fixture};
use std::sync::Arc;
use std::time::Duration;

use steward::domain::JobState;
use steward::store::{LockManager, load_manifest};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_execute_the_job_exactly_once() {
    let fx = fixture();

    // One STUCK outcome: the winning run drives the job straight into the
    // blocking INTERVENTION_REQUIRED state; the loser must not execute.
    let executor = ScriptedExecutor::new(vec![Scripted::stuck("single racing step")]);
    let engine_a = Arc::new(fx.engine(executor.clone()));
    let engine_b = Arc::new(fx.engine(executor.clone()));

    let job_dir = fx.create_active_job(&engine_a, "j3", &["plan"]);
    assert_eq!(
        engine_a.store().index().read().queue,
        vec!["j3".to_string()]
    );

    // Both runners pick the queue head with no id given.
    let a = {
        let engine = engine_a.clone();
        tokio::spawn(async move { engine.run(None, None).await })
    };
    let b = {
        let engine = engine_b.clone();
        tokio::spawn(async move { engine.run(None, None).await })
    };

    let report_a = a.await.unwrap().expect("runner a");
    let report_b = b.await.unwrap().expect("runner b");

    // Exactly one executed the step; the loser observed a state it could
    // not step (blocking, or the winner's transient executing state) and
    // exited cleanly.
    assert_eq!(report_a.steps_executed + report_b.steps_executed, 1);
    assert_eq!(executor.invocations(), 1);
    let winner = if report_a.steps_executed == 1 {
        &report_a
    } else {
        &report_b
    };
    assert_eq!(winner.final_status, JobState::InterventionRequired);
    assert_eq!(
        load_manifest(&job_dir).unwrap().status,
        JobState::InterventionRequired
    );

    // A single step entry in history; the loser recorded nothing.
    let manifest = load_manifest(&job_dir).unwrap();
    let steps = manifest
        .history
        .iter()
        .filter(|e| e.is_executor_step())
        .count();
    assert_eq!(steps, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_blocks_on_the_job_lock_until_timeout() {
    let fx = fixture();
    let executor = ScriptedExecutor::new(vec![Scripted::completed("out.txt", "x\n", "done")]);
    let engine = fx.engine(executor);
    fx.create_active_job(&engine, "j1", &["plan"]);

    // Hold the job lock from "another process".
    let locks = LockManager::new(&fx.jobs_dir);
    let guard = locks.lock_job("j1", Duration::from_secs(1)).unwrap();

    // A step in a blocking task waits on the lock; release it shortly
    // after and the step completes.
    let engine = Arc::new(engine);
    let stepper = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.step("j1", None).await })
    };

    tokio::time::sleep(Duration::from_millis(400)).await;
    drop(guard);

    let report = stepper.await.unwrap().expect("step after lock release");
    assert_eq!(report.new_status, JobState::ReviewRequired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_tolerates_duplicate_activation() {
    let fx = fixture();
    let engine = fx.engine(ScriptedExecutor::new(vec![]));
    let job_dir = fx.create_active_job(&engine, "j1", &["plan"]);

    // Re-activating a PENDING job is an invalid transition.
    assert!(engine.activate("j1", None).is_err());

    // Reset to DRAFT and activate again: the queue holds one entry.
    let mut manifest = load_manifest(&job_dir).unwrap();
    manifest.status = JobState::Draft;
    steward::store::save_manifest(&job_dir, &manifest).unwrap();
    engine.activate("j1", Some(0)).unwrap();

    let index = engine.store().index().read();
    assert_eq!(index.queue, vec!["j1".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn index_mutations_are_serialized_under_the_lock() {
    let fx = fixture();
    let index = steward::store::IndexStore::new(&fx.jobs_dir);
    index.ensure().unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let index = index.clone();
        let jobs_dir = fx.jobs_dir.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            index
                .with_lock(Duration::from_secs(10), |ix| {
                    let id = format!("job-{i}");
                    ix.jobs.insert(id.clone(), jobs_dir.join(&id));
                    ix.enqueue(&id, None);
                })
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let final_index = index.read();
    assert_eq!(final_index.jobs.len(), 8);
    assert_eq!(final_index.queue.len(), 8);
    // Every queue entry is a registered job.
    assert!(
        final_index
            .queue
            .iter()
            .all(|id| final_index.jobs.contains_key(id))
    );
}
