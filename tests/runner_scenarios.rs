//! End-to-end runner scenarios against the mock setup and the in-memory serializer.
//!
//! All tests run on a paused clock, so the per-step dwell times and the one-second
//! supervising tick cost no wall-clock time.

use hive_runner::config::RunnerConfig;
use hive_runner::data::MemorySerializer;
use hive_runner::experiment::{Job, JobOutcome, JobRunner, Recipe, RunStatus, RunnerHandle};
use hive_runner::hardware::mock::{MockSetup, SetupCall};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn recipe(sample_id: &str, measuring_time_sec: u64) -> Recipe {
    Recipe {
        sample_id: sample_id.into(),
        file_stem: format!("{}_D01_A", sample_id),
        measuring_time_sec,
        theta: 70.0,
        z_start: 0.0,
        z_end: 4.0,
        z_increment: 2.0,
    }
}

fn job(id: &str, recipes: Vec<Recipe>) -> Job {
    Job::new(id, recipes)
}

fn runner(setup: &Arc<MockSetup>, serializer: &Arc<MemorySerializer>) -> JobRunner {
    JobRunner::new(setup.clone(), serializer.clone(), RunnerConfig::default())
}

/// Poll the handle once per second until `done` holds, for at most `limit`.
async fn wait_until<F>(handle: &RunnerHandle, limit: Duration, done: F)
where
    F: Fn(&RunnerHandle) -> bool,
{
    tokio::time::timeout(limit, async {
        while !done(handle) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
    .await
    .expect("runner did not reach the expected state in time");
}

#[tokio::test(start_paused = true)]
async fn test_single_recipe_job_completes_and_returns_to_idle() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let (handle, task) = runner(&setup, &serializer).spawn();

    handle
        .enqueue(job("rqm_1", vec![recipe("AE007607", 30)]))
        .unwrap();
    wait_until(&handle, Duration::from_secs(60), |h| {
        h.snapshot().done.len() == 1
    })
    .await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, RunStatus::Idle);
    assert!(snapshot.active_job.is_none());
    assert!(snapshot.failed.is_empty());
    assert_eq!(snapshot.done[0].error_state, "Done with no errors");
    assert_eq!(snapshot.done[0].outcome, JobOutcome::Completed);

    // Start position plus the three z steps 0, 2 and 4.
    assert_eq!(setup.moves().len(), 4);
    assert!(serializer.histogram("rqm_1", "AE007607_D01_A").is_some());
    assert_eq!(serializer.records().len(), 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unexecutable_recipes_are_refused_and_runner_keeps_going() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let (handle, task) = runner(&setup, &serializer).spawn();

    let mut tiny_steps = recipe("S1", 30);
    tiny_steps.z_increment = 1e-300;
    let mut endless = recipe("S2", u64::MAX);
    endless.z_end = endless.z_start;
    let mut escaping = recipe("S3", 30);
    escaping.file_stem = "../../outside".into();

    for bad in [tiny_steps, endless, escaping] {
        assert!(handle.enqueue(job("rqm_bad", vec![bad])).is_err());
    }
    assert!(handle.enqueue(job("../rqm_bad", vec![recipe("S4", 3)])).is_err());
    assert!(handle.snapshot().queue.is_empty());

    handle.enqueue(job("rqm_ok", vec![recipe("S5", 3)])).unwrap();
    wait_until(&handle, Duration::from_secs(60), |h| {
        h.snapshot().done.len() == 1
    })
    .await;
    assert!(!task.is_finished());
    assert_eq!(serializer.folders(), vec!["rqm_ok".to_string()]);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_abort_mid_job_skips_remaining_recipes_and_drains_queue() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let (handle, task) = runner(&setup, &serializer).spawn();

    handle
        .enqueue(job(
            "rqm_1",
            vec![recipe("S1", 30), recipe("S2", 30)],
        ))
        .unwrap();
    handle.enqueue(job("rqm_2", vec![recipe("S3", 30)])).unwrap();

    // Inside the z scan of the first recipe: the first step has been confirmed.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(setup.moves().len(), 2);
    handle.abort();

    wait_until(&handle, Duration::from_secs(60), |h| {
        let s = h.snapshot();
        s.failed.len() == 1 && !s.abort_requested
    })
    .await;

    let snapshot = handle.snapshot();
    assert!(snapshot.done.is_empty());
    assert!(snapshot.queue.is_empty(), "queued jobs are dropped on abort");
    assert_eq!(snapshot.status, RunStatus::Idle);
    assert_eq!(snapshot.failed[0].job.id, "rqm_1");
    assert_eq!(snapshot.failed[0].outcome, JobOutcome::Aborted);
    assert!(snapshot.failed[0].error_state.contains("Aborted"));

    // S2 never started, the hardware was aborted once and resumed afterwards.
    assert_eq!(
        setup.count(&SetupCall::ConfigureAcquisition {
            measuring_time_sec: 30,
            file_stem: "S2_D01_A".into()
        }),
        0
    );
    assert_eq!(setup.count(&SetupCall::Abort), 1);
    assert_eq!(setup.count(&SetupCall::Resume), 1);
    assert!(!setup.is_aborted());
    assert_eq!(serializer.folders(), vec!["rqm_1".to_string()]);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_idle_files_next_job_and_drops_the_rest() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let runner = runner(&setup, &serializer);
    let handle = runner.handle();

    for i in 1..=3 {
        handle
            .enqueue(job(&format!("rqm_{}", i), vec![recipe("S", 10)]))
            .unwrap();
    }
    handle.abort();
    runner.run_once().await;

    let snapshot = handle.snapshot();
    assert!(snapshot.queue.is_empty());
    assert!(!snapshot.abort_requested);
    assert!(snapshot.done.is_empty());
    assert_eq!(snapshot.failed.len(), 1);
    assert_eq!(snapshot.failed[0].job.id, "rqm_1");
    assert_eq!(snapshot.failed[0].outcome, JobOutcome::Aborted);
    assert_eq!(serializer.records().len(), 1);
    assert!(serializer.folders().is_empty());
    assert_eq!(setup.calls(), vec![SetupCall::Resume]);
}

#[tokio::test(start_paused = true)]
async fn test_resume_before_next_iteration_keeps_queue() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let runner = runner(&setup, &serializer);
    let handle = runner.handle();

    handle.enqueue(job("rqm_1", vec![recipe("S", 3)])).unwrap();
    handle.abort();
    handle.resume();
    runner.run_once().await;

    assert_eq!(handle.snapshot().done.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_histories_keep_five_newest_first() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let runner = runner(&setup, &serializer);
    let handle = runner.handle();

    for i in 1..=7 {
        handle
            .enqueue(job(&format!("rqm_{}", i), vec![recipe("S", 3)]))
            .unwrap();
    }
    for _ in 0..7 {
        runner.run_once().await;
    }

    let ids: Vec<String> = handle
        .snapshot()
        .done
        .into_iter()
        .map(|r| r.job.id)
        .collect();
    assert_eq!(ids, vec!["rqm_7", "rqm_6", "rqm_5", "rqm_4", "rqm_3"]);
    assert_eq!(serializer.records().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_record_persistence_failure_keeps_loop_running() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    serializer.fail_records("disk full");
    let (handle, task) = runner(&setup, &serializer).spawn();

    handle.enqueue(job("rqm_1", vec![recipe("S1", 3)])).unwrap();
    handle.enqueue(job("rqm_2", vec![recipe("S2", 3)])).unwrap();
    wait_until(&handle, Duration::from_secs(60), |h| {
        h.snapshot().done.len() == 2
    })
    .await;

    assert!(serializer.records().is_empty());
    assert!(!task.is_finished());

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_json_while_running() {
    let setup = Arc::new(MockSetup::new());
    let serializer = Arc::new(MemorySerializer::new());
    let (handle, task) = runner(&setup, &serializer).spawn();

    handle.enqueue(job("rqm_1", vec![recipe("S1", 30)])).unwrap();
    handle.enqueue(job("rqm_2", vec![recipe("S2", 30)])).unwrap();
    tokio::time::sleep(Duration::from_millis(5_500)).await;

    let json = handle.snapshot_json().unwrap();
    assert_eq!(json["run_status"], "Running");
    assert_eq!(json["active_sample_id"], "S1");
    assert_eq!(json["run_time_target"], 30);
    assert_eq!(json["active_job"]["id"], "rqm_1");
    assert_eq!(json["queue"][0]["id"], "rqm_2");
    assert!(json["run_time"].as_u64().unwrap() >= 4);

    handle.shutdown();
    task.await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_jobs_start_in_enqueue_order(count in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let (started, expected) = runtime.block_on(async {
            let setup = Arc::new(MockSetup::new());
            let serializer = Arc::new(MemorySerializer::new());
            let runner = runner(&setup, &serializer);
            let handle = runner.handle();

            let ids: Vec<String> = (0..count).map(|i| format!("rqm_{}", i)).collect();
            for id in &ids {
                handle.enqueue(job(id, vec![recipe("S", 1)])).unwrap();
            }
            for _ in 0..count {
                runner.run_once().await;
            }
            (serializer.folders(), ids)
        });

        prop_assert_eq!(started, expected);
    }
}
