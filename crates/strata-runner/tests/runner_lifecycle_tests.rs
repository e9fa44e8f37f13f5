//! End-to-end lifecycle tests: submission, status tracking, idempotent
//! resubmission, and restart-time rehydration.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{await_condition, task, Harness};
use strata_core::clock::Clock;
use strata_runner::config::RunnerConfig;
use strata_runner::paths;
use strata_runner::reports::ReportClient;
use strata_runner::runner::{RemoteTaskRunner, ASSIGNMENT_TIMEOUT_MSG_PREFIX};
use strata_runner::store::{CoordStore, NodePersistence};
use strata_runner::task::{TaskState, TaskStatusCode};
use strata_runner::worker::DEFAULT_CATEGORY;

#[tokio::test]
async fn happy_path_runs_task_to_success() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let runner = &harness.runner;
    assert_eq!(runner.total_task_slot_count()[DEFAULT_CATEGORY], 3);
    assert_eq!(runner.idle_task_slot_count()[DEFAULT_CATEGORY], 3);
    assert_eq!(runner.used_task_slot_count()[DEFAULT_CATEGORY], 0);
    assert_eq!(runner.total_capacity(), 3);
    assert_eq!(runner.used_capacity(), 0);

    let handle = runner.run(task("task1"));
    harness.await_task_assigned("w1", "task1").await;

    harness.mock_worker_running("w1", "task1").await;
    await_condition("task to report running", || {
        runner
            .work_item("task1")
            .is_some_and(|item| item.lock().unwrap().state() == TaskState::Running)
    })
    .await;

    harness.mock_worker_success("w1", "task1").await;
    let status = handle.wait().await.unwrap();
    assert_eq!(status.id, "task1");
    assert_eq!(status.code, TaskStatusCode::Success);

    harness
        .store
        .delete(&paths::status_path("w1", "task1"))
        .await
        .unwrap();
    await_condition("completed item to leave the table", || {
        runner.work_item("task1").is_none()
    })
    .await;

    assert_eq!(runner.idle_task_slot_count()[DEFAULT_CATEGORY], 3);
    assert_eq!(runner.used_task_slot_count()[DEFAULT_CATEGORY], 0);
    assert_eq!(runner.used_capacity(), 0);
}

#[tokio::test]
async fn resubmit_before_start_of_execution_returns_live_promise() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;

    // Resubmitting an assigned-but-not-started task returns a live handle.
    let handle = harness.runner.run(task("t1"));
    assert!(!handle.is_resolved());

    harness.mock_worker_running("w1", "t1").await;
    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn resubmit_while_running_returns_live_promise() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    await_condition("task to report running", || {
        harness
            .runner
            .work_item("t1")
            .is_some_and(|item| item.lock().unwrap().state() == TaskState::Running)
    })
    .await;

    let handle = harness.runner.run(task("t1"));
    assert!(!handle.is_resolved());

    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn resubmit_after_completion_returns_resolved_promise() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let first = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    harness.mock_worker_success("w1", "t1").await;
    assert!(first.wait().await.unwrap().is_success());

    let replay = harness.runner.run(task("t1"));
    let status = replay.wait().await.unwrap();
    assert_eq!(status.code, TaskStatusCode::Success);
}

#[tokio::test]
async fn zero_workers_leaves_submission_pending() {
    let harness = Harness::new(RunnerConfig::default());
    harness.runner.start().await.unwrap();

    let handle = harness.runner.run(task("t1"));
    harness.runner.run_pending_tasks().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.runner.pending_tasks().len(), 1);
    assert!(harness.runner.running_tasks().is_empty());
    assert!(!handle.is_resolved());
}

#[tokio::test]
async fn oversized_capacity_request_stays_pending() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let handle = harness
        .runner
        .run(common::task_with_resource("big", "big", 4));
    harness.runner.run_pending_tasks().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.runner.pending_tasks().len(), 1);
    assert!(!handle.is_resolved());
    assert!(!harness.task_assigned("w1", "big").await);
}

#[tokio::test]
async fn restart_rehydrates_in_flight_tasks() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    await_condition("task to report running", || {
        harness
            .runner
            .work_item("t1")
            .is_some_and(|item| item.lock().unwrap().state() == TaskState::Running)
    })
    .await;

    harness.runner.stop();

    // A fresh runner over the same store rediscovers the task by ID.
    let second = RemoteTaskRunner::new(
        RunnerConfig::default(),
        Arc::clone(&harness.store) as Arc<dyn CoordStore>,
        Arc::clone(&harness.clock) as Arc<dyn Clock>,
        Arc::clone(&harness.reports) as Arc<dyn ReportClient>,
    );
    second.start().await.unwrap();

    let item = second
        .work_item("t1")
        .expect("rehydrated work item for t1");
    let handle = item.lock().unwrap().result_handle();

    harness.mock_worker_success("w1", "t1").await;
    let status = handle.wait().await.unwrap();
    assert_eq!(status.id, "t1");
    assert_eq!(status.code, TaskStatusCode::Success);
    second.stop();
}

#[tokio::test]
async fn rehydrated_assignment_without_status_restarts_its_timer() {
    use chrono::Utc;
    use strata_core::clock::ManualClock;
    use strata_runner::store::memory::InMemoryCoordStore;

    let store = Arc::new(InMemoryCoordStore::new());
    common::announce_worker(&store, "w1", 3).await;

    // A pre-existing assignment node with no status yet.
    let payload = serde_json::to_vec(&task("orphan")).unwrap();
    store
        .create(
            &paths::assignment_path("w1", "orphan"),
            bytes::Bytes::from(payload),
            NodePersistence::Persistent,
        )
        .await
        .unwrap();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let runner = RemoteTaskRunner::new(
        RunnerConfig::default(),
        Arc::clone(&store) as Arc<dyn CoordStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::new(common::RecordingReportClient::new("")) as Arc<dyn ReportClient>,
    );
    runner.start().await.unwrap();

    let item = runner.work_item("orphan").expect("rehydrated item");
    assert_eq!(item.lock().unwrap().state(), TaskState::Assigned);
    let handle = item.lock().unwrap().result_handle();

    clock.advance(Duration::from_secs(301));
    runner.run_maintenance().await;

    let status = handle.wait().await.unwrap();
    assert!(status.is_failure());
    assert!(status
        .error_msg
        .unwrap()
        .starts_with(ASSIGNMENT_TIMEOUT_MSG_PREFIX));
    runner.stop();
}
