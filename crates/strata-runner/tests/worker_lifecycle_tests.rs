//! Worker membership tests: disappearance and cleanup, reappearance,
//! disable handling, status-node removal, malformed data, session loss,
//! and lazy-worker marking.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{await_condition, task, Harness};
use strata_runner::config::RunnerConfig;
use strata_runner::paths;
use strata_runner::runner::WORKER_DISAPPEARED_MSG;
use strata_runner::store::{CoordStore, NodePersistence};
use strata_runner::task::TaskState;
use strata_runner::worker::DEFAULT_CATEGORY;

async fn start_running_task(harness: &Harness, host: &str, task_id: &str) {
    harness.runner.run(task(task_id));
    harness.await_task_assigned(host, task_id).await;
    harness.mock_worker_running(host, task_id).await;
    await_condition("task to report running", || {
        harness
            .runner
            .work_item(task_id)
            .is_some_and(|item| item.lock().unwrap().state() == TaskState::Running)
    })
    .await;
}

#[tokio::test]
async fn vanished_worker_fails_its_tasks_after_the_grace_window() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let handle = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;

    harness.remove_worker("w1").await;
    await_condition("cleanup to be scheduled", || {
        harness.runner.removed_worker_cleanups().contains_key("w1")
    })
    .await;
    // Capacity leaves the cluster immediately; the tasks get a grace window.
    assert!(!harness
        .runner
        .total_task_slot_count()
        .contains_key(DEFAULT_CATEGORY));
    assert!(!handle.is_resolved());

    harness.clock.advance(Duration::from_secs(301));
    harness.runner.run_maintenance().await;

    let status = handle.wait().await.unwrap();
    assert!(status.is_failure());
    assert!(status
        .error_msg
        .as_deref()
        .unwrap()
        .contains("worker that this task was assigned disappeared"));

    assert!(harness.runner.removed_worker_cleanups().is_empty());
    assert!(harness
        .store
        .children(&paths::status_root("w1"))
        .await
        .unwrap()
        .is_empty());
    assert!(harness
        .store
        .children(&paths::assignment_root("w1"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reappearing_worker_cancels_its_cleanup() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let handle = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;

    harness.remove_worker("w1").await;
    await_condition("cleanup to be scheduled", || {
        harness.runner.removed_worker_cleanups().contains_key("w1")
    })
    .await;

    harness.announce_worker("w1", 3).await;
    await_condition("cleanup to be cancelled", || {
        !harness.runner.removed_worker_cleanups().contains_key("w1")
    })
    .await;

    // The deadline passing later must not fail anything.
    harness.clock.advance(Duration::from_secs(600));
    harness.runner.run_maintenance().await;
    assert!(!handle.is_resolved());

    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn disabled_worker_finishes_in_flight_tasks_but_gets_nothing_new() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    start_running_task(&harness, "w1", "t1").await;

    harness.disable_worker("w1", 3).await;
    await_condition("worker to be marked disabled", || {
        harness
            .runner
            .workers()
            .first()
            .is_some_and(|snapshot| snapshot.worker.is_disabled())
    })
    .await;

    // New submissions stay pending.
    let stalled = harness.runner.run(task("t2"));
    harness.runner.run_pending_tasks().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.runner.pending_tasks().len(), 1);
    assert!(!stalled.is_resolved());

    // The in-flight task still completes.
    let handle = harness.runner.run(task("t1"));
    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn status_node_removal_before_terminal_status_fails_the_task() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let handle = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    await_condition("task to report running", || {
        harness.runner.running_tasks().len() == 1
    })
    .await;

    harness
        .store
        .delete(&paths::status_path("w1", "t1"))
        .await
        .unwrap();

    let status = handle.wait().await.unwrap();
    assert!(status.is_failure());
    assert_eq!(status.error_msg.as_deref(), Some(WORKER_DISAPPEARED_MSG));

    await_condition("item to leave the table", || {
        harness.runner.work_item("t1").is_none()
    })
    .await;
}

#[tokio::test]
async fn worker_reported_failure_message_passes_through_verbatim() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let handle = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    harness
        .mock_worker_failed("w1", "t1", "segment build ran out of disk")
        .await;

    let status = handle.wait().await.unwrap();
    assert_eq!(
        status.error_msg.as_deref(),
        Some("segment build ran out of disk")
    );
}

#[tokio::test]
async fn null_status_data_alerts_without_killing_the_dispatcher() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    // A data-less status node must be tolerated.
    harness
        .store
        .create_empty(&paths::status_path("w1", "ghost"), NodePersistence::Persistent)
        .unwrap();

    // And so must undecodable bytes.
    harness
        .store
        .create(
            &paths::status_path("w1", "garbled"),
            bytes::Bytes::from_static(b"not json"),
            NodePersistence::Persistent,
        )
        .await
        .unwrap();

    // The dispatcher keeps processing well-formed events afterwards.
    let handle = harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;
    harness.mock_worker_running("w1", "t1").await;
    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn session_loss_resyncs_worker_set_on_restore() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    start_running_task(&harness, "w1", "t1").await;
    let handle = harness.runner.run(task("t1"));

    // Session break drops the ephemeral announcement.
    harness.store.break_session().unwrap();
    await_condition("worker to depart", || harness.runner.workers().is_empty()).await;

    // The worker re-announces after the new session is established.
    harness.store.restore_session();
    harness.announce_worker("w1", 3).await;
    await_condition("worker to rejoin", || harness.runner.workers().len() == 1).await;
    await_condition("cleanup to be cancelled", || {
        harness.runner.removed_worker_cleanups().is_empty()
    })
    .await;

    harness.mock_worker_success("w1", "t1").await;
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn lazy_marking_skips_workers_with_any_assigned_task() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    harness.runner.run(task("t1"));
    harness.await_task_assigned("w1", "t1").await;

    // Assigned-but-not-started still counts as busy.
    let lazy = harness.runner.mark_workers_lazy(|_| true, 1);
    assert!(lazy.is_empty());
    assert!(harness.runner.lazy_workers().is_empty());
    assert_eq!(harness.runner.workers().len(), 1);
}

#[tokio::test]
async fn lazy_marking_claims_idle_workers_and_reshapes_slot_metrics() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let lazy = harness.runner.mark_workers_lazy(|_| true, 1);
    assert_eq!(lazy.len(), 1);
    assert_eq!(harness.runner.lazy_workers().len(), 1);

    assert_eq!(harness.runner.total_task_slot_count()[DEFAULT_CATEGORY], 3);
    assert!(!harness
        .runner
        .idle_task_slot_count()
        .contains_key(DEFAULT_CATEGORY));
    assert_eq!(harness.runner.lazy_task_slot_count()[DEFAULT_CATEGORY], 3);
}

#[tokio::test]
async fn lazy_marking_respects_the_cap() {
    let harness = Harness::new(RunnerConfig::default());
    harness.announce_worker("w1", 3).await;
    harness.runner.start().await.unwrap();

    let lazy = harness.runner.mark_workers_lazy(|_| true, 0);
    assert!(lazy.is_empty());
    assert!(harness.runner.lazy_workers().is_empty());
}
