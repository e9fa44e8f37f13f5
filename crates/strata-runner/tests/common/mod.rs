//! Shared harness for runner integration tests: a store-backed fake worker
//! fleet, a recording report transport, and condition polling.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;

use strata_core::clock::ManualClock;
use strata_runner::config::RunnerConfig;
use strata_runner::error::Result;
use strata_runner::paths;
use strata_runner::reports::{ReportClient, ReportStream};
use strata_runner::runner::RemoteTaskRunner;
use strata_runner::store::memory::InMemoryCoordStore;
use strata_runner::store::{CoordStore, NodePersistence};
use strata_runner::task::{Task, TaskResource, TaskStatus};
use strata_runner::worker::{TaskLocation, Worker, DEFAULT_CATEGORY};

const CONDITION_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Report transport that records requested URLs and serves a canned body.
#[derive(Debug)]
pub struct RecordingReportClient {
    pub urls: Mutex<Vec<String>>,
    pub body: &'static str,
}

impl RecordingReportClient {
    pub fn new(body: &'static str) -> Self {
        Self {
            urls: Mutex::new(Vec::new()),
            body,
        }
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportClient for RecordingReportClient {
    async fn stream(&self, url: &str) -> Result<ReportStream> {
        self.urls.lock().unwrap().push(url.to_string());
        let chunk = Bytes::copy_from_slice(self.body.as_bytes());
        Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
    }
}

/// Everything a test needs to drive the runner against a fake cluster.
pub struct Harness {
    pub store: Arc<InMemoryCoordStore>,
    pub clock: Arc<ManualClock>,
    pub reports: Arc<RecordingReportClient>,
    pub runner: RemoteTaskRunner,
}

impl Harness {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_report_body(config, "")
    }

    pub fn with_report_body(config: RunnerConfig, body: &'static str) -> Self {
        let store = Arc::new(InMemoryCoordStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let reports = Arc::new(RecordingReportClient::new(body));
        let runner = RemoteTaskRunner::new(
            config,
            Arc::clone(&store) as Arc<dyn CoordStore>,
            Arc::clone(&clock) as Arc<dyn strata_core::clock::Clock>,
            Arc::clone(&reports) as Arc<dyn ReportClient>,
        );
        Self {
            store,
            clock,
            reports,
            runner,
        }
    }

    /// Announces a worker with the default category.
    pub async fn announce_worker(&self, host: &str, capacity: u32) {
        announce_worker(&*self.store, host, capacity).await;
    }

    /// Re-announces a worker with an empty version, disabling it.
    pub async fn disable_worker(&self, host: &str, capacity: u32) {
        let worker = Worker::new(host, "127.0.0.1", "", capacity, DEFAULT_CATEGORY);
        let data = Bytes::from(serde_json::to_vec(&worker).unwrap());
        self.store
            .set_data(&paths::announcement_path(host), data)
            .await
            .unwrap();
    }

    /// Deletes a worker's ephemeral announcement.
    pub async fn remove_worker(&self, host: &str) {
        self.store
            .delete(&paths::announcement_path(host))
            .await
            .unwrap();
    }

    /// Writes a RUNNING status for a task, located at `dummy:9000`.
    pub async fn mock_worker_running(&self, host: &str, task_id: &str) {
        self.mock_worker_running_at(host, task_id, "dummy", 9000)
            .await;
    }

    /// Writes a RUNNING status for a task with an explicit location.
    pub async fn mock_worker_running_at(
        &self,
        host: &str,
        task_id: &str,
        location_host: &str,
        port: u16,
    ) {
        let status =
            TaskStatus::running(task_id).with_location(TaskLocation::new(location_host, port));
        write_status(&*self.store, host, task_id, &status).await;
    }

    /// Writes a SUCCESS status for a task.
    pub async fn mock_worker_success(&self, host: &str, task_id: &str) {
        write_status(&*self.store, host, task_id, &TaskStatus::success(task_id)).await;
    }

    /// Writes a FAILED status for a task.
    pub async fn mock_worker_failed(&self, host: &str, task_id: &str, message: &str) {
        write_status(
            &*self.store,
            host,
            task_id,
            &TaskStatus::failed(task_id, message),
        )
        .await;
    }

    /// Returns true once an assignment node exists for the task on `host`.
    pub async fn task_assigned(&self, host: &str, task_id: &str) -> bool {
        self.store
            .exists(&paths::assignment_path(host, task_id))
            .await
            .unwrap()
    }

    /// Waits until the task's assignment node appears on `host`.
    pub async fn await_task_assigned(&self, host: &str, task_id: &str) {
        let path = paths::assignment_path(host, task_id);
        await_async_condition("assignment node to appear", || {
            let store = Arc::clone(&self.store);
            let path = path.clone();
            async move { store.exists(&path).await.unwrap() }
        })
        .await;
    }
}

pub async fn announce_worker(store: &InMemoryCoordStore, host: &str, capacity: u32) {
    let worker = Worker::new(host, "127.0.0.1", "0", capacity, DEFAULT_CATEGORY);
    let data = Bytes::from(serde_json::to_vec(&worker).unwrap());
    let path = paths::announcement_path(host);
    if store.exists(&path).await.unwrap() {
        store.set_data(&path, data).await.unwrap();
    } else {
        store
            .create(&path, data, NodePersistence::Ephemeral)
            .await
            .unwrap();
    }
}

async fn write_status(store: &InMemoryCoordStore, host: &str, task_id: &str, status: &TaskStatus) {
    let path = paths::status_path(host, task_id);
    let data = Bytes::from(serde_json::to_vec(status).unwrap());
    if store.exists(&path).await.unwrap() {
        store.set_data(&path, data).await.unwrap();
    } else {
        store
            .create(&path, data, NodePersistence::Persistent)
            .await
            .unwrap();
    }
}

/// Builds a task whose availability group is its own ID.
pub fn task(id: &str) -> Task {
    Task::new(id, TaskResource::new(id, 1), "events")
}

/// Builds a task with an explicit availability group and required capacity.
pub fn task_with_resource(id: &str, group: &str, required: u32) -> Task {
    Task::new(id, TaskResource::new(group, required), "events")
}

/// Polls a synchronous condition until it holds or the timeout elapses.
pub async fn await_condition<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + CONDITION_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("condition not met within timeout: {what}");
}

/// Polls an asynchronous condition until it holds or the timeout elapses.
pub async fn await_async_condition<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + CONDITION_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("condition not met within timeout: {what}");
}

/// Drains a report stream into a string.
pub async fn read_stream_to_string(mut stream: ReportStream) -> String {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(bytes).unwrap()
}
