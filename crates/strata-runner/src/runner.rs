//! The remote task runner.
//!
//! A long-lived supervisor reconciling three asynchronous feeds into one
//! assignment state:
//!
//! - the pending-task queue (external submissions)
//! - the worker membership feed (ephemeral announcement nodes)
//! - the per-task status feed (per-worker status child watches)
//!
//! Three loops run under [`RemoteTaskRunner::start`]: the *dispatch loop*
//! drains every store event through a single consumer so per-worker ordering
//! is explicit; the *assignment loop* runs a planning pass whenever capacity
//! or the queue changes; the *maintenance loop* evaluates clock deadlines
//! (assignment timeouts, worker-cleanup grace, blacklist dwell) and refreshes
//! gauges. All deadline decisions consult the injected clock, never the
//! system time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use strata_core::clock::Clock;

use crate::assign::{
    plan_assignments, EqualDistributionStrategy, PendingTask, WorkerSelectStrategy,
};
use crate::blacklist::BlacklistController;
use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::metrics::RunnerMetrics;
use crate::paths;
use crate::reports::{live_reports_url, ReportClient, ReportStream};
use crate::store::{
    with_backoff, ChildEvent, ChildNode, CoordStore, NodePersistence, SessionEvent,
};
use crate::task::{
    Task, TaskResource, TaskResultHandle, TaskState, TaskStatus, WorkItem, WorkItemSnapshot,
};
use crate::worker::{Worker, WorkerSnapshot, DEFAULT_CATEGORY};

/// Failure message for tasks whose worker vanished before a terminal status.
pub const WORKER_DISAPPEARED_MSG: &str = "The worker that this task was assigned disappeared";

/// Failure message for tasks cancelled while the supervisor tears down
/// assignment state.
pub const WORKER_CLEANUP_MSG: &str = "Canceled for worker cleanup";

/// Failure message for assignments aborted by an identity race.
pub const ASSIGNMENT_RACED_MSG: &str =
    "Failed to assign this task. See overlord logs for more details.";

/// Prefix of the failure message for assignments the worker never started.
pub const ASSIGNMENT_TIMEOUT_MSG_PREFIX: &str =
    "The worker that this task is assigned did not start it in timeout";

/// Cadence of the maintenance loop under [`RemoteTaskRunner::start`].
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct WorkerEntry {
    worker: Worker,
    lazy: bool,
}

#[derive(Debug)]
enum RunnerEvent {
    Announcement(ChildEvent),
    Status { host: String, event: ChildEvent },
    Session(SessionEvent),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Debug)]
struct RunnerState {
    config: RunnerConfig,
    store: Arc<dyn CoordStore>,
    clock: Arc<dyn Clock>,
    report_client: Arc<dyn ReportClient>,
    strategy: Box<dyn WorkerSelectStrategy>,
    metrics: RunnerMetrics,
    blacklist: BlacklistController,

    tasks: RwLock<HashMap<String, Arc<Mutex<WorkItem>>>>,
    workers: RwLock<HashMap<String, WorkerEntry>>,
    cleanups: Mutex<HashMap<String, DateTime<Utc>>>,

    event_tx: mpsc::UnboundedSender<RunnerEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RunnerEvent>>>,
    assign_notify: Notify,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    status_watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Drop for RunnerState {
    fn drop(&mut self) {
        for handle in lock(&self.loop_handles).drain(..) {
            handle.abort();
        }
        for (_, handle) in lock(&self.status_watches).drain() {
            handle.abort();
        }
    }
}

/// The remote task runner.
///
/// Constructed with explicit dependencies (store, clock, report transport,
/// configuration); owns no global state. `start`/`stop` bracket its
/// background loops. The handle is cheap to clone and every method is safe
/// to call from any task at any time.
#[derive(Debug, Clone)]
pub struct RemoteTaskRunner {
    inner: Arc<RunnerState>,
}

impl RemoteTaskRunner {
    /// Creates a runner with the default equal-distribution strategy.
    #[must_use]
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn CoordStore>,
        clock: Arc<dyn Clock>,
        report_client: Arc<dyn ReportClient>,
    ) -> Self {
        Self::with_strategy(
            config,
            store,
            clock,
            report_client,
            Box::new(EqualDistributionStrategy),
        )
    }

    /// Creates a runner with a custom worker selection strategy.
    #[must_use]
    pub fn with_strategy(
        config: RunnerConfig,
        store: Arc<dyn CoordStore>,
        clock: Arc<dyn Clock>,
        report_client: Arc<dyn ReportClient>,
        strategy: Box<dyn WorkerSelectStrategy>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let blacklist = BlacklistController::new(
            config.max_retries_before_blacklist,
            config.max_percentage_blacklist_workers,
            config.worker_blacklist_backoff,
        );
        Self {
            inner: Arc::new(RunnerState {
                config,
                store,
                clock,
                report_client,
                strategy,
                metrics: RunnerMetrics::new(),
                blacklist,
                tasks: RwLock::new(HashMap::new()),
                workers: RwLock::new(HashMap::new()),
                cleanups: Mutex::new(HashMap::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                assign_notify: Notify::new(),
                loop_handles: Mutex::new(Vec::new()),
                status_watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the runner's configuration.
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    // --- Lifecycle ---

    /// Starts the runner: rehydrates state from the store, registers
    /// watches, and spawns the dispatch, assignment, and maintenance loops.
    ///
    /// # Errors
    ///
    /// Returns an error when the runner was already started or the initial
    /// store enumeration fails.
    pub async fn start(&self) -> Result<()> {
        let event_rx = lock(&self.inner.event_rx)
            .take()
            .ok_or_else(|| Error::internal("remote task runner already started"))?;

        let watch = self
            .inner
            .store
            .watch_children(paths::ANNOUNCEMENTS_PATH)
            .await?;
        for node in &watch.initial {
            self.register_worker_from_node(node);
        }

        // Assignment nodes first, then status snapshots, so a status event
        // always finds the item it upgrades.
        let hosts: Vec<String> = {
            let workers = read(&self.inner.workers);
            let mut hosts: Vec<String> = workers.keys().cloned().collect();
            hosts.sort();
            hosts
        };
        for host in &hosts {
            self.rehydrate_assignments(host).await?;
        }
        for host in &hosts {
            self.attach_status_watch(host).await?;
        }

        let mut announce_events = watch.events;
        let tx = self.inner.event_tx.clone();
        let announce_handle = tokio::spawn(async move {
            while let Some(event) = announce_events.recv().await {
                if tx.send(RunnerEvent::Announcement(event)).is_err() {
                    break;
                }
            }
        });

        let mut session_rx = self.inner.store.watch_session();
        let tx = self.inner.event_tx.clone();
        let session_handle = tokio::spawn(async move {
            loop {
                match session_rx.recv().await {
                    Ok(event) => {
                        if tx.send(RunnerEvent::Session(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let this = self.clone();
        let dispatch_handle = tokio::spawn(async move { this.dispatch_loop(event_rx).await });

        let this = self.clone();
        let assign_handle = tokio::spawn(async move { this.assignment_loop().await });

        let this = self.clone();
        let maintenance_handle = tokio::spawn(async move { this.maintenance_loop().await });

        lock(&self.inner.loop_handles).extend([
            announce_handle,
            session_handle,
            dispatch_handle,
            assign_handle,
            maintenance_handle,
        ]);
        self.inner.assign_notify.notify_one();
        tracing::info!(workers = hosts.len(), "remote task runner started");
        Ok(())
    }

    /// Stops the runner: cancels the loops, drops watch subscriptions, and
    /// resolves every outstanding promise with a cancellation failure.
    ///
    /// Assignment nodes are left in the store on purpose; their workers may
    /// still complete the tasks, and a later runner recovers the state at
    /// startup.
    pub fn stop(&self) {
        for handle in lock(&self.inner.loop_handles).drain(..) {
            handle.abort();
        }
        for (_, handle) in lock(&self.inner.status_watches).drain() {
            handle.abort();
        }
        let items: Vec<Arc<Mutex<WorkItem>>> = read(&self.inner.tasks).values().cloned().collect();
        for item in items {
            let mut guard = lock(&item);
            if !guard.state().is_terminal() {
                let task_id = guard.task.id.clone();
                guard.resolve(TaskStatus::failed(task_id, WORKER_CLEANUP_MSG));
            }
        }
        tracing::info!("remote task runner stopped");
    }

    // --- Submission ---

    /// Submits a task and returns a handle to its terminal status.
    ///
    /// Submission is idempotent: re-submitting an in-flight (or completed)
    /// task ID returns a handle to the existing item.
    pub fn run(&self, task: Task) -> TaskResultHandle {
        if let Some(existing) = self.work_item(&task.id) {
            return lock(&existing).result_handle();
        }
        let item = self.add_pending_task(task);
        let handle = lock(&item).result_handle();
        handle
    }

    /// Inserts a task into the pending queue and returns its work item.
    ///
    /// If an item already exists for the task ID, the existing item is
    /// returned and the submission is otherwise a no-op.
    pub fn add_pending_task(&self, task: Task) -> Arc<Mutex<WorkItem>> {
        let now = self.inner.clock.now();
        let task_id = task.id.clone();
        let item = {
            let mut tasks = write(&self.inner.tasks);
            Arc::clone(
                tasks
                    .entry(task_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(WorkItem::new(task, now)))),
            )
        };
        tracing::info!(task_id, "task added to pending queue");
        self.inner.assign_notify.notify_one();
        item
    }

    /// Returns the live work item for `task_id`, if one exists.
    #[must_use]
    pub fn work_item(&self, task_id: &str) -> Option<Arc<Mutex<WorkItem>>> {
        read(&self.inner.tasks).get(task_id).cloned()
    }

    // --- Assignment ---

    /// Runs one assignment pass over the pending queue.
    ///
    /// Tasks are considered in queue-insertion order; independent tasks are
    /// published concurrently up to the configured parallelism.
    pub async fn run_pending_tasks(&self) {
        let plan = {
            let pending = self.pending_for_planning();
            if pending.is_empty() {
                return;
            }
            let workers = self.worker_snapshots();
            let blacklisted: HashSet<String> = self
                .inner
                .blacklist
                .blacklisted_hosts()
                .into_iter()
                .collect();
            let occupied = self.occupied_groups();
            plan_assignments(
                pending,
                &workers,
                &blacklisted,
                &occupied,
                self.inner.strategy.as_ref(),
            )
        };
        if plan.is_empty() {
            return;
        }

        let limit = self.inner.config.pending_tasks_runner_num_threads.max(1);
        stream::iter(plan)
            .for_each_concurrent(limit, |planned| async move {
                if let Some(item) = self.work_item(&planned.task_id) {
                    self.publish_assignment(item, &planned.host).await;
                }
            })
            .await;
    }

    /// Attempts to assign a single pending work item.
    ///
    /// Guards against identity drift: when `item` is no longer the
    /// registered item for its task ID, the assignment is aborted and the
    /// registered item (if any) fails with the raced-assignment message,
    /// without mutating worker state.
    pub async fn run_pending_task(&self, item: Arc<Mutex<WorkItem>>) {
        let task_id = lock(&item).task.id.clone();
        let registered = self.work_item(&task_id);
        let registered = match registered {
            Some(registered) if Arc::ptr_eq(&registered, &item) => registered,
            other => {
                tracing::error!(
                    task_id,
                    "work item identity drifted between selection and publication"
                );
                if let Some(registered) = other {
                    lock(&registered).resolve(TaskStatus::failed(&task_id, ASSIGNMENT_RACED_MSG));
                }
                return;
            }
        };

        let planned = {
            let pending = {
                let guard = lock(&registered);
                if guard.state() != TaskState::Pending {
                    return;
                }
                vec![PendingTask {
                    task: guard.task.clone(),
                    queue_insertion_time: guard.queue_insertion_time(),
                }]
            };
            let workers = self.worker_snapshots();
            let blacklisted: HashSet<String> = self
                .inner
                .blacklist
                .blacklisted_hosts()
                .into_iter()
                .collect();
            let occupied = self.occupied_groups();
            plan_assignments(
                pending,
                &workers,
                &blacklisted,
                &occupied,
                self.inner.strategy.as_ref(),
            )
        };
        let Some(first) = planned.into_iter().next() else {
            return;
        };
        self.publish_assignment(registered, &first.host).await;
    }

    async fn publish_assignment(&self, item: Arc<Mutex<WorkItem>>, host: &str) {
        let (task_id, payload) = {
            let guard = lock(&item);
            if guard.state() != TaskState::Pending {
                return;
            }
            (guard.task.id.clone(), serde_json::to_vec(&guard.task))
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(task_id, error = %err, "failed to serialize task payload");
                lock(&item).resolve(TaskStatus::failed(&task_id, ASSIGNMENT_RACED_MSG));
                return;
            }
        };
        if payload.len() > self.inner.config.max_payload_bytes {
            tracing::error!(
                task_id,
                payload_bytes = payload.len(),
                limit_bytes = self.inner.config.max_payload_bytes,
                "task payload exceeds the maximum assignment node size"
            );
            lock(&item).resolve(TaskStatus::failed(&task_id, ASSIGNMENT_RACED_MSG));
            return;
        }

        let path = paths::assignment_path(host, &task_id);
        let data = Bytes::from(payload);
        let result = with_backoff("create assignment node", || {
            let store = Arc::clone(&self.inner.store);
            let path = path.clone();
            let data = data.clone();
            async move {
                if store.exists(&path).await? {
                    return Ok(());
                }
                store.create(&path, data, NodePersistence::Persistent).await
            }
        })
        .await;

        match result {
            Ok(()) => {
                let now = self.inner.clock.now();
                let mut guard = lock(&item);
                if guard.state() == TaskState::Pending && guard.mark_assigned(host, now).is_ok() {
                    tracing::info!(task_id, worker = host, "task assigned");
                }
            }
            Err(err) => {
                tracing::error!(task_id, worker = host, error = %err, "failed to publish assignment node");
                lock(&item).resolve(TaskStatus::failed(&task_id, ASSIGNMENT_RACED_MSG));
            }
        }
    }

    // --- Maintenance ---

    /// Runs one maintenance pass against the injected clock: expires
    /// assignment timers, fires due worker cleanups, sweeps the blacklist,
    /// and refreshes gauges.
    pub async fn run_maintenance(&self) {
        let now = self.inner.clock.now();
        self.expire_assignments(now).await;
        self.run_worker_cleanups(now).await;
        self.check_blacklisted_workers();
        self.emit_metrics();
    }

    /// Re-admits workers whose blacklist dwell has elapsed.
    pub fn check_blacklisted_workers(&self) {
        if !self.inner.blacklist.sweep(self.inner.clock.now()).is_empty() {
            self.inner.assign_notify.notify_one();
        }
    }

    async fn expire_assignments(&self, now: DateTime<Utc>) {
        let timeout = chrono_duration(self.inner.config.task_assignment_timeout);
        let expired: Vec<(String, String, Arc<Mutex<WorkItem>>)> = {
            let tasks = read(&self.inner.tasks);
            tasks
                .iter()
                .filter_map(|(task_id, item)| {
                    let guard = lock(item);
                    let host = guard.worker_host()?.to_string();
                    (guard.state() == TaskState::Assigned
                        && guard.assigned_at().is_some_and(|at| at + timeout <= now))
                    .then(|| (task_id.clone(), host, Arc::clone(item)))
                })
                .collect()
        };

        for (task_id, host, item) in expired {
            let message = format!(
                "{ASSIGNMENT_TIMEOUT_MSG_PREFIX}[{:?}]",
                self.inner.config.task_assignment_timeout
            );
            if !lock(&item).resolve(TaskStatus::failed(&task_id, message)) {
                continue;
            }
            tracing::error!(task_id, worker = %host, "assignment timed out before the worker started the task");

            let path = paths::assignment_path(&host, &task_id);
            if let Err(err) = with_backoff("delete assignment node", || {
                let store = Arc::clone(&self.inner.store);
                let path = path.clone();
                async move { store.delete(&path).await }
            })
            .await
            {
                tracing::warn!(path, error = %err, "failed to delete timed-out assignment node");
            }

            let alive = read(&self.inner.workers).len();
            self.inner.blacklist.record_failure(&host, alive, now);
            self.record_run_time(&item, "FAILED", now);
            self.inner.assign_notify.notify_one();
        }
    }

    async fn run_worker_cleanups(&self, now: DateTime<Utc>) {
        let due: Vec<String> = {
            let cleanups = lock(&self.inner.cleanups);
            cleanups
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(host, _)| host.clone())
                .collect()
        };

        for host in due {
            if read(&self.inner.workers).contains_key(&host) {
                // Reappeared before the deadline was evaluated.
                lock(&self.inner.cleanups).remove(&host);
                continue;
            }
            tracing::warn!(host, "worker cleanup deadline reached; failing its tasks");

            let items: Vec<(String, Arc<Mutex<WorkItem>>)> = {
                let tasks = read(&self.inner.tasks);
                tasks
                    .iter()
                    .filter(|(_, item)| lock(item).worker_host() == Some(host.as_str()))
                    .map(|(task_id, item)| (task_id.clone(), Arc::clone(item)))
                    .collect()
            };
            for (task_id, item) in &items {
                let resolved = {
                    let mut guard = lock(item);
                    (!guard.state().is_terminal())
                        .then(|| {
                            guard.resolve(TaskStatus::failed(
                                task_id.as_str(),
                                WORKER_DISAPPEARED_MSG,
                            ))
                        })
                        .unwrap_or(false)
                };
                if resolved {
                    self.record_run_time(item, "FAILED", now);
                }
            }
            {
                let mut tasks = write(&self.inner.tasks);
                for (task_id, _) in &items {
                    tasks.remove(task_id);
                }
            }

            if let Some(handle) = lock(&self.inner.status_watches).remove(&host) {
                handle.abort();
            }
            for root in [paths::assignment_root(&host), paths::status_root(&host)] {
                if let Ok(children) = self.inner.store.children(&root).await {
                    for child in children {
                        let _ = self.inner.store.delete(&format!("{root}/{child}")).await;
                    }
                }
                let _ = self.inner.store.delete(&root).await;
            }

            lock(&self.inner.cleanups).remove(&host);
            self.inner.blacklist.forget(&host);
            self.inner.assign_notify.notify_one();
        }
    }

    // --- Event handling ---

    async fn dispatch_loop(&self, mut rx: mpsc::UnboundedReceiver<RunnerEvent>) {
        while let Some(event) = rx.recv().await {
            let path = match &event {
                RunnerEvent::Announcement(child) => child.path().to_string(),
                RunnerEvent::Status { event, .. } => event.path().to_string(),
                RunnerEvent::Session(_) => String::new(),
            };
            if let Err(err) = self.handle_event(event).await {
                tracing::error!(path, error = %err, "event listener failed; dispatcher continues");
            }
        }
    }

    async fn handle_event(&self, event: RunnerEvent) -> Result<()> {
        match event {
            RunnerEvent::Announcement(child) => self.handle_announcement_event(child).await,
            RunnerEvent::Status { host, event } => {
                self.handle_status_event(&host, event);
                Ok(())
            }
            RunnerEvent::Session(session) => self.handle_session_event(session).await,
        }
    }

    async fn handle_announcement_event(&self, event: ChildEvent) -> Result<()> {
        match event {
            ChildEvent::Added { path, data } | ChildEvent::Updated { path, data } => {
                let Some(data) = data else {
                    tracing::error!(path, "announcement node carried no data; ignoring");
                    return Ok(());
                };
                let worker: Worker = serde_json::from_slice(&data).map_err(|err| {
                    Error::serialization(format!("malformed worker announcement at {path}: {err}"))
                })?;
                self.worker_announced(worker).await
            }
            ChildEvent::Removed { path } => {
                let host = paths::last_segment(&path).to_string();
                self.worker_departed(&host);
                Ok(())
            }
        }
    }

    async fn worker_announced(&self, worker: Worker) -> Result<()> {
        let host = worker.host.clone();
        let disabled = worker.is_disabled();
        let is_new = {
            let mut workers = write(&self.inner.workers);
            let lazy = workers.get(&host).is_some_and(|entry| entry.lazy);
            workers
                .insert(host.clone(), WorkerEntry { worker, lazy })
                .is_none()
        };
        let cancelled_cleanup = lock(&self.inner.cleanups).remove(&host).is_some();
        if cancelled_cleanup {
            tracing::info!(host, "worker reappeared; cancelling scheduled task cleanup");
        }
        if disabled {
            tracing::info!(host, "worker disabled; in-flight tasks continue, no new assignments");
        } else if is_new {
            tracing::info!(host, "worker joined");
        }

        // A reconnecting worker may already carry assignment and status
        // nodes from before the departure.
        self.rehydrate_assignments(&host).await?;
        self.attach_status_watch(&host).await?;
        self.inner.assign_notify.notify_one();
        Ok(())
    }

    fn worker_departed(&self, host: &str) {
        let removed = write(&self.inner.workers).remove(host).is_some();
        if !removed {
            return;
        }
        let deadline =
            self.inner.clock.now() + chrono_duration(self.inner.config.task_cleanup_timeout);
        lock(&self.inner.cleanups).insert(host.to_string(), deadline);
        tracing::warn!(host, %deadline, "worker disappeared; task cleanup scheduled");
    }

    async fn handle_session_event(&self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Lost => {
                tracing::warn!("coordination store session lost; awaiting restore");
                Ok(())
            }
            SessionEvent::Restored => {
                tracing::info!("coordination store session restored; resyncing worker set");
                self.resync_workers().await
            }
        }
    }

    async fn resync_workers(&self) -> Result<()> {
        let names = self.inner.store.children(paths::ANNOUNCEMENTS_PATH).await?;
        let current: HashSet<String> = names.into_iter().collect();
        let known: Vec<String> = read(&self.inner.workers).keys().cloned().collect();

        for host in &known {
            if !current.contains(host) {
                self.worker_departed(host);
            }
        }
        for host in current {
            if known.contains(&host) {
                continue;
            }
            let Some(data) = self
                .inner
                .store
                .get_data(&paths::announcement_path(&host))
                .await?
            else {
                continue;
            };
            match serde_json::from_slice::<Worker>(&data) {
                Ok(worker) => self.worker_announced(worker).await?,
                Err(err) => {
                    tracing::error!(host, error = %err, "malformed announcement during resync; ignoring");
                }
            }
        }
        Ok(())
    }

    fn handle_status_event(&self, host: &str, event: ChildEvent) {
        match event {
            ChildEvent::Added { path, data } | ChildEvent::Updated { path, data } => {
                let Some(data) = data else {
                    tracing::error!(path, worker = host, "status node carried no data; ignoring");
                    return;
                };
                let status: TaskStatus = match serde_json::from_slice(&data) {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::error!(path, worker = host, error = %err, "malformed status data; ignoring");
                        return;
                    }
                };
                self.apply_status(host, status);
            }
            ChildEvent::Removed { path } => {
                let task_id = paths::last_segment(&path).to_string();
                self.status_node_removed(&task_id);
            }
        }
    }

    fn apply_status(&self, host: &str, status: TaskStatus) {
        let item = match self.work_item(&status.id) {
            Some(item) => item,
            None => self.recover_item_from_status(host, &status),
        };

        if status.code.is_terminal() {
            let resolved = lock(&item).resolve(status.clone());
            if resolved {
                let now = self.inner.clock.now();
                tracing::info!(task_id = %status.id, worker = host, code = %status.code, "task completed");
                if status.is_success() {
                    self.inner.blacklist.record_success(host);
                } else {
                    let alive = read(&self.inner.workers).len();
                    self.inner.blacklist.record_failure(host, alive, now);
                }
                self.record_run_time(&item, &status.code.to_string(), now);
                self.inner.assign_notify.notify_one();
            }
        } else {
            let mut guard = lock(&item);
            let before = guard.state();
            guard.mark_running(status.location.clone());
            if before != guard.state() {
                tracing::info!(task_id = %status.id, worker = host, "task running");
            }
        }
    }

    /// Reconstructs a work item from a status node for a task the runner has
    /// no record of, which happens when the worker deleted the assignment
    /// node before a restart.
    fn recover_item_from_status(&self, host: &str, status: &TaskStatus) -> Arc<Mutex<WorkItem>> {
        let now = self.inner.clock.now();
        let task = Task::new(
            status.id.clone(),
            TaskResource::new(status.id.clone(), 1),
            "",
        );
        let item = {
            let mut tasks = write(&self.inner.tasks);
            Arc::clone(
                tasks
                    .entry(status.id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(WorkItem::new(task, now)))),
            )
        };
        {
            let mut guard = lock(&item);
            if guard.state() == TaskState::Pending {
                guard.restore(TaskState::Assigned, host, now, None);
                tracing::info!(task_id = %status.id, worker = host, "recovered task from worker status node");
            }
        }
        item
    }

    fn status_node_removed(&self, task_id: &str) {
        let Some(item) = self.work_item(task_id) else {
            return;
        };
        let resolved = {
            let mut guard = lock(&item);
            !guard.state().is_terminal()
                && guard.resolve(TaskStatus::failed(task_id, WORKER_DISAPPEARED_MSG))
        };
        if resolved {
            tracing::warn!(task_id, "status node removed before terminal status; failing task");
            self.record_run_time(&item, "FAILED", self.inner.clock.now());
        }
        // Promise resolved and status node gone: the item leaves the table.
        write(&self.inner.tasks).remove(task_id);
        self.inner.assign_notify.notify_one();
    }

    // --- Rehydration ---

    fn register_worker_from_node(&self, node: &ChildNode) {
        let Some(data) = &node.data else {
            tracing::error!(path = %node.path, "announcement node carried no data; ignoring");
            return;
        };
        match serde_json::from_slice::<Worker>(data) {
            Ok(worker) => {
                write(&self.inner.workers).insert(
                    worker.host.clone(),
                    WorkerEntry {
                        worker,
                        lazy: false,
                    },
                );
            }
            Err(err) => {
                tracing::error!(path = %node.path, error = %err, "malformed worker announcement; ignoring");
            }
        }
    }

    async fn rehydrate_assignments(&self, host: &str) -> Result<()> {
        let root = paths::assignment_root(host);
        for name in self.inner.store.children(&root).await? {
            let path = format!("{root}/{name}");
            let Some(data) = self.inner.store.get_data(&path).await? else {
                continue;
            };
            let task: Task = match serde_json::from_slice(&data) {
                Ok(task) => task,
                Err(err) => {
                    tracing::error!(path, error = %err, "malformed assignment payload; ignoring");
                    continue;
                }
            };
            let now = self.inner.clock.now();
            let task_id = task.id.clone();
            let item = {
                let mut tasks = write(&self.inner.tasks);
                Arc::clone(
                    tasks
                        .entry(task_id.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(WorkItem::new(task, now)))),
                )
            };
            let mut guard = lock(&item);
            if guard.state() == TaskState::Pending {
                // Assignment-only entries restart their assignment timer.
                guard.restore(TaskState::Assigned, host, now, None);
                tracing::info!(task_id, worker = host, "rehydrated assigned task");
            }
        }
        Ok(())
    }

    async fn attach_status_watch(&self, host: &str) -> Result<()> {
        if lock(&self.inner.status_watches).contains_key(host) {
            return Ok(());
        }
        let watch = self
            .inner
            .store
            .watch_children(&paths::status_root(host))
            .await?;
        for node in watch.initial {
            self.handle_status_event(
                host,
                ChildEvent::Added {
                    path: node.path,
                    data: node.data,
                },
            );
        }
        let mut events = watch.events;
        let tx = self.inner.event_tx.clone();
        let host_owned = host.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx
                    .send(RunnerEvent::Status {
                        host: host_owned.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        lock(&self.inner.status_watches).insert(host.to_string(), handle);
        Ok(())
    }

    // --- Report proxy ---

    /// Streams live reports from the worker currently hosting `task_id`.
    ///
    /// Returns `None` for unknown, pending, or completed tasks, and for
    /// running tasks whose location is not yet known.
    ///
    /// # Errors
    ///
    /// Returns an HTTP error when the worker request fails.
    pub async fn stream_task_reports(&self, task_id: &str) -> Result<Option<ReportStream>> {
        let Some(item) = self.work_item(task_id) else {
            return Ok(None);
        };
        let (state, location) = {
            let guard = lock(&item);
            (guard.state(), guard.location().cloned())
        };
        if state != TaskState::Running {
            return Ok(None);
        }
        let Some(location) = location else {
            return Ok(None);
        };
        let url = live_reports_url(&location, task_id);
        let stream = self.inner.report_client.stream(&url).await?;
        Ok(Some(stream))
    }

    // --- Introspection ---

    /// Returns snapshots of tasks waiting in the pending queue.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<WorkItemSnapshot> {
        self.snapshots_in(|state| state == TaskState::Pending)
    }

    /// Returns snapshots of tasks currently assigned or running.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<WorkItemSnapshot> {
        self.snapshots_in(|state| matches!(state, TaskState::Assigned | TaskState::Running))
    }

    /// Returns snapshots of every task the runner knows about.
    #[must_use]
    pub fn known_tasks(&self) -> Vec<WorkItemSnapshot> {
        self.snapshots_in(|_| true)
    }

    fn snapshots_in(&self, predicate: impl Fn(TaskState) -> bool) -> Vec<WorkItemSnapshot> {
        let tasks = read(&self.inner.tasks);
        let mut snapshots: Vec<WorkItemSnapshot> = tasks
            .values()
            .filter_map(|item| {
                let guard = lock(item);
                predicate(guard.state()).then(|| guard.snapshot())
            })
            .collect();
        snapshots.sort_by(|a, b| {
            a.queue_insertion_time
                .cmp(&b.queue_insertion_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        snapshots
    }

    /// Returns point-in-time views of every alive worker, sorted by host.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.worker_snapshots()
    }

    /// Returns workers currently marked lazy by the autoscaler.
    #[must_use]
    pub fn lazy_workers(&self) -> Vec<Worker> {
        let workers = read(&self.inner.workers);
        let mut lazy: Vec<Worker> = workers
            .values()
            .filter(|entry| entry.lazy)
            .map(|entry| entry.worker.clone())
            .collect();
        lazy.sort_by(|a, b| a.host.cmp(&b.host));
        lazy
    }

    /// Returns alive workers that are currently blacklisted.
    #[must_use]
    pub fn blacklisted_workers(&self) -> Vec<Worker> {
        let blacklisted: HashSet<String> = self
            .inner
            .blacklist
            .blacklisted_hosts()
            .into_iter()
            .collect();
        let workers = read(&self.inner.workers);
        let mut result: Vec<Worker> = workers
            .values()
            .filter(|entry| blacklisted.contains(&entry.worker.host))
            .map(|entry| entry.worker.clone())
            .collect();
        result.sort_by(|a, b| a.host.cmp(&b.host));
        result
    }

    /// Returns the consecutive-failure count tracked for `host`.
    #[must_use]
    pub fn consecutive_failures(&self, host: &str) -> u32 {
        self.inner.blacklist.consecutive_failures(host)
    }

    /// Returns the worker hosting `task_id`, when the task is assigned or
    /// running.
    #[must_use]
    pub fn find_worker_running_task(&self, task_id: &str) -> Option<Worker> {
        let host = {
            let item = self.work_item(task_id)?;
            let guard = lock(&item);
            matches!(guard.state(), TaskState::Assigned | TaskState::Running)
                .then(|| guard.worker_host().map(str::to_string))??
        };
        read(&self.inner.workers)
            .get(&host)
            .map(|entry| entry.worker.clone())
    }

    /// Returns the pending per-host cleanup deadlines.
    #[must_use]
    pub fn removed_worker_cleanups(&self) -> HashMap<String, DateTime<Utc>> {
        lock(&self.inner.cleanups).clone()
    }

    /// Marks up to `max_lazy` idle workers lazy, scanning in host order.
    ///
    /// A worker hosting any assigned-or-running task is never marked.
    /// Returns the newly marked workers.
    pub fn mark_workers_lazy<F>(&self, filter: F, max_lazy: usize) -> Vec<Worker>
    where
        F: Fn(&WorkerSnapshot) -> bool,
    {
        let snapshots = self.worker_snapshots();
        let mut marked = Vec::new();
        let mut workers = write(&self.inner.workers);
        for snapshot in snapshots {
            if marked.len() >= max_lazy {
                break;
            }
            if snapshot.used > 0 || snapshot.lazy || !filter(&snapshot) {
                continue;
            }
            if let Some(entry) = workers.get_mut(&snapshot.worker.host) {
                entry.lazy = true;
                marked.push(entry.worker.clone());
            }
        }
        marked
    }

    // --- Slot accounting ---

    /// Total task slots per category across alive workers.
    #[must_use]
    pub fn total_task_slot_count(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for snapshot in self.worker_snapshots() {
            *counts.entry(snapshot.worker.category.clone()).or_default() +=
                u64::from(snapshot.worker.capacity);
        }
        counts
    }

    /// Slots consumed by assigned-or-running tasks, per category.
    #[must_use]
    pub fn used_task_slot_count(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for snapshot in self.worker_snapshots() {
            *counts.entry(snapshot.worker.category.clone()).or_default() +=
                u64::from(snapshot.used);
        }
        counts
    }

    /// Idle slots per category. Lazy and blacklisted workers contribute
    /// nothing; a category with no contributors is absent from the map.
    #[must_use]
    pub fn idle_task_slot_count(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for snapshot in self.worker_snapshots() {
            if snapshot.lazy || snapshot.blacklisted {
                continue;
            }
            *counts.entry(snapshot.worker.category.clone()).or_default() +=
                u64::from(snapshot.idle());
        }
        counts
    }

    /// Slots on lazy workers per category; absent when no worker is lazy.
    #[must_use]
    pub fn lazy_task_slot_count(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for snapshot in self.worker_snapshots() {
            if !snapshot.lazy {
                continue;
            }
            *counts.entry(snapshot.worker.category.clone()).or_default() +=
                u64::from(snapshot.worker.capacity);
        }
        counts
    }

    /// Slots on blacklisted workers per category; absent when none.
    #[must_use]
    pub fn blacklisted_task_slot_count(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for snapshot in self.worker_snapshots() {
            if !snapshot.blacklisted {
                continue;
            }
            *counts.entry(snapshot.worker.category.clone()).or_default() +=
                u64::from(snapshot.worker.capacity);
        }
        counts
    }

    /// Total task slots across the cluster.
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.worker_snapshots()
            .iter()
            .map(|snapshot| u64::from(snapshot.worker.capacity))
            .sum()
    }

    /// Task slots currently consumed across the cluster.
    #[must_use]
    pub fn used_capacity(&self) -> u64 {
        self.worker_snapshots()
            .iter()
            .map(|snapshot| u64::from(snapshot.used))
            .sum()
    }

    // --- Internals ---

    fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let used = self.used_by_host();
        let workers = read(&self.inner.workers);
        let mut snapshots: Vec<WorkerSnapshot> = workers
            .values()
            .map(|entry| WorkerSnapshot {
                used: used.get(&entry.worker.host).copied().unwrap_or(0),
                lazy: entry.lazy,
                blacklisted: self.inner.blacklist.is_blacklisted(&entry.worker.host),
                worker: entry.worker.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.worker.host.cmp(&b.worker.host));
        snapshots
    }

    fn used_by_host(&self) -> HashMap<String, u32> {
        let tasks = read(&self.inner.tasks);
        let mut used: HashMap<String, u32> = HashMap::new();
        for item in tasks.values() {
            let guard = lock(item);
            if !matches!(guard.state(), TaskState::Assigned | TaskState::Running) {
                continue;
            }
            if let Some(host) = guard.worker_host() {
                *used.entry(host.to_string()).or_default() += guard.task.resource.required_capacity;
            }
        }
        used
    }

    fn occupied_groups(&self) -> HashSet<String> {
        let tasks = read(&self.inner.tasks);
        tasks
            .values()
            .filter_map(|item| {
                let guard = lock(item);
                (matches!(guard.state(), TaskState::Assigned | TaskState::Running)
                    && !guard.task.resource.availability_group.is_empty())
                .then(|| guard.task.resource.availability_group.clone())
            })
            .collect()
    }

    fn pending_for_planning(&self) -> Vec<PendingTask> {
        let tasks = read(&self.inner.tasks);
        tasks
            .values()
            .filter_map(|item| {
                let guard = lock(item);
                (guard.state() == TaskState::Pending).then(|| PendingTask {
                    task: guard.task.clone(),
                    queue_insertion_time: guard.queue_insertion_time(),
                })
            })
            .collect()
    }

    fn record_run_time(&self, item: &Arc<Mutex<WorkItem>>, status: &str, now: DateTime<Utc>) {
        let (task_id, data_source, inserted) = {
            let guard = lock(item);
            (
                guard.task.id.clone(),
                guard.task.data_source.clone(),
                guard.queue_insertion_time(),
            )
        };
        let elapsed = (now - inserted).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let seconds = elapsed as f64 / 1_000.0;
        self.inner
            .metrics
            .observe_task_run_time(&task_id, &data_source, status, seconds);
    }

    fn emit_metrics(&self) {
        let mut slot_counts: HashMap<String, (u64, u64, u64, u64)> = HashMap::new();
        for snapshot in self.worker_snapshots() {
            let entry = slot_counts
                .entry(snapshot.worker.category.clone())
                .or_default();
            entry.0 += u64::from(snapshot.worker.capacity);
            if snapshot.lazy {
                entry.2 += u64::from(snapshot.worker.capacity);
            } else if snapshot.blacklisted {
                entry.3 += u64::from(snapshot.worker.capacity);
            } else {
                entry.1 += u64::from(snapshot.idle());
            }
        }
        for (category, (total, idle, lazy, blacklisted)) in slot_counts {
            self.inner
                .metrics
                .set_slot_counts(&category, total, idle, lazy, blacklisted);
        }

        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut running: HashMap<String, usize> = HashMap::new();
        {
            let tasks = read(&self.inner.tasks);
            for item in tasks.values() {
                let guard = lock(item);
                let category = guard
                    .task
                    .category
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
                match guard.state() {
                    TaskState::Pending => *pending.entry(category).or_default() += 1,
                    TaskState::Assigned | TaskState::Running => {
                        *running.entry(category).or_default() += 1;
                    }
                    TaskState::Complete => {}
                }
            }
        }
        for (category, count) in pending {
            self.inner.metrics.set_pending_count(&category, count);
        }
        for (category, count) in running {
            self.inner.metrics.set_running_count(&category, count);
        }
    }

    async fn assignment_loop(&self) {
        loop {
            self.inner.assign_notify.notified().await;
            self.run_pending_tasks().await;
        }
    }

    async fn maintenance_loop(&self) {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.run_maintenance().await;
        }
    }
}
