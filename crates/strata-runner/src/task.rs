//! Task records, status reports, and the runner's per-task work item.
//!
//! The runner treats a task as opaque: an identifier, a resource request,
//! and a JSON payload. `WorkItem` is the runner's bookkeeping record for one
//! submitted task; its lifecycle is strictly monotonic
//! (PENDING → ASSIGNED → RUNNING → COMPLETE) and its result is a
//! single-resolve, multi-consumer [`TaskResultHandle`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::worker::TaskLocation;

/// Resource request attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResource {
    /// Tasks sharing a non-empty group name are mutually exclusive: at most
    /// one may be assigned-or-running cluster-wide at a time.
    pub availability_group: String,
    /// Task slots the task consumes on its worker.
    pub required_capacity: u32,
}

impl TaskResource {
    /// Creates a resource request.
    #[must_use]
    pub fn new(availability_group: impl Into<String>, required_capacity: u32) -> Self {
        Self {
            availability_group: availability_group.into(),
            required_capacity,
        }
    }
}

/// A unit of work submitted to the runner.
///
/// IDs are arbitrary caller-supplied strings and may contain whitespace;
/// they are percent-encoded whenever embedded in a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Resource request.
    pub resource: TaskResource,
    /// Data source the task ingests into.
    pub data_source: String,
    /// Worker category the task requires, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Engine-specific payload, carried verbatim to the worker.
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    /// Creates a task with the given ID, resource request, and data source.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        resource: TaskResource,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource,
            data_source: data_source.into(),
            category: None,
            payload: Value::Null,
        }
    }

    /// Sets the required worker category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the engine-specific payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Lifecycle state of a work item.
///
/// Transitions are monotonic; there are no backward edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting in the pending queue.
    Pending,
    /// An assignment node has been published for a worker.
    Assigned,
    /// The worker has acknowledged the task and reported a location.
    Running,
    /// A terminal status has been resolved onto the result handle.
    Complete,
}

impl TaskState {
    /// Returns true if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Assigned | Self::Complete),
            Self::Assigned => matches!(target, Self::Running | Self::Complete),
            Self::Running => matches!(target, Self::Complete),
            Self::Complete => false,
        }
    }
}

/// Status code a worker reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatusCode {
    /// The task is executing.
    Running,
    /// The task finished successfully.
    Success,
    /// The task failed.
    Failed,
}

impl TaskStatusCode {
    /// Returns true for SUCCESS or FAILED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A task status report, written by workers to their status nodes and
/// resolved onto result handles on terminal codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// The task this status refers to.
    pub id: String,
    /// Status code.
    pub code: TaskStatusCode,
    /// Failure message, passed through verbatim from the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Where the task is served from, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TaskLocation>,
}

impl TaskStatus {
    /// Creates a RUNNING status.
    #[must_use]
    pub fn running(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: TaskStatusCode::Running,
            error_msg: None,
            location: None,
        }
    }

    /// Creates a SUCCESS status.
    #[must_use]
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: TaskStatusCode::Success,
            error_msg: None,
            location: None,
        }
    }

    /// Creates a FAILED status with the given message.
    #[must_use]
    pub fn failed(id: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: TaskStatusCode::Failed,
            error_msg: Some(error_msg.into()),
            location: None,
        }
    }

    /// Attaches a task location.
    #[must_use]
    pub fn with_location(mut self, location: TaskLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Returns true for SUCCESS or FAILED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }

    /// Returns true for SUCCESS.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, TaskStatusCode::Success)
    }

    /// Returns true for FAILED.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.code, TaskStatusCode::Failed)
    }
}

/// Awaitable, cloneable handle to a task's terminal status.
///
/// The underlying promise resolves at most once; every clone observes the
/// same resolution.
#[derive(Debug, Clone)]
pub struct TaskResultHandle {
    rx: watch::Receiver<Option<TaskStatus>>,
}

impl TaskResultHandle {
    /// Returns the terminal status if the task has already completed.
    #[must_use]
    pub fn try_status(&self) -> Option<TaskStatus> {
        self.rx.borrow().clone()
    }

    /// Returns true once the task has reached a terminal status.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the terminal status.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the runner dropped the work item without
    /// resolving it, which only happens on an unclean shutdown.
    pub async fn wait(mut self) -> Result<TaskStatus> {
        loop {
            if let Some(status) = self.rx.borrow_and_update().clone() {
                return Ok(status);
            }
            if self.rx.changed().await.is_err() {
                return Err(Error::internal(
                    "task result dropped before resolution",
                ));
            }
        }
    }
}

/// The runner's bookkeeping record for one submitted task.
///
/// Mutations are serialized by the mutex the coordinator wraps each item in;
/// this type itself only enforces monotonicity.
#[derive(Debug)]
pub struct WorkItem {
    /// The submitted task.
    pub task: Task,
    state: TaskState,
    worker_host: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    location: Option<TaskLocation>,
    queue_insertion_time: DateTime<Utc>,
    result_tx: watch::Sender<Option<TaskStatus>>,
}

impl WorkItem {
    /// Creates a pending work item inserted into the queue at `now`.
    #[must_use]
    pub fn new(task: Task, now: DateTime<Utc>) -> Self {
        let (result_tx, _) = watch::channel(None);
        Self {
            task,
            state: TaskState::Pending,
            worker_host: None,
            assigned_at: None,
            location: None,
            queue_insertion_time: now,
            result_tx,
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Returns the host this item is assigned to, if any.
    #[must_use]
    pub fn worker_host(&self) -> Option<&str> {
        self.worker_host.as_deref()
    }

    /// Returns when the current assignment was published, if any.
    #[must_use]
    pub fn assigned_at(&self) -> Option<DateTime<Utc>> {
        self.assigned_at
    }

    /// Returns the reported task location, if any.
    #[must_use]
    pub fn location(&self) -> Option<&TaskLocation> {
        self.location.as_ref()
    }

    /// Returns when the item entered the pending queue.
    #[must_use]
    pub fn queue_insertion_time(&self) -> DateTime<Utc> {
        self.queue_insertion_time
    }

    /// Returns a handle that resolves with this item's terminal status.
    #[must_use]
    pub fn result_handle(&self) -> TaskResultHandle {
        TaskResultHandle {
            rx: self.result_tx.subscribe(),
        }
    }

    /// Marks the item assigned to `host` at `now`.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the item is not PENDING.
    pub fn mark_assigned(&mut self, host: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(TaskState::Assigned) {
            return Err(Error::internal(format!(
                "cannot assign task '{}' in state {:?}",
                self.task.id, self.state
            )));
        }
        self.state = TaskState::Assigned;
        self.worker_host = Some(host.into());
        self.assigned_at = Some(now);
        Ok(())
    }

    /// Marks the item running at `location`.
    ///
    /// A late RUNNING report for a completed item is ignored; a repeated
    /// RUNNING report refreshes the location.
    pub fn mark_running(&mut self, location: Option<TaskLocation>) {
        match self.state {
            TaskState::Assigned => {
                self.state = TaskState::Running;
                self.location = location;
            }
            TaskState::Running => {
                if location.is_some() {
                    self.location = location;
                }
            }
            TaskState::Pending | TaskState::Complete => {}
        }
    }

    /// Restores an item directly into a rehydrated state.
    ///
    /// Used only at startup when reconstructing items from store nodes.
    pub fn restore(
        &mut self,
        state: TaskState,
        host: impl Into<String>,
        assigned_at: DateTime<Utc>,
        location: Option<TaskLocation>,
    ) {
        self.state = state;
        self.worker_host = Some(host.into());
        self.assigned_at = Some(assigned_at);
        self.location = location;
    }

    /// Returns the item to PENDING for another assignment attempt.
    ///
    /// Only meaningful for items whose assignment was rolled back before any
    /// status was observed; completed items are left untouched.
    pub fn reset_to_pending(&mut self) {
        if self.state == TaskState::Assigned {
            self.state = TaskState::Pending;
            self.worker_host = None;
            self.assigned_at = None;
        }
    }

    /// Resolves the item with a terminal status.
    ///
    /// Returns false when the item was already complete; the promise is
    /// resolved at most once and later resolutions are ignored.
    pub fn resolve(&mut self, status: TaskStatus) -> bool {
        if self.state == TaskState::Complete {
            return false;
        }
        self.state = TaskState::Complete;
        self.result_tx.send_replace(Some(status));
        true
    }
}

/// Read-only snapshot of a work item for introspection surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemSnapshot {
    /// The task identifier.
    pub task_id: String,
    /// Data source of the task.
    pub data_source: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Assigned worker host, if any.
    pub worker_host: Option<String>,
    /// Reported location, if any.
    pub location: Option<TaskLocation>,
    /// When the item entered the pending queue.
    pub queue_insertion_time: DateTime<Utc>,
}

impl WorkItem {
    /// Returns a read-only snapshot of this item.
    #[must_use]
    pub fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            task_id: self.task.id.clone(),
            data_source: self.task.data_source.clone(),
            state: self.state,
            worker_host: self.worker_host.clone(),
            location: self.location.clone(),
            queue_insertion_time: self.queue_insertion_time,
        }
    }
}
