//! Worker announcements and derived slot accounting.

use serde::{Deserialize, Serialize};

/// Category assigned to workers and tasks that do not request one.
pub const DEFAULT_CATEGORY: &str = "default";

/// A worker's self-announcement, published as an ephemeral node under
/// the announcements root.
///
/// A worker with an empty `version` is *disabled*: it keeps its in-flight
/// tasks but receives no new assignments. Operators use this as an
/// externally visible quiesce signal before decommissioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Host the worker serves task traffic on. Registry key.
    pub host: String,
    /// Announced IP address.
    pub ip: String,
    /// Software version; empty means disabled.
    pub version: String,
    /// Number of task slots the worker offers.
    pub capacity: u32,
    /// Category bucket this worker serves.
    pub category: String,
}

impl Worker {
    /// Creates a worker announcement.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        ip: impl Into<String>,
        version: impl Into<String>,
        capacity: u32,
        category: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            ip: ip.into(),
            version: version.into(),
            capacity,
            category: category.into(),
        }
    }

    /// Returns true when the worker has quiesced itself via an empty version.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.version.is_empty()
    }
}

/// Network location of a task once its worker reports RUNNING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLocation {
    /// Host serving the task's HTTP surface.
    pub host: String,
    /// Plaintext port.
    pub port: u16,
    /// Whether the worker serves the task over TLS.
    #[serde(default)]
    pub tls: bool,
}

impl TaskLocation {
    /// Creates a plaintext task location.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }
}

/// Point-in-time view of one alive worker, as seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// The announced worker record.
    pub worker: Worker,
    /// Capacity consumed by assigned-or-running tasks.
    pub used: u32,
    /// Whether the autoscaler has marked this worker for scale-down.
    pub lazy: bool,
    /// Whether the worker is currently blacklisted.
    pub blacklisted: bool,
}

impl WorkerSnapshot {
    /// Returns the capacity still available for new assignments.
    #[must_use]
    pub fn idle(&self) -> u32 {
        self.worker.capacity.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_version_means_disabled() {
        let mut worker = Worker::new("w1", "10.0.0.1", "2024.1", 3, DEFAULT_CATEGORY);
        assert!(!worker.is_disabled());

        worker.version.clear();
        assert!(worker.is_disabled());
    }

    #[test]
    fn worker_wire_format_is_camel_case() {
        let worker = Worker::new("w1", "10.0.0.1", "2024.1", 3, DEFAULT_CATEGORY);
        let json = serde_json::to_value(&worker).unwrap();
        assert_eq!(json["host"], "w1");
        assert_eq!(json["capacity"], 3);
        assert_eq!(json["category"], "default");
    }

    #[test]
    fn location_round_trips() {
        let loc = TaskLocation::new("dummy", 9000);
        let json = serde_json::to_string(&loc).unwrap();
        let parsed: TaskLocation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, loc);
        assert!(!parsed.tls);
    }

    #[test]
    fn snapshot_idle_saturates() {
        let snapshot = WorkerSnapshot {
            worker: Worker::new("w1", "ip", "v", 3, DEFAULT_CATEGORY),
            used: 5,
            lazy: false,
            blacklisted: false,
        };
        assert_eq!(snapshot.idle(), 0);
    }
}
