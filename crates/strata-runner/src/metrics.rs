//! Observability metrics for the remote task runner.
//!
//! Metrics are exported through the `metrics` crate facade. To export to
//! Prometheus, install a recorder at startup:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `task/pending/count` | Gauge | category | Tasks waiting for assignment |
//! | `task/running/count` | Gauge | category | Tasks assigned or running |
//! | `workers/total/count` | Gauge | category | Total task slots |
//! | `workers/idle/count` | Gauge | category | Idle task slots |
//! | `workers/lazy/count` | Gauge | category | Slots on scale-down candidates |
//! | `workers/blacklisted/count` | Gauge | category | Slots on suspended workers |
//! | `task/run/time` | Histogram | taskId, dataSource, status | Submit-to-terminal task time |

use metrics::{gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Gauge: tasks waiting for assignment.
    pub const TASK_PENDING_COUNT: &str = "task/pending/count";
    /// Gauge: tasks assigned or running.
    pub const TASK_RUNNING_COUNT: &str = "task/running/count";
    /// Gauge: total task slots across alive workers.
    pub const WORKERS_TOTAL_COUNT: &str = "workers/total/count";
    /// Gauge: idle task slots across alive workers.
    pub const WORKERS_IDLE_COUNT: &str = "workers/idle/count";
    /// Gauge: task slots on workers marked lazy by the autoscaler.
    pub const WORKERS_LAZY_COUNT: &str = "workers/lazy/count";
    /// Gauge: task slots on blacklisted workers.
    pub const WORKERS_BLACKLISTED_COUNT: &str = "workers/blacklisted/count";
    /// Histogram: wall time from queue insertion to terminal status, in seconds.
    pub const TASK_RUN_TIME: &str = "task/run/time";
}

/// Label keys used across metrics.
pub mod labels {
    /// Worker/task category.
    pub const CATEGORY: &str = "category";
    /// Task identifier.
    pub const TASK_ID: &str = "taskId";
    /// Data source the task ingests into.
    pub const DATA_SOURCE: &str = "dataSource";
    /// Terminal status (SUCCESS or FAILED).
    pub const STATUS: &str = "status";
}

/// High-level interface for recording runner metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct RunnerMetrics {
    _private: (),
}

impl RunnerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pending task count for a category.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pending_count(&self, category: &str, count: usize) {
        gauge!(names::TASK_PENDING_COUNT, labels::CATEGORY => category.to_string())
            .set(count as f64);
    }

    /// Sets the assigned-or-running task count for a category.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_running_count(&self, category: &str, count: usize) {
        gauge!(names::TASK_RUNNING_COUNT, labels::CATEGORY => category.to_string())
            .set(count as f64);
    }

    /// Sets the per-category slot gauges in one shot.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_slot_counts(
        &self,
        category: &str,
        total: u64,
        idle: u64,
        lazy: u64,
        blacklisted: u64,
    ) {
        gauge!(names::WORKERS_TOTAL_COUNT, labels::CATEGORY => category.to_string())
            .set(total as f64);
        gauge!(names::WORKERS_IDLE_COUNT, labels::CATEGORY => category.to_string())
            .set(idle as f64);
        gauge!(names::WORKERS_LAZY_COUNT, labels::CATEGORY => category.to_string())
            .set(lazy as f64);
        gauge!(names::WORKERS_BLACKLISTED_COUNT, labels::CATEGORY => category.to_string())
            .set(blacklisted as f64);
    }

    /// Records a completed task's wall time.
    pub fn observe_task_run_time(
        &self,
        task_id: &str,
        data_source: &str,
        status: &str,
        duration_secs: f64,
    ) {
        histogram!(
            names::TASK_RUN_TIME,
            labels::TASK_ID => task_id.to_string(),
            labels::DATA_SOURCE => data_source.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        let metrics = RunnerMetrics::new();
        metrics.set_pending_count("default", 3);
        metrics.set_running_count("default", 1);
        metrics.set_slot_counts("default", 3, 2, 0, 0);
        metrics.observe_task_run_time("t1", "events", "SUCCESS", 12.5);
    }
}
