//! Assignment planning: which pending task goes to which worker.
//!
//! Planning is a pure function over a cluster snapshot so it can be tested
//! without a store or a runtime. The coordinator takes the resulting plan
//! and publishes assignment nodes for each entry.
//!
//! Rules, applied per pending task in queue-insertion order:
//!
//! 1. Availability-group mutual exclusion across the cluster
//! 2. Category match between task and worker
//! 3. Residual capacity at least the task's required capacity
//! 4. Worker not blacklisted and not disabled
//! 5. Pluggable selection among eligible workers; the default picks the
//!    worker with the most idle capacity, tie-breaking by host

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::task::Task;
use crate::worker::WorkerSnapshot;

/// A pending task as seen by the planner.
#[derive(Debug, Clone)]
pub struct PendingTask {
    /// The task waiting for assignment.
    pub task: Task,
    /// When the task entered the pending queue.
    pub queue_insertion_time: DateTime<Utc>,
}

/// One planned assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAssignment {
    /// The task to assign.
    pub task_id: String,
    /// The chosen worker host.
    pub host: String,
}

/// An eligible worker with its remaining capacity during planning.
#[derive(Debug, Clone)]
pub struct WorkerCandidate {
    /// The worker host.
    pub host: String,
    /// The worker's category.
    pub category: String,
    /// Capacity not yet consumed by assignments, including ones planned
    /// earlier in the current pass.
    pub idle: u32,
}

/// Strategy for choosing among eligible workers.
pub trait WorkerSelectStrategy: Send + Sync + std::fmt::Debug {
    /// Picks a worker for `task` from `candidates`, or `None` to leave the
    /// task pending. Candidates have already passed the category, capacity,
    /// and blacklist checks.
    fn select<'a>(
        &self,
        task: &Task,
        candidates: &'a [WorkerCandidate],
    ) -> Option<&'a WorkerCandidate>;
}

/// Default strategy: spread load by picking the worker with the most idle
/// capacity, tie-breaking deterministically by host.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualDistributionStrategy;

impl WorkerSelectStrategy for EqualDistributionStrategy {
    fn select<'a>(
        &self,
        _task: &Task,
        candidates: &'a [WorkerCandidate],
    ) -> Option<&'a WorkerCandidate> {
        candidates
            .iter()
            .max_by(|a, b| a.idle.cmp(&b.idle).then(b.host.cmp(&a.host)))
    }
}

/// Plans one assignment pass.
///
/// `occupied_groups` holds availability groups of tasks already assigned or
/// running; the plan extends it as it reserves groups, so a single pass
/// never double-books a group. Workers in `blacklisted` or marked disabled
/// receive nothing.
pub fn plan_assignments(
    mut pending: Vec<PendingTask>,
    workers: &[WorkerSnapshot],
    blacklisted: &HashSet<String>,
    occupied_groups: &HashSet<String>,
    strategy: &dyn WorkerSelectStrategy,
) -> Vec<PlannedAssignment> {
    pending.sort_by(|a, b| {
        a.queue_insertion_time
            .cmp(&b.queue_insertion_time)
            .then_with(|| a.task.id.cmp(&b.task.id))
    });

    let mut candidates: Vec<WorkerCandidate> = workers
        .iter()
        .filter(|snapshot| {
            !snapshot.worker.is_disabled()
                && !snapshot.blacklisted
                && !blacklisted.contains(&snapshot.worker.host)
        })
        .map(|snapshot| WorkerCandidate {
            host: snapshot.worker.host.clone(),
            category: snapshot.worker.category.clone(),
            idle: snapshot.idle(),
        })
        .collect();
    candidates.sort_by(|a, b| a.host.cmp(&b.host));

    let mut occupied: HashSet<String> = occupied_groups.clone();
    let mut plan = Vec::new();

    for entry in pending {
        let group = &entry.task.resource.availability_group;
        if !group.is_empty() && occupied.contains(group) {
            continue;
        }

        let required = entry.task.resource.required_capacity;
        let eligible: Vec<WorkerCandidate> = candidates
            .iter()
            .filter(|candidate| {
                candidate.idle >= required
                    && entry
                        .task
                        .category
                        .as_ref()
                        .is_none_or(|category| candidate.category == *category)
            })
            .cloned()
            .collect();

        let Some(chosen) = strategy.select(&entry.task, &eligible) else {
            continue;
        };

        let host = chosen.host.clone();
        if let Some(candidate) = candidates.iter_mut().find(|c| c.host == host) {
            candidate.idle -= required;
        }
        if !group.is_empty() {
            occupied.insert(group.clone());
        }
        plan.push(PlannedAssignment {
            task_id: entry.task.id.clone(),
            host,
        });
    }

    plan
}
