//! # strata-runner
//!
//! Remote task runner for the Strata ingestion control plane.
//!
//! This crate implements the supervisor that assigns pending
//! indexing/compaction tasks to a pool of heterogeneous, autoscalable
//! workers through a hierarchical coordination store, providing:
//!
//! - **Worker tracking**: membership via ephemeral announcement nodes,
//!   with a grace window before a vanished worker's tasks are failed
//! - **Assignment**: capacity-, category-, and availability-group-aware
//!   placement with a pluggable selection strategy
//! - **Lifecycle**: a monotonic per-task state machine driven by per-worker
//!   status watches, exposed to callers as an awaitable result handle
//! - **Blacklisting**: consecutive-failure suspension with a cluster-wide
//!   cap and timed re-admission
//! - **Recovery**: restart-time rehydration from whatever assignment and
//!   status nodes exist in the store
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_core::clock::SystemClock;
//! use strata_runner::config::RunnerConfig;
//! use strata_runner::error::Result;
//! use strata_runner::reports::HttpReportClient;
//! use strata_runner::runner::RemoteTaskRunner;
//! use strata_runner::store::memory::InMemoryCoordStore;
//! use strata_runner::task::{Task, TaskResource};
//!
//! # async fn example() -> Result<()> {
//! let runner = RemoteTaskRunner::new(
//!     RunnerConfig::from_env()?,
//!     Arc::new(InMemoryCoordStore::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(HttpReportClient::new()?),
//! );
//! runner.start().await?;
//!
//! let task = Task::new("compact-events-01", TaskResource::new("events-group", 1), "events");
//! let status = runner.run(task).wait().await?;
//! println!("task finished: {:?}", status.code);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod assign;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod reports;
pub mod runner;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::assign::{EqualDistributionStrategy, WorkerSelectStrategy};
    pub use crate::blacklist::{BlacklistController, BlacklistEntry};
    pub use crate::config::RunnerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::RunnerMetrics;
    pub use crate::reports::{HttpReportClient, ReportClient, ReportStream};
    pub use crate::runner::RemoteTaskRunner;
    pub use crate::store::{ChildEvent, CoordStore, NodePersistence, SessionEvent};
    pub use crate::task::{Task, TaskResource, TaskResultHandle, TaskState, TaskStatus, TaskStatusCode};
    pub use crate::worker::{TaskLocation, Worker, WorkerSnapshot};
}
