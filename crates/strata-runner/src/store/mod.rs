//! Coordination-store adapter.
//!
//! This module provides:
//!
//! - [`CoordStore`]: Typed facade over the external hierarchical,
//!   watchable key-value service
//! - [`ChildEvent`] / [`NodeEvent`] / [`SessionEvent`]: the event surface
//!   watchers observe
//! - [`with_backoff`]: capped exponential retry for transient store errors
//!
//! ## Design Principles
//!
//! - **Ephemeral announcements**: worker announcements vanish with the
//!   worker's session; assignment and status nodes are persistent
//! - **Coarse session signal**: session loss is surfaced as a single
//!   [`SessionEvent::Lost`]; subscribers re-enumerate children on restore
//!   rather than reasoning about partial write visibility
//! - **Testability**: [`memory::InMemoryCoordStore`] implements the full
//!   surface, including session-loss simulation

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// Whether a node survives the creating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePersistence {
    /// Deleted automatically when the creating session dies.
    Ephemeral,
    /// Survives until explicitly deleted.
    Persistent,
}

/// A child node observed when a watch is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    /// Full path of the child.
    pub path: String,
    /// Node data; `None` models a data-less node, which watchers must
    /// tolerate without failing.
    pub data: Option<Bytes>,
}

/// A change to the children of a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// A child appeared.
    Added {
        /// Full path of the child.
        path: String,
        /// Node data at creation, if any.
        data: Option<Bytes>,
    },
    /// A child's data changed.
    Updated {
        /// Full path of the child.
        path: String,
        /// The new data, if any.
        data: Option<Bytes>,
    },
    /// A child disappeared.
    Removed {
        /// Full path of the child.
        path: String,
    },
}

impl ChildEvent {
    /// Returns the full path the event refers to.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Added { path, .. } | Self::Updated { path, .. } | Self::Removed { path } => path,
        }
    }
}

/// A change to a single watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node's data changed.
    DataChanged {
        /// The new data, if any.
        data: Option<Bytes>,
    },
    /// The node was deleted.
    Deleted,
}

/// Session-level events, delivered to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session to the store was lost. Ephemeral nodes created through
    /// it are gone; watch state may be stale.
    Lost,
    /// A fresh session was established. Subscribers must re-enumerate the
    /// children they care about.
    Restored,
}

/// An active children watch: the snapshot taken at registration plus a feed
/// of subsequent changes.
#[derive(Debug)]
pub struct ChildWatch {
    /// Children present when the watch was registered.
    pub initial: Vec<ChildNode>,
    /// Changes observed after registration, in store order.
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

/// An active single-node watch.
#[derive(Debug)]
pub struct NodeWatch {
    /// Data present when the watch was registered, if the node existed.
    pub initial: Option<Bytes>,
    /// Changes observed after registration, in store order.
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
}

/// Typed facade over the external hierarchical coordination store.
///
/// Paths are `/`-separated. Events from one watch are delivered in store
/// order; no ordering holds across watches.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// runner's loops.
#[async_trait]
pub trait CoordStore: Send + Sync + std::fmt::Debug {
    /// Creates a node at `path` with `data`.
    ///
    /// # Errors
    ///
    /// Returns a store error when the node already exists or the operation
    /// fails.
    async fn create(&self, path: &str, data: Bytes, persistence: NodePersistence) -> Result<()>;

    /// Replaces the data of an existing node.
    ///
    /// # Errors
    ///
    /// Returns a store error when the node does not exist.
    async fn set_data(&self, path: &str, data: Bytes) -> Result<()>;

    /// Deletes the node at `path`. Deleting a missing node is a no-op.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Returns true when a node exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns the data at `path`, or `None` when the node is missing.
    async fn get_data(&self, path: &str) -> Result<Option<Bytes>>;

    /// Returns the names of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Registers a children watch on `path`.
    async fn watch_children(&self, path: &str) -> Result<ChildWatch>;

    /// Registers a data watch on a single node.
    async fn watch_node(&self, path: &str) -> Result<NodeWatch>;

    /// Subscribes to session-level events.
    fn watch_session(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Maximum attempts for [`with_backoff`].
const MAX_ATTEMPTS: usize = 5;
/// Ceiling on the per-attempt backoff.
const MAX_BACKOFF_MS: u64 = 2_000;

/// Retries a transient store operation with capped exponential backoff.
///
/// # Errors
///
/// Returns the final error once attempts are exhausted.
pub async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS => {
                let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
                let backoff_ms = 50_u64
                    .saturating_mul(2_u64.saturating_pow(exponent))
                    .min(MAX_BACKOFF_MS);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    error = %err,
                    backoff_ms,
                    "transient store error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
