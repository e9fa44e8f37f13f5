//! In-memory coordination store for testing and development.
//!
//! This module provides [`InMemoryCoordStore`], an implementation of the
//! [`CoordStore`] trait backed by a process-local map.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries
//!
//! Beyond the trait surface, the store can simulate a session break
//! ([`InMemoryCoordStore::break_session`]) to exercise the runner's
//! reconnection path, and can create data-less nodes
//! ([`InMemoryCoordStore::create_empty`]) to exercise watchers' null-data
//! handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::{
    ChildEvent, ChildNode, ChildWatch, CoordStore, NodeEvent, NodePersistence, NodeWatch,
    SessionEvent,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct NodeRecord {
    data: Option<Bytes>,
    persistence: NodePersistence,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, NodeRecord>,
    child_watches: HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>,
    node_watches: HashMap<String, Vec<mpsc::UnboundedSender<NodeEvent>>>,
}

/// In-memory coordination store.
///
/// Intermediate path levels are implicit: creating `/status/w1/t1` makes
/// `t1` visible under `children("/status/w1")` without an explicit
/// `/status/w1` node.
#[derive(Debug)]
pub struct InMemoryCoordStore {
    inner: RwLock<Inner>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(Error::store(format!("invalid store path '{path}'")));
    }
    Ok(())
}

impl Inner {
    fn notify_children(&mut self, parent: &str, event: &ChildEvent) {
        if let Some(senders) = self.child_watches.get_mut(parent) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn notify_node(&mut self, path: &str, event: &NodeEvent) {
        if let Some(senders) = self.node_watches.get_mut(path) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Direct children of `path`, including implicit intermediate levels.
    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                let first = rest.split('/').next().unwrap_or_default();
                (!first.is_empty()).then(|| first.to_string())
            })
            .collect();
        names.dedup();
        names
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        let event = ChildEvent::Removed {
            path: path.to_string(),
        };
        self.notify_children(parent_of(path), &event);
        self.notify_node(path, &NodeEvent::Deleted);
    }
}

impl InMemoryCoordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            inner: RwLock::new(Inner::default()),
            session_tx,
        }
    }

    /// Creates a node with no data, for exercising null-data handling.
    ///
    /// # Errors
    ///
    /// Returns a store error when the node already exists.
    pub fn create_empty(&self, path: &str, persistence: NodePersistence) -> Result<()> {
        validate_path(path)?;
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.nodes.contains_key(path) {
            return Err(Error::store(format!("node already exists: {path}")));
        }
        inner.nodes.insert(
            path.to_string(),
            NodeRecord {
                data: None,
                persistence,
            },
        );
        let event = ChildEvent::Added {
            path: path.to_string(),
            data: None,
        };
        inner.notify_children(parent_of(path), &event);
        Ok(())
    }

    /// Simulates a session break: drops every ephemeral node and emits
    /// [`SessionEvent::Lost`].
    ///
    /// # Errors
    ///
    /// Returns a store error when internal state is poisoned.
    pub fn break_session(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let ephemeral: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, record)| record.persistence == NodePersistence::Ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemeral {
            inner.remove_node(&path);
        }
        drop(inner);
        let _ = self.session_tx.send(SessionEvent::Lost);
        Ok(())
    }

    /// Simulates a session re-establishment: emits [`SessionEvent::Restored`].
    pub fn restore_session(&self) {
        let _ = self.session_tx.send(SessionEvent::Restored);
    }

    /// Returns the number of nodes currently stored.
    ///
    /// # Errors
    ///
    /// Returns a store error when internal state is poisoned.
    pub fn node_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.nodes.len())
    }
}

#[async_trait]
impl CoordStore for InMemoryCoordStore {
    async fn create(&self, path: &str, data: Bytes, persistence: NodePersistence) -> Result<()> {
        validate_path(path)?;
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.nodes.contains_key(path) {
            return Err(Error::store(format!("node already exists: {path}")));
        }
        inner.nodes.insert(
            path.to_string(),
            NodeRecord {
                data: Some(data.clone()),
                persistence,
            },
        );
        let event = ChildEvent::Added {
            path: path.to_string(),
            data: Some(data),
        };
        inner.notify_children(parent_of(path), &event);
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(record) = inner.nodes.get_mut(path) else {
            return Err(Error::store(format!("node does not exist: {path}")));
        };
        record.data = Some(data.clone());
        let event = ChildEvent::Updated {
            path: path.to_string(),
            data: Some(data.clone()),
        };
        inner.notify_children(parent_of(path), &event);
        inner.notify_node(path, &NodeEvent::DataChanged { data: Some(data) });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.remove_node(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.nodes.get(path).and_then(|record| record.data.clone()))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.child_names(path))
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let prefix = format!("{path}/");
        let initial = inner
            .child_names(path)
            .into_iter()
            .map(|name| {
                let full = format!("{prefix}{name}");
                let data = inner.nodes.get(&full).and_then(|record| record.data.clone());
                ChildNode { path: full, data }
            })
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(ChildWatch {
            initial,
            events: rx,
        })
    }

    async fn watch_node(&self, path: &str) -> Result<NodeWatch> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let initial = inner.nodes.get(path).and_then(|record| record.data.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .node_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(NodeWatch {
            initial,
            events: rx,
        })
    }

    fn watch_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}
