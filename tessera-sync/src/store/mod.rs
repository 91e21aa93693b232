//! Backing-store abstraction.
//!
//! The engine talks to its durable store only through [`RealtimeStore`]:
//!
//! ```text
//! subscribe(path) ──► stream of whole-subtree snapshots on change
//! get(path)       ──► one-shot snapshot
//! set(path, v)    ──► overwrite whole subtree (null removes)
//! update(map)     ──► atomic multi-path write (null removes)
//! update_if(e, m) ──► update(m) only while every path in e is unchanged
//! ```
//!
//! Two implementations ship with the crate: [`MemoryConnection`] (an
//! in-process store, also the server's backend) and
//! [`crate::client::RemoteStore`] (WebSocket client for [`crate::server`]).

pub mod memory;
pub mod rules;
pub mod tree;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryConnection, MemoryStore};
pub use rules::{check_write, Auth};
pub use tree::{paths_overlap, server_timestamp, ServerClock, StoreTree, SERVER_VALUE_KEY};

/// Whole-subtree value at a path; `None` when nothing is stored there.
pub type Snapshot = Option<Value>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle used by every engine component.
pub type SharedStore = Arc<dyn RealtimeStore>;

/// Store failures. Travels over the wire as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("request timed out")]
    Timeout,
    #[error("store connection closed")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied { .. })
    }
}

/// Real-time tree store.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Subscribe to a path. The current snapshot is delivered first.
    async fn subscribe(&self, path: &str) -> StoreResult<Subscription>;

    async fn get(&self, path: &str) -> StoreResult<Snapshot>;

    async fn set(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Apply all writes atomically. Paths must not overlap.
    async fn update(&self, values: BTreeMap<String, Value>) -> StoreResult<()>;

    /// Like [`RealtimeStore::update`], applied only if every `expected`
    /// path still holds exactly the given snapshot. Returns `false`, having
    /// written nothing, when one of them has changed.
    async fn update_if(
        &self,
        expected: BTreeMap<String, Snapshot>,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<bool>;
}

/// Stream of snapshots for one path. Dropping it unsubscribes.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self {
            path: path.into(),
            rx,
            on_drop: None,
        }
    }

    /// Like [`Subscription::new`], running `cancel` when dropped.
    pub fn with_cancel(
        path: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            rx,
            on_drop: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next snapshot, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Non-blocking poll, used by tests.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_drop.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("path", &self.path).finish()
    }
}
