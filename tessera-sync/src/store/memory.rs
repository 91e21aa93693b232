//! In-process real-time store.
//!
//! A [`MemoryStore`] owns the tree and the change feed; any number of
//! [`MemoryConnection`]s share it, each writing as its own [`Auth`]. The
//! WebSocket server uses the same store as its backend, so local tests and
//! remote clients observe identical semantics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::rules::{check_write, Auth};
use super::tree::{paths_overlap, StoreTree};
use super::{RealtimeStore, SharedStore, Snapshot, StoreError, StoreResult, Subscription};
use crate::feed::ChangeFeed;

struct Inner {
    tree: RwLock<StoreTree>,
    feed: ChangeFeed,
    injected_failures: Mutex<VecDeque<StoreError>>,
}

/// Shared in-memory store. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `capacity` is the change-feed buffer per subscription.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(StoreTree::new()),
                feed: ChangeFeed::new(capacity),
                injected_failures: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Open a connection writing as `auth`.
    pub fn connect(&self, auth: Auth) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
            auth,
        }
    }

    /// Connection bypassing access rules.
    pub fn admin(&self) -> MemoryConnection {
        self.connect(Auth::Service)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.inner.feed
    }

    /// Read a subtree directly.
    pub async fn snapshot(&self, path: &str) -> Snapshot {
        self.inner.tree.read().await.get(path)
    }

    /// Make the next `count` permitted writes fail with `error`.
    pub async fn fail_next_writes(&self, count: usize, error: StoreError) {
        let mut queue = self.inner.injected_failures.lock().await;
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Overwrite `path` as `auth`. Returns the written paths.
    pub async fn set_as(&self, auth: &Auth, path: &str, value: Value) -> StoreResult<Vec<String>> {
        check_write(auth, path)?;
        self.take_injected_failure().await?;

        let mut tree = self.inner.tree.write().await;
        let written = tree.set(path, value)?;
        self.inner.feed.publish(written.clone());
        Ok(written)
    }

    /// Atomic multi-path write as `auth`. Every path is checked before
    /// anything is applied.
    pub async fn update_as(
        &self,
        auth: &Auth,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<Vec<String>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        for path in values.keys() {
            check_write(auth, path)?;
        }
        self.take_injected_failure().await?;

        let mut tree = self.inner.tree.write().await;
        let written = tree.update(values)?;
        self.inner.feed.publish(written.clone());
        Ok(written)
    }

    /// [`MemoryStore::update_as`] applied only while every `expected` path
    /// holds its snapshot. `None` when a guard failed and nothing was
    /// written.
    pub async fn update_if_as(
        &self,
        auth: &Auth,
        expected: BTreeMap<String, Snapshot>,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<Option<Vec<String>>> {
        for path in values.keys() {
            check_write(auth, path)?;
        }
        self.take_injected_failure().await?;

        let mut tree = self.inner.tree.write().await;
        let written = tree.update_if(&expected, values)?;
        if let Some(paths) = &written {
            if !paths.is_empty() {
                self.inner.feed.publish(paths.clone());
            }
        }
        Ok(written)
    }

    /// Load persisted data without checks or timestamp resolution.
    pub async fn restore(&self, path: &str, value: Value) -> StoreResult<()> {
        let mut tree = self.inner.tree.write().await;
        tree.restore(path, value)?;
        self.inner.feed.publish(vec![path.trim_matches('/').to_string()]);
        Ok(())
    }

    /// Stream snapshots of `path`: the current one first, then one per
    /// overlapping write that changes it.
    pub fn watch(&self, path: &str) -> Subscription {
        let path = path.trim_matches('/').to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        // Subscribe before the initial read so no write slips between them.
        let mut changes = self.inner.feed.subscribe();
        let inner = self.inner.clone();
        let watched = path.clone();

        let handle = tokio::spawn(async move {
            let mut last = inner.tree.read().await.get(&watched);
            if tx.send(last.clone()).is_err() {
                return;
            }

            loop {
                let relevant = tokio::select! {
                    _ = tx.closed() => break,
                    batch = changes.recv() => match batch {
                        Ok(paths) => paths.iter().any(|p| paths_overlap(p, &watched)),
                        Err(RecvError::Lagged(skipped)) => {
                            inner.feed.record_lag(skipped);
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !relevant {
                    continue;
                }

                let current = inner.tree.read().await.get(&watched);
                if current != last {
                    last = current.clone();
                    if tx.send(current).is_err() {
                        break;
                    }
                }
            }
            log::trace!("Watcher for {watched} stopped");
        });

        Subscription::with_cancel(path, rx, move || handle.abort())
    }

    async fn take_injected_failure(&self) -> StoreResult<()> {
        match self.inner.injected_failures.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnection {
    store: MemoryStore,
    auth: Auth,
}

impl MemoryConnection {
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(self)
    }
}

#[async_trait]
impl RealtimeStore for MemoryConnection {
    async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        Ok(self.store.watch(path))
    }

    async fn get(&self, path: &str) -> StoreResult<Snapshot> {
        Ok(self.store.snapshot(path).await)
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        self.store.set_as(&self.auth, path, value).await.map(|_| ())
    }

    async fn update(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
        self.store.update_as(&self.auth, values).await.map(|_| ())
    }

    async fn update_if(
        &self,
        expected: BTreeMap<String, Snapshot>,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<bool> {
        let written = self.store.update_if_as(&self.auth, expected, values).await?;
        Ok(written.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(sub: &mut Subscription) -> Snapshot {
        timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("snapshot in time")
            .expect("subscription open")
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_then_changes() {
        let store = MemoryStore::new();
        let alice = store.connect(Auth::user("alice"));
        alice.set("world/alice/w/data/1,1", json!("a")).await.unwrap();

        let mut sub = alice.subscribe("world/alice/w/data").await.unwrap();
        assert_eq!(next(&mut sub).await, Some(json!({"1,1": "a"})));

        alice.set("world/alice/w/data/2,2", json!("b")).await.unwrap();
        assert_eq!(next(&mut sub).await, Some(json!({"1,1": "a", "2,2": "b"})));

        alice.set("world/alice/w/data", Value::Null).await.unwrap();
        assert_eq!(next(&mut sub).await, None);
    }

    #[tokio::test]
    async fn test_unrelated_writes_are_not_delivered() {
        let store = MemoryStore::new();
        let alice = store.connect(Auth::user("alice"));
        let mut sub = alice.subscribe("world/alice/w/data").await.unwrap();
        assert_eq!(next(&mut sub).await, None);

        alice.set("world/alice/w/settings", json!({"fontSize": 12})).await.unwrap();
        alice.set("world/alice/w/data/k", json!(1)).await.unwrap();
        assert_eq!(next(&mut sub).await, Some(json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_guest_denied_on_canonical() {
        let store = MemoryStore::new();
        let bob = store.connect(Auth::user("bob"));
        let err = bob.set("world/alice/w/data/k", json!(1)).await.unwrap_err();
        assert!(err.is_permission_denied());
        bob.set("world/alice/w/users/bob/data/k", json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_denied_if_any_path_denied() {
        let store = MemoryStore::new();
        let bob = store.connect(Auth::user("bob"));
        let mut writes = BTreeMap::new();
        writes.insert("world/alice/w/users/bob/data/k".to_string(), json!(1));
        writes.insert("world/alice/w/data/k".to_string(), json!(1));
        assert!(bob.update(writes).await.is_err());
        assert_eq!(store.snapshot("world").await, None);
    }

    #[tokio::test]
    async fn test_update_if_checks_rules_and_guards() {
        let store = MemoryStore::new();
        let alice = store.connect(Auth::user("alice"));
        let bob = store.connect(Auth::user("bob"));
        bob.set("world/alice/w/users/bob/data/k", json!(1)).await.unwrap();

        let mut writes = BTreeMap::new();
        writes.insert("world/alice/w/users/bob/data/k".to_string(), Value::Null);
        let stale = BTreeMap::from([("world/alice/w/users/bob/data/k".to_string(), Some(json!(0)))]);
        assert!(!alice.update_if(stale, writes.clone()).await.unwrap());
        assert!(store.snapshot("world/alice/w/users/bob").await.is_some());

        let current = BTreeMap::from([("world/alice/w/users/bob/data/k".to_string(), Some(json!(1)))]);
        let err = store
            .connect(Auth::user("carol"))
            .update_if(current.clone(), writes.clone())
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());

        assert!(alice.update_if(current, writes).await.unwrap());
        assert_eq!(store.snapshot("world/alice/w/users").await, None);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        let alice = store.connect(Auth::user("alice"));
        store
            .fail_next_writes(1, StoreError::Storage("disk full".into()))
            .await;

        let err = alice.set("world/alice/w/data/k", json!(1)).await.unwrap_err();
        assert_eq!(err, StoreError::Storage("disk full".into()));
        alice.set("world/alice/w/data/k", json!(1)).await.unwrap();
        assert_eq!(alice.get("world/alice/w/data/k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_watcher() {
        let store = MemoryStore::new();
        let sub = store.watch("a");
        tokio::task::yield_now().await;
        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.feed().stats().active_receivers, 0);
    }

    #[tokio::test]
    async fn test_restore_bypasses_rules() {
        let store = MemoryStore::new();
        store.restore("world/alice/w", json!({"data": {"k": 1}})).await.unwrap();
        assert_eq!(store.snapshot("world/alice/w/data/k").await, Some(json!(1)));
    }
}
