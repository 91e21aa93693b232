//! Canonical merger: folds every session channel into the canonical path.
//!
//! ```text
//! users/s1/data/k = {value: "A", timestamp: 10}
//! users/s2/data/k = {deleted: true, timestamp: 12}     ──► data/k = null
//! users/s2/data/j = {value: "B", timestamp: 11}        ──► data/j = "B"
//! ```
//!
//! Winner per cell key: greatest timestamp; on an exact tie a tombstone
//! beats a value, then the greater session id wins. Each pass issues at
//! most one atomic update holding:
//!
//! - canonical cells whose merged value differs from what is stored
//! - nulls for winning tombstones and for every entry a winner superseded
//!
//! so channels stay bounded and a removed tombstone can never let an older
//! value resurface. A pass with nothing to change writes nothing.
//!
//! The update is guarded by what the pass read: if a session rewrites one
//! of the touched entries in between, nothing is written and the next pass
//! folds the newer entry.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tessera_core::{escape_segment, WorldPath};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::ChannelEntry;
use crate::config::WriteMode;
use crate::error::SyncError;
use crate::store::{SharedStore, Snapshot};

/// Winning entry for one cell key.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCell {
    pub session_id: String,
    pub entry: ChannelEntry,
}

/// Entry that lost to a newer one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Superseded {
    pub session_id: String,
    pub key: String,
}

/// Result of folding all channels of a world.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelFold {
    pub winners: BTreeMap<String, MergedCell>,
    pub superseded: Vec<Superseded>,
}

impl ChannelFold {
    /// Cells as they should appear in the canonical path.
    pub fn merged_cells(&self) -> Map<String, Value> {
        self.winners
            .iter()
            .filter(|(_, cell)| !cell.entry.deleted)
            .map(|(key, cell)| (key.clone(), cell.entry.value.clone()))
            .collect()
    }
}

/// Fold the `users` subtree of a world: `{sessionId: {data: {key: entry}}}`.
pub fn fold_channels(users: &Map<String, Value>) -> ChannelFold {
    let mut fold = ChannelFold::default();

    for (session_id, session) in users {
        let Some(Value::Object(cells)) = session.get("data") else {
            continue;
        };
        for (key, raw) in cells {
            let Some(entry) = ChannelEntry::from_snapshot(raw) else {
                log::warn!("Skipping malformed channel entry {session_id}/{key}");
                continue;
            };
            let candidate = MergedCell {
                session_id: session_id.clone(),
                entry,
            };

            match fold.winners.get_mut(key) {
                None => {
                    fold.winners.insert(key.clone(), candidate);
                }
                Some(current) => {
                    let loser = if beats(&candidate, current) {
                        std::mem::replace(current, candidate)
                    } else {
                        candidate
                    };
                    fold.superseded.push(Superseded {
                        session_id: loser.session_id,
                        key: key.clone(),
                    });
                }
            }
        }
    }

    fold.superseded.sort();
    fold
}

fn beats(a: &MergedCell, b: &MergedCell) -> bool {
    let order = a
        .entry
        .timestamp
        .cmp(&b.entry.timestamp)
        .then(a.entry.deleted.cmp(&b.entry.deleted))
        .then_with(|| a.session_id.cmp(&b.session_id));
    order == Ordering::Greater
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Direct or read-only mode.
    Disabled,
    NoSessions,
    /// Canonical already reflects every channel.
    Unchanged,
    Merged { cells: usize, cleaned: usize },
    /// The canonical write was refused (not the owner).
    Denied,
    /// A channel entry or canonical cell changed between read and write;
    /// nothing was written.
    Stale,
}

#[derive(Debug, Default)]
struct MergePlan {
    guards: BTreeMap<String, Snapshot>,
    writes: BTreeMap<String, Value>,
}

impl MergePlan {
    fn guard(&mut self, path: String, read: Snapshot, write: Value) {
        self.guards.insert(path.clone(), read);
        self.writes.insert(path, write);
    }
}

fn raw_entry(users: &Map<String, Value>, session_id: &str, key: &str) -> Snapshot {
    users.get(session_id)?.get("data")?.get(key).cloned()
}

/// Periodic reconciliation of all sessions of one world.
#[derive(Clone)]
pub struct CanonicalMerger {
    store: SharedStore,
    world: WorldPath,
    enabled: bool,
}

impl CanonicalMerger {
    pub fn new(store: SharedStore, world: WorldPath, mode: WriteMode, read_only: bool) -> Self {
        Self {
            store,
            world,
            enabled: mode == WriteMode::Channelled && !read_only,
        }
    }

    pub fn world(&self) -> &WorldPath {
        &self.world
    }

    /// One merge pass.
    pub async fn merge_once(&self) -> Result<MergeOutcome, SyncError> {
        if !self.enabled {
            return Ok(MergeOutcome::Disabled);
        }

        let users = match self.store.get(&self.world.users()).await? {
            Some(Value::Object(users)) if !users.is_empty() => users,
            _ => return Ok(MergeOutcome::NoSessions),
        };
        let canonical = match self.store.get(&self.world.canonical()).await? {
            Some(Value::Object(cells)) => cells,
            _ => Map::new(),
        };

        let fold = fold_channels(&users);
        let MergePlan { guards, writes } = self.plan(&fold, &users, &canonical);
        if writes.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }

        let canonical_prefix = format!("{}/", self.world.canonical());
        let cells = writes
            .keys()
            .filter(|p| p.starts_with(&canonical_prefix))
            .count();
        let cleaned = writes.len() - cells;

        match self.store.update_if(guards, writes).await {
            Ok(true) => {
                log::debug!("Merged {cells} cells into {} ({cleaned} channel entries cleaned)", self.world);
                Ok(MergeOutcome::Merged { cells, cleaned })
            }
            Ok(false) => {
                log::debug!("Channels of {} changed during merge, retrying next pass", self.world);
                Ok(MergeOutcome::Stale)
            }
            Err(e) if e.is_permission_denied() => {
                log::debug!("Merge into {} denied", self.world);
                Ok(MergeOutcome::Denied)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every written path is guarded by the value this pass read there, so
    /// an entry rewritten after the read is never nulled.
    fn plan(
        &self,
        fold: &ChannelFold,
        users: &Map<String, Value>,
        canonical: &Map<String, Value>,
    ) -> MergePlan {
        let canonical_root = self.world.canonical();
        let mut plan = MergePlan::default();

        for (key, cell) in &fold.winners {
            let stored = canonical.get(key).filter(|v| !v.is_null());
            let desired = (!cell.entry.deleted).then_some(&cell.entry.value);
            if stored != desired {
                plan.guard(
                    format!("{canonical_root}/{}", escape_segment(key)),
                    stored.cloned(),
                    desired.cloned().unwrap_or(Value::Null),
                );
                plan.guards.insert(
                    self.entry_path(&cell.session_id, key),
                    raw_entry(users, &cell.session_id, key),
                );
            }
            if cell.entry.deleted {
                plan.guard(
                    self.entry_path(&cell.session_id, key),
                    raw_entry(users, &cell.session_id, key),
                    Value::Null,
                );
            }
        }
        for loser in &fold.superseded {
            plan.guard(
                self.entry_path(&loser.session_id, &loser.key),
                raw_entry(users, &loser.session_id, &loser.key),
                Value::Null,
            );
        }
        plan
    }

    fn entry_path(&self, session_id: &str, key: &str) -> String {
        format!(
            "{}/{}",
            self.world.channel(session_id),
            escape_segment(key)
        )
    }
}

/// Run `merger` every `interval` on its own task until aborted.
pub fn spawn_merger(merger: CanonicalMerger, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Merger started for {} every {interval:?}", merger.world());
        loop {
            ticker.tick().await;
            match merger.merge_once().await {
                Ok(outcome) => log::trace!("Merge pass for {}: {outcome:?}", merger.world()),
                Err(e) => log::warn!("Merge pass for {} failed: {e}", merger.world()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Auth, MemoryStore, RealtimeStore, StoreError, StoreResult, Subscription};
    use serde_json::json;
    use std::sync::Mutex;

    fn users(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_newest_entry_wins() {
        let fold = fold_channels(&users(json!({
            "s1": {"data": {"k": {"value": "old", "timestamp": 1}}},
            "s2": {"data": {"k": {"value": "new", "timestamp": 2}}},
        })));
        assert_eq!(fold.merged_cells(), users(json!({"k": "new"})));
        assert_eq!(
            fold.superseded,
            vec![Superseded { session_id: "s1".into(), key: "k".into() }]
        );
    }

    #[test]
    fn test_newer_tombstone_beats_older_value() {
        let fold = fold_channels(&users(json!({
            "s1": {"data": {"k": {"value": "v", "timestamp": 5}}},
            "s2": {"data": {"k": {"deleted": true, "timestamp": 6}}},
        })));
        assert!(fold.merged_cells().is_empty());
        assert!(fold.winners["k"].entry.deleted);
    }

    #[test]
    fn test_newer_value_beats_older_tombstone() {
        let fold = fold_channels(&users(json!({
            "s1": {"data": {"k": {"deleted": true, "timestamp": 5}}},
            "s2": {"data": {"k": {"value": "back", "timestamp": 6}}},
        })));
        assert_eq!(fold.merged_cells(), users(json!({"k": "back"})));
    }

    #[test]
    fn test_exact_ties() {
        let fold = fold_channels(&users(json!({
            "z": {"data": {"k": {"value": "v", "timestamp": 5}}},
            "a": {"data": {"k": {"deleted": true, "timestamp": 5}}},
        })));
        assert!(fold.winners["k"].entry.deleted);

        let fold = fold_channels(&users(json!({
            "a": {"data": {"k": {"value": "from-a", "timestamp": 5}}},
            "b": {"data": {"k": {"value": "from-b", "timestamp": 5}}},
        })));
        assert_eq!(fold.merged_cells(), users(json!({"k": "from-b"})));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let a = fold_channels(&users(json!({
            "s1": {"data": {"k": {"value": 1, "timestamp": 3}, "j": {"value": 2, "timestamp": 1}}},
            "s2": {"data": {"k": {"value": 3, "timestamp": 3}, "j": {"deleted": true, "timestamp": 2}}},
            "s3": {"data": {"k": {"value": 4, "timestamp": 2}}},
        })));
        let b = fold_channels(&users(json!({
            "s3": {"data": {"k": {"value": 4, "timestamp": 2}}},
            "s2": {"data": {"k": {"value": 3, "timestamp": 3}, "j": {"deleted": true, "timestamp": 2}}},
            "s1": {"data": {"k": {"value": 1, "timestamp": 3}, "j": {"value": 2, "timestamp": 1}}},
        })));
        assert_eq!(a, b);
        assert_eq!(a.merged_cells(), users(json!({"k": 3})));
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let fold = fold_channels(&users(json!({
            "s1": {"data": {"k": "not-an-entry", "j": {"value": 1, "timestamp": 1}}},
            "s2": {"other": true},
        })));
        assert_eq!(fold.merged_cells(), users(json!({"j": 1})));
    }

    async fn seeded() -> (MemoryStore, CanonicalMerger) {
        let store = MemoryStore::new();
        let world = WorldPath::new("alice", "w1").unwrap();
        let merger = CanonicalMerger::new(
            store.connect(Auth::user("alice")).into_shared(),
            world,
            WriteMode::Channelled,
            false,
        );
        (store, merger)
    }

    #[tokio::test]
    async fn test_merge_writes_then_idles() {
        let (store, merger) = seeded().await;
        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::NoSessions);

        store
            .set_as(
                &Auth::user("bob"),
                "world/alice/w1/users/bob/data/5,10",
                ChannelEntry::pending_write(Some(&json!("X"))),
            )
            .await
            .unwrap();

        assert_eq!(
            merger.merge_once().await.unwrap(),
            MergeOutcome::Merged { cells: 1, cleaned: 0 }
        );
        assert_eq!(
            store.snapshot("world/alice/w1/data").await,
            Some(json!({"5,10": "X"}))
        );

        let published = store.feed().stats().batches_published;
        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::Unchanged);
        assert_eq!(store.feed().stats().batches_published, published);
    }

    #[tokio::test]
    async fn test_tombstone_cleanup_removes_superseded_entries() {
        let (store, merger) = seeded().await;
        store
            .restore(
                "world/alice/w1",
                json!({
                    "data": {"k": "old"},
                    "users": {
                        "s1": {"data": {"k": {"value": "old", "timestamp": 1}}},
                        "s2": {"data": {"k": {"deleted": true, "timestamp": 2}}},
                    }
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            merger.merge_once().await.unwrap(),
            MergeOutcome::Merged { cells: 1, cleaned: 2 }
        );
        assert_eq!(store.snapshot("world/alice/w1/data").await, None);
        assert_eq!(store.snapshot("world/alice/w1/users").await, None);
        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::NoSessions);
    }

    /// Lands one queued session write between a pass's read and its update.
    struct Interleaved {
        inner: SharedStore,
        writer: SharedStore,
        queued: Mutex<Option<(String, Value)>>,
    }

    #[async_trait::async_trait]
    impl RealtimeStore for Interleaved {
        async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
            self.inner.subscribe(path).await
        }
        async fn get(&self, path: &str) -> StoreResult<Snapshot> {
            self.inner.get(path).await
        }
        async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
            self.inner.set(path, value).await
        }
        async fn update(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
            self.inner.update(values).await
        }
        async fn update_if(
            &self,
            expected: BTreeMap<String, Snapshot>,
            values: BTreeMap<String, Value>,
        ) -> StoreResult<bool> {
            let queued = self.queued.lock().unwrap().take();
            if let Some((path, value)) = queued {
                self.writer.set(&path, value).await?;
            }
            self.inner.update_if(expected, values).await
        }
    }

    #[tokio::test]
    async fn test_entry_rewritten_during_pass_is_kept() {
        let store = MemoryStore::new();
        store
            .restore(
                "world/alice/w1",
                json!({
                    "data": {"k": "old"},
                    "users": {
                        "bob": {"data": {"k": {"value": "old", "timestamp": 1}}},
                        "carol": {"data": {"k": {"value": "carol", "timestamp": 2}}},
                    }
                }),
            )
            .await
            .unwrap();
        let interleaved = Interleaved {
            inner: store.connect(Auth::user("alice")).into_shared(),
            writer: store.connect(Auth::user("bob")).into_shared(),
            queued: Mutex::new(Some((
                "world/alice/w1/users/bob/data/k".to_string(),
                ChannelEntry::pending_write(Some(&json!("bob-new"))),
            ))),
        };
        let merger = CanonicalMerger::new(
            std::sync::Arc::new(interleaved),
            WorldPath::new("alice", "w1").unwrap(),
            WriteMode::Channelled,
            false,
        );

        // The pass planned to drop bob's superseded entry; bob rewrote it first.
        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::Stale);
        assert_eq!(store.snapshot("world/alice/w1/data/k").await, Some(json!("old")));
        assert_eq!(
            store.snapshot("world/alice/w1/users/bob/data/k/value").await,
            Some(json!("bob-new"))
        );

        assert_eq!(
            merger.merge_once().await.unwrap(),
            MergeOutcome::Merged { cells: 1, cleaned: 1 }
        );
        assert_eq!(store.snapshot("world/alice/w1/data/k").await, Some(json!("bob-new")));
        assert_eq!(store.snapshot("world/alice/w1/users/carol").await, None);
    }

    #[tokio::test]
    async fn test_value_written_over_consumed_tombstone_is_merged() {
        let store = MemoryStore::new();
        store
            .restore(
                "world/alice/w1",
                json!({
                    "data": {"k": "old"},
                    "users": {"bob": {"data": {"k": {"deleted": true, "timestamp": 3}}}}
                }),
            )
            .await
            .unwrap();
        let merger = CanonicalMerger::new(
            std::sync::Arc::new(Interleaved {
                inner: store.connect(Auth::user("alice")).into_shared(),
                writer: store.connect(Auth::user("bob")).into_shared(),
                queued: Mutex::new(Some((
                    "world/alice/w1/users/bob/data/k".to_string(),
                    ChannelEntry::pending_write(Some(&json!("new"))),
                ))),
            }),
            WorldPath::new("alice", "w1").unwrap(),
            WriteMode::Channelled,
            false,
        );

        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::Stale);
        assert!(matches!(merger.merge_once().await.unwrap(), MergeOutcome::Merged { .. }));
        assert_eq!(store.snapshot("world/alice/w1/data/k").await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_non_owner_merge_denied() {
        let store = MemoryStore::new();
        store
            .restore(
                "world/alice/w1/users/bob/data/k",
                json!({"value": 1, "timestamp": 1}),
            )
            .await
            .unwrap();
        let merger = CanonicalMerger::new(
            store.connect(Auth::user("bob")).into_shared(),
            WorldPath::new("alice", "w1").unwrap(),
            WriteMode::Channelled,
            false,
        );
        assert_eq!(merger.merge_once().await.unwrap(), MergeOutcome::Denied);
    }

    #[tokio::test]
    async fn test_merge_failure_is_error() {
        let (store, merger) = seeded().await;
        store
            .restore(
                "world/alice/w1/users/bob/data/k",
                json!({"value": 1, "timestamp": 1}),
            )
            .await
            .unwrap();
        store.fail_next_writes(1, StoreError::Storage("boom".into())).await;
        assert!(merger.merge_once().await.is_err());
        assert!(matches!(
            merger.merge_once().await.unwrap(),
            MergeOutcome::Merged { .. }
        ));
    }

    #[tokio::test]
    async fn test_disabled_modes() {
        let store = MemoryStore::new();
        let world = WorldPath::new("alice", "w1").unwrap();
        let conn = store.connect(Auth::user("alice")).into_shared();
        let direct = CanonicalMerger::new(conn.clone(), world.clone(), WriteMode::Direct, false);
        let read_only = CanonicalMerger::new(conn, world, WriteMode::Channelled, true);
        assert_eq!(direct.merge_once().await.unwrap(), MergeOutcome::Disabled);
        assert_eq!(read_only.merge_once().await.unwrap(), MergeOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_spawned_merger_runs_periodically() {
        let (store, merger) = seeded().await;
        let handle = spawn_merger(merger, Duration::from_millis(10));
        store
            .set_as(
                &Auth::user("bob"),
                "world/alice/w1/users/bob/data/k",
                ChannelEntry::pending_write(Some(&json!("v"))),
            )
            .await
            .unwrap();

        let mut merged = None;
        for _ in 0..50 {
            merged = store.snapshot("world/alice/w1/data/k").await;
            if merged.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(merged, Some(json!("v")));
    }
}
