//! Per-session channel writer.
//!
//! In channelled mode a session never touches the canonical path. It writes
//! one entry per changed cell into its own subtree:
//!
//! ```text
//! world/o/w/users/{sessionId}/data/{cellKey} = {
//!     "value":     <cell value>,          // absent for tombstones
//!     "timestamp": {".sv": "timestamp"},  // resolved by the store
//!     "deleted":   false
//! }
//! ```
//!
//! The merger folds these entries into the canonical path. Direct mode
//! writes the pending diff straight onto the canonical path instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tessera_core::{escape_segment, WorldPath, WorldState};

use crate::config::WriteMode;
use crate::error::SyncError;
use crate::store::{server_timestamp, SharedStore};
use crate::tracker::LocalEditTracker;

/// One session's latest intent for one cell, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub deleted: bool,
}

impl ChannelEntry {
    pub fn value(value: Value, timestamp: u64) -> Self {
        Self {
            value,
            timestamp,
            deleted: false,
        }
    }

    pub fn tombstone(timestamp: u64) -> Self {
        Self {
            value: Value::Null,
            timestamp,
            deleted: true,
        }
    }

    /// Parse a stored entry. Malformed entries are skipped by the merger.
    pub fn from_snapshot(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let entry: ChannelEntry = serde_json::from_value(value.clone()).ok()?;
        // A value entry whose value was pruned away reads as a delete.
        if entry.value.is_null() && !entry.deleted {
            return Some(Self::tombstone(entry.timestamp));
        }
        Some(entry)
    }

    /// Write-side payload with a server timestamp placeholder.
    pub fn pending_write(value: Option<&Value>) -> Value {
        match value {
            Some(v) => json!({
                "value": v,
                "timestamp": server_timestamp(),
                "deleted": false,
            }),
            None => json!({
                "timestamp": server_timestamp(),
                "deleted": true,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No session identity (anonymous viewer).
    NoIdentity,
    ReadOnly,
    NothingPending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// The pending diff of `state` was written as `paths` store writes.
    Written { state: WorldState, paths: usize },
    Skipped(SkipReason),
    /// The store refused the write. Expected for viewers of another
    /// owner's world.
    Denied,
}

/// Writes a session's pending edits.
#[derive(Clone)]
pub struct ChannelWriter {
    store: SharedStore,
    world: WorldPath,
    session_id: Option<String>,
    mode: WriteMode,
    read_only: bool,
}

impl ChannelWriter {
    pub fn new(
        store: SharedStore,
        world: WorldPath,
        session_id: Option<String>,
        mode: WriteMode,
        read_only: bool,
    ) -> Self {
        Self {
            store,
            world,
            session_id,
            mode,
            read_only,
        }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Store path this writer targets.
    pub fn target(&self) -> Option<String> {
        let session_id = self.session_id.as_deref()?;
        Some(match self.mode {
            WriteMode::Direct => self.world.canonical(),
            WriteMode::Channelled => self.world.channel(session_id),
        })
    }

    /// Write the tracker's pending diff in one atomic update.
    ///
    /// Does not touch the tracker; on `Written` the caller marks the
    /// returned state as synced.
    pub async fn flush(&self, tracker: &LocalEditTracker) -> Result<FlushOutcome, SyncError> {
        if self.read_only {
            return Ok(FlushOutcome::Skipped(SkipReason::ReadOnly));
        }
        let Some(target) = self.target() else {
            return Ok(FlushOutcome::Skipped(SkipReason::NoIdentity));
        };

        let state = tracker.current().clone();
        let writes = self.build_writes(&target, &state, tracker.last_synced());
        if writes.is_empty() {
            return Ok(FlushOutcome::Skipped(SkipReason::NothingPending));
        }

        let paths = writes.len();
        match self.store.update(writes).await {
            Ok(()) => {
                log::trace!("Wrote {paths} paths under {target}");
                Ok(FlushOutcome::Written { state, paths })
            }
            Err(e) if e.is_permission_denied() => {
                log::debug!("Write to {target} denied, keeping edits local");
                Ok(FlushOutcome::Denied)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn build_writes(
        &self,
        target: &str,
        state: &WorldState,
        synced: &WorldState,
    ) -> BTreeMap<String, Value> {
        let pending = state.diff(synced);
        if pending.is_empty() {
            return BTreeMap::new();
        }
        match self.mode {
            WriteMode::Direct => pending.prefixed(target),
            WriteMode::Channelled => pending
                .touched_keys()
                .into_iter()
                .filter(|key| !key.is_empty())
                .map(|key| {
                    let path = format!("{target}/{}", escape_segment(&key));
                    (path, ChannelEntry::pending_write(state.get(&key)))
                })
                .collect(),
        }
    }
}
