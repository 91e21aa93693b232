//! Synchronous world-session state machine.
//!
//! ```text
//!          start_loading      first snapshot / timeout
//!   Idle ───────────────► Loading ─────────────────────► Synced
//!                                                        ▲   │ edit
//!                                        write landed,   │   ▼
//!                                        nothing pending │  Dirty
//!                                                        │   │ begin_save
//!                                                        │   ▼
//!                                                        └─ Saving ──► Dirty
//!                                                            (failed or newer edits)
//! ```
//!
//! The session task owns one machine and drives it from its event loop;
//! every transition here is synchronous and has no I/O.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{escape_segment, DiffPatch, WorldState};

use crate::channel::FlushOutcome;
use crate::error::SyncError;
use crate::history::HistoryManager;
use crate::reconciler::{Reconciled, Reconciler};
use crate::tracker::LocalEditTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    #[default]
    Idle,
    Loading,
    Synced,
    Dirty,
    Saving,
}

/// A local edit to the world.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEdit {
    Set { key: String, value: Value },
    Remove { key: String },
    /// Apply a batch of path writes.
    Patch(DiffPatch),
    Replace(WorldState),
}

/// What the loop should do after a save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFollowUp {
    None,
    /// More edits arrived, or the write failed: schedule another attempt.
    Retry,
}

#[derive(Debug, Clone)]
pub struct WorldMachine {
    tracker: LocalEditTracker,
    reconciler: Reconciler,
    history: HistoryManager,
    /// Last canonical snapshot as received
    canonical: WorldState,
    status: SyncStatus,
    error: Option<String>,
}

impl WorldMachine {
    pub fn new(max_history_states: usize) -> Self {
        Self {
            tracker: LocalEditTracker::new(),
            reconciler: Reconciler::new(),
            history: HistoryManager::new(max_history_states),
            canonical: WorldState::new(),
            status: SyncStatus::Idle,
            error: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn state(&self) -> &WorldState {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &LocalEditTracker {
        &self.tracker
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn is_loaded(&self) -> bool {
        self.reconciler.is_loaded()
    }

    pub fn has_pending(&self) -> bool {
        self.tracker.has_pending()
    }

    pub fn can_undo(&self) -> bool {
        self.is_loaded() && self.history.can_undo(self.tracker.current())
    }

    pub fn can_redo(&self) -> bool {
        self.is_loaded() && self.history.can_redo()
    }

    pub fn start_loading(&mut self) {
        if self.status == SyncStatus::Idle {
            self.status = SyncStatus::Loading;
        }
    }

    /// Reconcile a canonical snapshot. Cells other sessions changed are
    /// folded into history, so undo never reverts them.
    pub fn on_canonical(&mut self, incoming: WorldState) -> Reconciled {
        let remote = remote_changes(&incoming, &self.canonical, self.tracker.last_synced());
        self.canonical = incoming.clone();
        let outcome = self.reconciler.on_snapshot(&mut self.tracker, incoming);
        if outcome == Reconciled::Initial {
            self.history.seed(self.tracker.current().clone());
        } else {
            self.history.rebase(&remote);
        }
        self.settle_status();
        outcome
    }

    /// The initial snapshot never came. Returns true if loading was abandoned.
    pub fn on_load_timeout(&mut self) -> bool {
        if !self.reconciler.give_up_loading(&mut self.tracker) {
            return false;
        }
        self.history.seed(WorldState::new());
        self.settle_status();
        true
    }

    /// Apply a local edit. Returns true if the state changed.
    pub fn apply_edit(&mut self, edit: WorldEdit) -> bool {
        let before = self.tracker.current().clone();
        self.tracker.edit(|world| match edit {
            WorldEdit::Set { key, value } => {
                world.set(key, value);
            }
            WorldEdit::Remove { key } => {
                world.remove(&key);
            }
            WorldEdit::Patch(patch) => *world = world.patched(&patch),
            WorldEdit::Replace(state) => *world = state,
        });
        let changed = self.tracker.current() != &before;
        if changed {
            self.settle_status();
        }
        changed
    }

    /// Clear the world locally after the store accepted the clear.
    pub fn cleared(&mut self) {
        self.canonical = WorldState::new();
        self.tracker.adopt(WorldState::new(), WorldState::new());
        self.settle_status();
    }

    /// Whether a write should be attempted now.
    pub fn wants_save(&self) -> bool {
        self.is_loaded() && self.status != SyncStatus::Saving && self.tracker.has_pending()
    }

    pub fn begin_save(&mut self) {
        self.status = SyncStatus::Saving;
    }

    pub fn finish_save(&mut self, result: Result<FlushOutcome, SyncError>) -> SaveFollowUp {
        let follow_up = match result {
            Ok(FlushOutcome::Written { state, .. }) => {
                self.tracker.mark_synced(state);
                self.error = None;
                if self.tracker.has_pending() {
                    SaveFollowUp::Retry
                } else {
                    SaveFollowUp::None
                }
            }
            Ok(FlushOutcome::Skipped(_)) | Ok(FlushOutcome::Denied) => SaveFollowUp::None,
            Err(e) if e.is_permission_denied() => SaveFollowUp::None,
            Err(e) => {
                log::warn!("World write failed: {e}");
                self.error = Some(e.to_string());
                SaveFollowUp::Retry
            }
        };
        self.status = SyncStatus::Synced;
        self.settle_status();
        follow_up
    }

    /// Record the settled state into history.
    pub fn record_history(&mut self) -> bool {
        self.is_loaded() && self.history.record(self.tracker.current())
    }

    pub fn undo(&mut self) -> bool {
        if !self.is_loaded() {
            return false;
        }
        match self.history.undo(self.tracker.current()) {
            Some(frame) => self.restore(frame),
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        if !self.is_loaded() {
            return false;
        }
        match self.history.redo(self.tracker.current()) {
            Some(frame) => self.restore(frame),
            None => false,
        }
    }

    fn restore(&mut self, frame: WorldState) -> bool {
        self.tracker.replace_current(frame);
        self.settle_status();
        true
    }

    fn settle_status(&mut self) {
        if self.status == SyncStatus::Saving || !self.is_loaded() {
            return;
        }
        self.status = if self.tracker.has_pending() {
            SyncStatus::Dirty
        } else {
            SyncStatus::Synced
        };
    }
}

/// Cells that changed since the previous snapshot and are not the echo of a
/// value this session wrote.
fn remote_changes(incoming: &WorldState, previous: &WorldState, synced: &WorldState) -> DiffPatch {
    let keys: BTreeSet<&String> = incoming
        .iter()
        .chain(previous.iter())
        .map(|(key, _)| key)
        .collect();
    keys.into_iter()
        .filter(|key| incoming.get(key) != previous.get(key) && incoming.get(key) != synced.get(key))
        .map(|key| {
            let value = incoming.get(key).cloned().unwrap_or(Value::Null);
            (escape_segment(key).into_owned(), value)
        })
        .collect()
}
