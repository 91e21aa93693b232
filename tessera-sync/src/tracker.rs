//! Local edit tracking.
//!
//! ```text
//!   last_synced ──diff──► pending_diff ◄──diff── current
//!        ▲                                         │
//!        └────────── mark_synced(written) ◄────────┘
//! ```
//!
//! Edits touch only `current`. `last_synced` moves when a write lands or a
//! remote snapshot is reconciled.

use tessera_core::{DiffPatch, WorldState};

#[derive(Debug, Clone, Default)]
pub struct LocalEditTracker {
    current: WorldState,
    last_synced: WorldState,
}

impl LocalEditTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &WorldState {
        &self.current
    }

    pub fn last_synced(&self) -> &WorldState {
        &self.last_synced
    }

    /// Mutate the current state.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut WorldState) -> R) -> R {
        f(&mut self.current)
    }

    /// Replace the current state wholesale (undo/redo, replace).
    pub fn replace_current(&mut self, state: WorldState) {
        self.current = state;
    }

    /// Edits not yet acknowledged by the store.
    pub fn pending_diff(&self) -> DiffPatch {
        self.current.diff(&self.last_synced)
    }

    pub fn has_pending(&self) -> bool {
        self.current != self.last_synced
    }

    /// Record that `written` reached the store.
    pub fn mark_synced(&mut self, written: WorldState) {
        self.last_synced = written;
    }

    /// Take over a reconciled pair.
    pub fn adopt(&mut self, current: WorldState, synced: WorldState) {
        self.current = current;
        self.last_synced = synced;
    }
}
