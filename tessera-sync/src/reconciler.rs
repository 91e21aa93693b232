//! Canonical snapshot reconciliation.
//!
//! ```text
//! incoming ──┬── first snapshot ──────────────► adopt verbatim
//!            ├── nothing pending ─────────────► adopt verbatim
//!            └── pending = diff(current, last_synced)
//!                          └──────────────────► patch(incoming, pending)
//! last_synced := incoming   (every case)
//! ```
//!
//! Local edits win over concurrently arriving remote edits to the same
//! keys; remote edits to untouched keys flow in.

use tessera_core::WorldState;

use crate::tracker::LocalEditTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// First snapshot for the world; adopted verbatim.
    Initial,
    /// No local edits were pending.
    Adopted,
    /// `pending` local paths were replayed on top of the snapshot.
    Rebased { pending: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    loaded: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the initial load has completed (or timed out).
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn on_snapshot(&mut self, tracker: &mut LocalEditTracker, incoming: WorldState) -> Reconciled {
        if !self.loaded {
            self.loaded = true;
            tracker.adopt(incoming.clone(), incoming);
            return Reconciled::Initial;
        }

        let pending = tracker.pending_diff();
        if pending.is_empty() {
            tracker.adopt(incoming.clone(), incoming);
            return Reconciled::Adopted;
        }

        let merged = incoming.patched(&pending);
        tracker.adopt(merged, incoming);
        Reconciled::Rebased {
            pending: pending.len(),
        }
    }

    /// Give up on the initial snapshot and start from an empty world.
    /// Returns false if the load already completed.
    pub fn give_up_loading(&mut self, tracker: &mut LocalEditTracker) -> bool {
        if self.loaded {
            return false;
        }
        self.loaded = true;
        tracker.adopt(WorldState::new(), WorldState::new());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn world(cells: &[(&str, serde_json::Value)]) -> WorldState {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_first_snapshot_adopted_verbatim() {
        let mut tracker = LocalEditTracker::new();
        let mut reconciler = Reconciler::new();
        tracker.edit(|w| w.set("early", json!(1)));

        let incoming = world(&[("remote", json!("r"))]);
        assert_eq!(reconciler.on_snapshot(&mut tracker, incoming.clone()), Reconciled::Initial);
        assert_eq!(tracker.current(), &incoming);
        assert!(reconciler.is_loaded());
    }

    #[test]
    fn test_adopt_when_nothing_pending() {
        let mut tracker = LocalEditTracker::new();
        let mut reconciler = Reconciler::new();
        reconciler.on_snapshot(&mut tracker, world(&[("a", json!(1))]));

        let incoming = world(&[("a", json!(2)), ("b", json!(3))]);
        assert_eq!(reconciler.on_snapshot(&mut tracker, incoming.clone()), Reconciled::Adopted);
        assert_eq!(tracker.current(), &incoming);
    }

    #[test]
    fn test_remote_update_never_erases_unsynced_local_value() {
        let mut tracker = LocalEditTracker::new();
        let mut reconciler = Reconciler::new();
        reconciler.on_snapshot(&mut tracker, world(&[("a", json!(1)), ("gone", json!(0))]));

        tracker.edit(|w| {
            w.set("mine", json!("local"));
            w.set("a", json!("local-a"));
            w.remove("gone");
        });

        let incoming = world(&[("a", json!("remote-a")), ("gone", json!(0)), ("theirs", json!("t"))]);
        let outcome = reconciler.on_snapshot(&mut tracker, incoming.clone());
        assert_eq!(outcome, Reconciled::Rebased { pending: 3 });

        let current = tracker.current();
        assert_eq!(current.get("mine"), Some(&json!("local")));
        assert_eq!(current.get("a"), Some(&json!("local-a")));
        assert_eq!(current.get("theirs"), Some(&json!("t")));
        assert!(!current.contains("gone"));
        assert_eq!(tracker.last_synced(), &incoming);
    }

    #[test]
    fn test_give_up_loading() {
        let mut tracker = LocalEditTracker::new();
        let mut reconciler = Reconciler::new();
        tracker.edit(|w| w.set("early", json!(1)));
        assert!(reconciler.give_up_loading(&mut tracker));
        assert!(tracker.current().is_empty());
        assert!(!reconciler.give_up_loading(&mut tracker));

        tracker.edit(|w| w.set("k", json!(1)));
        let outcome = reconciler.on_snapshot(&mut tracker, world(&[("r", json!(2))]));
        assert_eq!(outcome, Reconciled::Rebased { pending: 1 });
        assert_eq!(tracker.current().len(), 2);
    }
}
