//! Bounded undo/redo over whole-world frames.
//!
//! The top of the undo stack is the last settled state. `record` pushes a
//! new frame when the settled state differs from it; `undo`/`redo` hand
//! back the frame to restore and remember it so that restoring it is not
//! recorded as a fresh edit.
//!
//! Changes that arrive from other sessions are folded into every frame by
//! [`HistoryManager::rebase`], so undo and redo only move local edits.

use std::collections::VecDeque;

use tessera_core::{DiffPatch, WorldState};

#[derive(Debug, Clone)]
pub struct HistoryManager {
    undo: VecDeque<WorldState>,
    redo: VecDeque<WorldState>,
    cap: usize,
    suppressed: Option<WorldState>,
}

impl HistoryManager {
    pub fn new(cap: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            cap: cap.max(1),
            suppressed: None,
        }
    }

    /// Reset both stacks to a single frame.
    pub fn seed(&mut self, state: WorldState) {
        self.undo.clear();
        self.redo.clear();
        self.suppressed = None;
        self.undo.push_back(state);
    }

    /// Record a settled state. Returns true when a frame was pushed.
    pub fn record(&mut self, state: &WorldState) -> bool {
        if let Some(restored) = self.suppressed.take() {
            if &restored == state {
                return false;
            }
        }
        if self.undo.back() == Some(state) {
            return false;
        }
        push_capped(&mut self.undo, state.clone(), self.cap);
        self.redo.clear();
        true
    }

    /// Frame to restore, given the live state.
    ///
    /// Unsettled edits are undone first (back to the last frame); otherwise
    /// the previous frame is restored.
    pub fn undo(&mut self, current: &WorldState) -> Option<WorldState> {
        let top = self.undo.back()?.clone();
        let restored = if &top != current {
            push_capped(&mut self.redo, current.clone(), self.cap);
            top
        } else if self.undo.len() >= 2 {
            let popped = self.undo.pop_back()?;
            push_capped(&mut self.redo, popped, self.cap);
            self.undo.back()?.clone()
        } else {
            return None;
        };
        self.suppressed = Some(restored.clone());
        Some(restored)
    }

    /// Frame to restore, given the live state. Unsettled edits since the
    /// last undo count as a new edit and discard the redo stack.
    pub fn redo(&mut self, current: &WorldState) -> Option<WorldState> {
        if self.undo.back().is_some_and(|top| top != current) {
            self.redo.clear();
            return None;
        }
        let frame = self.redo.pop_back()?;
        push_capped(&mut self.undo, frame.clone(), self.cap);
        self.suppressed = Some(frame.clone());
        Some(frame)
    }

    /// Apply a remote change to every frame. Neighbouring frames that end
    /// up equal collapse into one.
    pub fn rebase(&mut self, remote: &DiffPatch) {
        if remote.is_empty() {
            return;
        }
        for frame in self.undo.iter_mut().chain(self.redo.iter_mut()) {
            *frame = frame.patched(remote);
        }
        if let Some(restored) = self.suppressed.as_mut() {
            *restored = restored.patched(remote);
        }
        collapse(&mut self.undo);
        collapse(&mut self.redo);
    }

    pub fn can_undo(&self, current: &WorldState) -> bool {
        match self.undo.back() {
            Some(top) => top != current || self.undo.len() >= 2,
            None => false,
        }
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }
}

fn collapse(stack: &mut VecDeque<WorldState>) {
    let mut kept = VecDeque::with_capacity(stack.len());
    for frame in stack.drain(..) {
        if kept.back() != Some(&frame) {
            kept.push_back(frame);
        }
    }
    *stack = kept;
}

fn push_capped(stack: &mut VecDeque<WorldState>, frame: WorldState, cap: usize) {
    stack.push_back(frame);
    while stack.len() > cap {
        stack.pop_front();
    }
}
