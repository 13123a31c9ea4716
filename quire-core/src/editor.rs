//! Confirmed state plus a speculative overlay of pending local edits.
//!
//! ```text
//!   confirmed ──clone──▶ visible
//!                          ▲
//!   pending[0..n] ─────────┘  replayed in issuance order
//! ```

use crate::operation::{OpId, OpPayload, Operation};
use crate::position::Position;
use crate::sequence::SequenceStore;

/// Apply `op` to `store`. Returns the value a delete tombstoned, if the
/// target was live.
fn apply_op(store: &mut SequenceStore, op: &Operation) -> Option<char> {
    match &op.payload {
        OpPayload::Insert { position, value } => {
            store.apply_remote(position, *value, false);
            None
        }
        OpPayload::Delete { position } => match store.live_value(position) {
            Some(value) => {
                store.apply_remote(position, value, true);
                Some(value)
            }
            None => {
                store.delete(position);
                None
            }
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct EditorState {
    confirmed: SequenceStore,
    pending: Vec<Operation>,
    cursor: Option<Position>,
}

impl EditorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a copy of an existing store.
    pub fn with_confirmed(confirmed: &SequenceStore) -> Self {
        Self {
            confirmed: confirmed.clone(),
            ..Self::default()
        }
    }

    pub fn confirmed(&self) -> &SequenceStore {
        &self.confirmed
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    /// Fresh copy of confirmed with every pending op replayed on top.
    pub fn visible_state(&self) -> SequenceStore {
        let mut visible = self.confirmed.clone();
        for op in &self.pending {
            apply_op(&mut visible, op);
        }
        visible
    }

    pub fn visible_text(&self) -> String {
        self.visible_state().text()
    }

    pub fn apply_to_confirmed(&mut self, op: &Operation) -> Option<char> {
        apply_op(&mut self.confirmed, op)
    }

    pub fn push_pending(&mut self, op: Operation) {
        self.pending.push(op);
    }

    /// Drop the pending entry with `op_id`. Returns whether one was found.
    pub fn acknowledge(&mut self, op_id: &OpId) -> bool {
        match self.pending.iter().position(|op| op.op_id == *op_id) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn set_cursor(&mut self, position: Option<Position>) {
        self.cursor = position;
    }

    pub fn cursor(&self) -> Option<&Position> {
        self.cursor.as_ref()
    }

    /// Visible index of the cursor anchor, 0 when no cursor is set.
    pub fn cursor_index(&self) -> usize {
        match &self.cursor {
            Some(position) => self.visible_state().position_to_index(position),
            None => 0,
        }
    }
}
