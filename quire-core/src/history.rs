//! Per-site undo/redo bookkeeping.
//!
//! Only this site's own plain edits are undoable. Undo records (operations
//! carrying `inverse_op_id`) never enter the history themselves; they mark
//! their target as undone instead, so an undo can never be undone as if it
//! were a fresh edit.

use std::collections::{HashMap, HashSet};

use crate::operation::{OpId, OpKind, OpPayload, Operation};
use crate::position::Position;

/// One undoable local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub op_id: OpId,
    pub kind: OpKind,
    pub position: Position,
    /// Inserted value, or the value the delete removed.
    pub value: char,
}

impl UndoEntry {
    /// The payload that reverses this entry at the same position.
    pub fn inverse_payload(&self) -> OpPayload {
        match self.kind {
            OpKind::Insert => OpPayload::Delete {
                position: self.position.clone(),
            },
            OpKind::Delete => OpPayload::Insert {
                position: self.position.clone(),
                value: self.value,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    entries: Vec<UndoEntry>,
    undone: HashSet<OpId>,
    redo_stack: Vec<OpId>,
    deleted_values: HashMap<OpId, char>,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied operation.
    ///
    /// `deleted_value` is the character a delete tombstoned, if it removed a
    /// live one. It is remembered for every operation, local or remote.
    pub fn record(&mut self, op: &Operation, from_self: bool, deleted_value: Option<char>) {
        if let Some(value) = deleted_value {
            self.deleted_values.insert(op.op_id.clone(), value);
        }
        if !from_self {
            return;
        }
        if let Some(target) = &op.inverse_op_id {
            self.undone.insert(target.clone());
            return;
        }

        let entry = match &op.payload {
            OpPayload::Insert { position, value } => UndoEntry {
                op_id: op.op_id.clone(),
                kind: OpKind::Insert,
                position: position.clone(),
                value: *value,
            },
            OpPayload::Delete { position } => {
                // A delete that removed nothing has nothing to restore.
                let Some(value) = deleted_value.or_else(|| self.deleted_values.get(&op.op_id).copied()) else {
                    return;
                };
                UndoEntry {
                    op_id: op.op_id.clone(),
                    kind: OpKind::Delete,
                    position: position.clone(),
                    value,
                }
            }
        };
        self.entries.push(entry);
    }

    /// Newest entry from `site` that has not been undone yet.
    pub fn last_undoable(&self, site: &str) -> Option<&UndoEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.op_id.site == site && !self.undone.contains(&e.op_id))
    }

    pub fn can_undo(&self, site: &str) -> bool {
        self.last_undoable(site).is_some()
    }

    /// Mark `op_id` undone and make it available for redo.
    pub fn mark_undone(&mut self, op_id: OpId) {
        self.undone.insert(op_id.clone());
        self.redo_stack.push(op_id);
    }

    pub fn is_undone(&self, op_id: &OpId) -> bool {
        self.undone.contains(op_id)
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn peek_redo(&self) -> Option<&OpId> {
        self.redo_stack.last()
    }

    pub fn pop_redo(&mut self) -> Option<OpId> {
        self.redo_stack.pop()
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub fn deleted_value(&self, op_id: &OpId) -> Option<char> {
        self.deleted_values.get(op_id).copied()
    }

    /// Remember what a delete removed, e.g. when replaying a redo.
    pub fn remember_deleted(&mut self, op_id: OpId, value: char) {
        self.deleted_values.insert(op_id, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
