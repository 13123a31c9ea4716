//! Append-only operation log: the single place idempotency is enforced.

use std::collections::HashMap;

use crate::operation::{OpId, Operation};

/// Every operation this replica has applied, in application order.
///
/// Entries are never evicted: late joiners are served from here and undo
/// targets are looked up here.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    ops: Vec<Operation>,
    index: HashMap<OpId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `op`. Returns `false` without touching the log when its id has
    /// been seen before.
    pub fn append(&mut self, op: Operation) -> bool {
        if self.index.contains_key(&op.op_id) {
            return false;
        }
        self.index.insert(op.op_id.clone(), self.ops.len());
        self.ops.push(op);
        true
    }

    pub fn contains(&self, op_id: &OpId) -> bool {
        self.index.contains_key(op_id)
    }

    pub fn get(&self, op_id: &OpId) -> Option<&Operation> {
        self.index.get(op_id).map(|&i| &self.ops[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn as_slice(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Highest counter logged for `site`.
    pub fn max_counter_for(&self, site: &str) -> Option<u64> {
        self.ops
            .iter()
            .filter(|op| op.op_id.site == site)
            .map(|op| op.op_id.counter)
            .max()
    }
}
