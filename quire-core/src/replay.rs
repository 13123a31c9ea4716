//! Applies operations through the log's dedup filter.

use crate::oplog::OperationLog;
use crate::operation::{OpId, Operation};

/// Owns the operation log and gates every application through it.
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    log: OperationLog,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: OperationLog) -> Self {
        Self { log }
    }

    /// Run `apply` for `op` only if its id has not been applied before.
    pub fn apply_one<F>(&mut self, op: Operation, mut apply: F) -> bool
    where
        F: FnMut(&Operation),
    {
        if self.log.contains(&op.op_id) {
            return false;
        }
        apply(&op);
        self.log.append(op)
    }

    /// Apply a batch in input order, skipping anything already applied.
    /// Returns how many operations were new.
    pub fn replay_in_order<I, F>(&mut self, ops: I, mut apply: F) -> usize
    where
        I: IntoIterator<Item = Operation>,
        F: FnMut(&Operation),
    {
        let mut fresh = 0;
        for op in ops {
            if self.apply_one(op, &mut apply) {
                fresh += 1;
            }
        }
        fresh
    }

    /// Record an operation without running any callback.
    pub fn record(&mut self, op: Operation) -> bool {
        self.log.append(op)
    }

    pub fn contains(&self, op_id: &OpId) -> bool {
        self.log.contains(op_id)
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }
}
