//! Operations: the unit of replication.
//!
//! Wire shape (JSON):
//! ```text
//! { "type": "insert", "docId": "d1", "siteId": "s1",
//!   "opId": { "site": "s1", "counter": 4 },
//!   "payload": { "position": [3, 40000], "value": "x" },
//!   "timestamp": 1730000000000,
//!   "inverseOpId": { "site": "s1", "counter": 2 } }   // only on undo records
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

use crate::position::Position;

/// Global identity of an operation; the dedup key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub site: String,
    pub counter: u64,
}

impl OpId {
    pub fn new(site: impl Into<String>, counter: u64) -> Self {
        Self {
            site: site.into(),
            counter,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site, self.counter)
    }
}

/// What an operation does to the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpPayload {
    Insert { position: Position, value: char },
    Delete { position: Position },
}

impl OpPayload {
    pub fn position(&self) -> &Position {
        match self {
            OpPayload::Insert { position, .. } | OpPayload::Delete { position } => position,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            OpPayload::Insert { .. } => OpKind::Insert,
            OpPayload::Delete { .. } => OpKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
}

/// A single replicated edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub struct Operation {
    pub doc_id: String,
    pub site_id: String,
    pub op_id: OpId,
    pub payload: OpPayload,
    /// Milliseconds since the Unix epoch at issue time.
    pub timestamp: i64,
    /// Set on undo records: the operation this one inverts.
    pub inverse_op_id: Option<OpId>,
}

impl Operation {
    pub fn new(doc_id: impl Into<String>, op_id: OpId, payload: OpPayload) -> Self {
        Self {
            doc_id: doc_id.into(),
            site_id: op_id.site.clone(),
            op_id,
            payload,
            timestamp: now_millis(),
            inverse_op_id: None,
        }
    }

    pub fn insert(doc_id: impl Into<String>, op_id: OpId, position: Position, value: char) -> Self {
        Self::new(doc_id, op_id, OpPayload::Insert { position, value })
    }

    pub fn delete(doc_id: impl Into<String>, op_id: OpId, position: Position) -> Self {
        Self::new(doc_id, op_id, OpPayload::Delete { position })
    }

    /// Mark this operation as the inverse of `target`.
    pub fn inverse_of(mut self, target: OpId) -> Self {
        self.inverse_op_id = Some(target);
        self
    }

    pub fn kind(&self) -> OpKind {
        self.payload.kind()
    }

    pub fn position(&self) -> &Position {
        self.payload.position()
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse_op_id.is_some()
    }
}

/// Errors raised while decoding an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("insert payload for {0} carries no value")]
    MissingValue(OpId),
    #[error("operation {0} has an empty docId or siteId")]
    MissingIdentity(OpId),
    #[error("operation {0} targets position {1} outside the document")]
    InvalidPosition(OpId, Position),
}

#[derive(Serialize, Deserialize)]
struct RawPayload {
    position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<char>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperation {
    #[serde(rename = "type")]
    kind: OpKind,
    doc_id: String,
    site_id: String,
    op_id: OpId,
    payload: RawPayload,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inverse_op_id: Option<OpId>,
}

impl TryFrom<RawOperation> for Operation {
    type Error = OperationError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        if raw.doc_id.is_empty() || raw.site_id.is_empty() {
            return Err(OperationError::MissingIdentity(raw.op_id));
        }
        if !raw.payload.position.is_interior() {
            return Err(OperationError::InvalidPosition(raw.op_id, raw.payload.position));
        }
        let payload = match raw.kind {
            OpKind::Insert => OpPayload::Insert {
                position: raw.payload.position,
                value: raw
                    .payload
                    .value
                    .ok_or_else(|| OperationError::MissingValue(raw.op_id.clone()))?,
            },
            OpKind::Delete => OpPayload::Delete {
                position: raw.payload.position,
            },
        };
        Ok(Self {
            doc_id: raw.doc_id,
            site_id: raw.site_id,
            op_id: raw.op_id,
            payload,
            timestamp: raw.timestamp,
            inverse_op_id: raw.inverse_op_id,
        })
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        let (kind, position, value) = match op.payload {
            OpPayload::Insert { position, value } => (OpKind::Insert, position, Some(value)),
            OpPayload::Delete { position } => (OpKind::Delete, position, None),
        };
        Self {
            kind,
            doc_id: op.doc_id,
            site_id: op.site_id,
            op_id: op.op_id,
            payload: RawPayload { position, value },
            timestamp: op.timestamp,
            inverse_op_id: op.inverse_op_id,
        }
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
