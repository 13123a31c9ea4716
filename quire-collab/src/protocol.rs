//! JSON text-frame protocol between clients and the relay.
//!
//! Every frame is one JSON object discriminated by `type`:
//! ```text
//! {"type":"join",      "docId", "siteId", "knownClock"}   joiner → room
//! {"type":"sync_op",   "docId", "target", "op"}           peer   → joiner
//! {"type":"sync_done", "docId", "target"}                 peer   → joiner
//! {"type":"insert"|"delete", ...operation fields}         site   → room
//! ```
//!
//! Operations travel bare (not wrapped), so the operation's own `type` field
//! doubles as the message discriminator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quire_core::Operation;

/// Catch-up request announced by a site that just opened its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub doc_id: String,
    pub site_id: String,
    /// Number of operations the joiner already holds.
    pub known_clock: u64,
}

/// One historical operation addressed to a joining site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOpMessage {
    pub doc_id: String,
    pub target: String,
    pub op: Operation,
}

/// End of a catch-up stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDoneMessage {
    pub doc_id: String,
    pub target: String,
}

/// Any message that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Join(JoinMessage),
    SyncOp(SyncOpMessage),
    SyncDone(SyncDoneMessage),
    Operation(Operation),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Control {
    Join(JoinMessage),
    SyncOp(SyncOpMessage),
    SyncDone(SyncDoneMessage),
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

impl WireMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = match self {
            WireMessage::Join(m) => serde_json::to_string(&Control::Join(m.clone()))?,
            WireMessage::SyncOp(m) => serde_json::to_string(&Control::SyncOp(m.clone()))?,
            WireMessage::SyncDone(m) => serde_json::to_string(&Control::SyncDone(m.clone()))?,
            WireMessage::Operation(op) => serde_json::to_string(op)?,
        };
        Ok(text)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let tag = TypeTag::deserialize(&value)?;
        match tag.kind.as_str() {
            "join" | "sync_op" | "sync_done" => {
                Ok(match Control::deserialize(value)? {
                    Control::Join(m) => WireMessage::Join(m),
                    Control::SyncOp(m) => WireMessage::SyncOp(m),
                    Control::SyncDone(m) => WireMessage::SyncDone(m),
                })
            }
            "insert" | "delete" => Ok(WireMessage::Operation(Operation::deserialize(value)?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn join(doc_id: impl Into<String>, site_id: impl Into<String>, known_clock: u64) -> Self {
        WireMessage::Join(JoinMessage {
            doc_id: doc_id.into(),
            site_id: site_id.into(),
            known_clock,
        })
    }

    pub fn sync_op(doc_id: impl Into<String>, target: impl Into<String>, op: Operation) -> Self {
        WireMessage::SyncOp(SyncOpMessage {
            doc_id: doc_id.into(),
            target: target.into(),
            op,
        })
    }

    pub fn sync_done(doc_id: impl Into<String>, target: impl Into<String>) -> Self {
        WireMessage::SyncDone(SyncDoneMessage {
            doc_id: doc_id.into(),
            target: target.into(),
        })
    }

    /// Document the message belongs to.
    pub fn doc_id(&self) -> &str {
        match self {
            WireMessage::Join(m) => &m.doc_id,
            WireMessage::SyncOp(m) => &m.doc_id,
            WireMessage::SyncDone(m) => &m.doc_id,
            WireMessage::Operation(op) => &op.doc_id,
        }
    }

    /// Site a targeted message is addressed to.
    pub fn target(&self) -> Option<&str> {
        match self {
            WireMessage::SyncOp(m) => Some(&m.target),
            WireMessage::SyncDone(m) => Some(&m.target),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Join(_) => "join",
            WireMessage::SyncOp(_) => "sync_op",
            WireMessage::SyncDone(_) => "sync_done",
            WireMessage::Operation(op) => match op.kind() {
                quire_core::OpKind::Insert => "insert",
                quire_core::OpKind::Delete => "delete",
            },
        }
    }
}
