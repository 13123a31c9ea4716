//! Per-document persistence behind a small key/value port.
//!
//! ```text
//! ┌──────────────┐   get/set JSON   ┌───────────────────────────┐
//! │ CollabNetwork│ ───────────────► │ dyn DocStore              │
//! │ CrdtClient   │                  │  ├─ MemoryStore (HashMap) │
//! └──────────────┘                  │  └─ RocksStore  (LZ4)     │
//!                                   └───────────────────────────┘
//! keys:  quire:doc:{docId}:ops      full operation log
//!        quire:doc:{docId}:pending  offline outbound queue
//! ```
//!
//! Reads and writes through [`load_ops`] / [`persist_ops`] are best effort:
//! a failing store is logged and otherwise ignored, and malformed entries are
//! skipped on load.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use quire_core::Operation;
use serde_json::Value;
use thiserror::Error;

const KEY_PREFIX: &str = "quire:doc:";

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("column family `{0}` not found")]
    MissingColumnFamily(&'static str),
    #[error("compression error: {0}")]
    Compression(#[from] lz4_flex::block::DecompressError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A get/set store of JSON values keyed by string.
///
/// Implementations are shared between the client and its network layer, so
/// they take `&self`.
pub trait DocStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Key under which the operation log of `doc_id` is kept.
pub fn ops_key(doc_id: &str) -> String {
    format!("{KEY_PREFIX}{doc_id}:ops")
}

/// Key under which the offline outbound queue of `doc_id` is kept.
pub fn pending_key(doc_id: &str) -> String {
    format!("{KEY_PREFIX}{doc_id}:pending")
}

fn load_list(store: &dyn DocStore, key: &str) -> Vec<Operation> {
    let value = match store.get(key) {
        Ok(Some(value)) => value,
        Ok(None) => return Vec::new(),
        Err(e) => {
            log::warn!("Failed to read {key}: {e}");
            return Vec::new();
        }
    };
    let Value::Array(items) = value else {
        log::warn!("Ignoring non-array value under {key}");
        return Vec::new();
    };

    let total = items.len();
    let ops: Vec<Operation> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if ops.len() < total {
        log::debug!("Skipped {} malformed entries under {key}", total - ops.len());
    }
    ops
}

fn store_list(store: &dyn DocStore, key: &str, ops: &[Operation]) {
    let result = serde_json::to_value(ops)
        .map_err(StoreError::from)
        .and_then(|value| store.set(key, value));
    if let Err(e) = result {
        log::warn!("Failed to persist {key}: {e}");
    }
}

/// Persisted operation log of `doc_id`, oldest first.
pub fn load_ops(store: &dyn DocStore, doc_id: &str) -> Vec<Operation> {
    load_list(store, &ops_key(doc_id))
}

pub fn persist_ops(store: &dyn DocStore, doc_id: &str, ops: &[Operation]) {
    store_list(store, &ops_key(doc_id), ops);
}

/// Persisted offline outbound queue of `doc_id`, in issuance order.
pub fn load_pending(store: &dyn DocStore, doc_id: &str) -> Vec<Operation> {
    load_list(store, &pending_key(doc_id))
}

pub fn persist_pending(store: &dyn DocStore, doc_id: &str, ops: &[Operation]) {
    store_list(store, &pending_key(doc_id), ops);
}
