//! # quire-core: Sequence CRDT and replica state for Quire
//!
//! Everything here is synchronous and I/O free. The networking side lives in
//! `quire-collab`.
//!
//! ## Architecture
//!
//! ```text
//!   Position ──► SequenceStore ──► EditorState (confirmed + pending)
//!                                      ▲
//!   Operation ──► OperationLog ──► ReplayEngine
//!                                      │
//!                 SyncState ◄──────────┘   HistoryManager (undo/redo)
//! ```
//!
//! ## Modules
//!
//! - [`position`]: Dense base-65536 identifiers and `generate_between`
//! - [`sequence`]: Tombstoned, position-ordered character store
//! - [`operation`]: `OpId`, `Operation` and its JSON shape
//! - [`oplog`]: Append-only, dedup-by-id operation log
//! - [`replay`]: Applies operations through the log's dedup filter
//! - [`sync_state`]: Syncing/live mode with catch-up buffering
//! - [`history`]: Per-site selective undo and redo bookkeeping
//! - [`editor`]: Confirmed state with a pending overlay and cursor anchor
//! - [`seed`]: Operations that spell a text into a new document

pub mod position;
pub mod sequence;
pub mod operation;
pub mod oplog;
pub mod replay;
pub mod sync_state;
pub mod history;
pub mod editor;
pub mod seed;

pub use position::{generate_between, Position, BASE, HALF};
pub use sequence::{Element, SequenceStore};
pub use operation::{now_millis, OpId, OpKind, OpPayload, Operation, OperationError};
pub use oplog::OperationLog;
pub use replay::ReplayEngine;
pub use sync_state::{SyncMode, SyncState};
pub use history::{HistoryManager, UndoEntry};
pub use editor::EditorState;
pub use seed::seed_operations;
