//! # quire-collab: Networked collaboration for Quire documents
//!
//! Connects [`quire_core`] replicas through a relay over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ CrdtClient  │ ◄─────────────────► │ RelayServer │
//! │ (per site)  │     JSON frames     │ (stateless) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │CollabNetwork│                     │ RoomManager │
//! │ log + sync  │                     │ (fan-out)   │
//! └──────┬──────┘                     └─────────────┘
//!        ▼
//! ┌─────────────┐
//! │  DocStore   │
//! │ (RocksDB)   │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`storage`]: Persisted operation log and offline queue
//! - [`transport`]: Duplex channels (WebSocket or in-memory)
//! - [`network`]: Connection lifecycle, catch-up and reconnect
//! - [`client`]: Editing facade with undo/redo
//! - [`broadcast`]: Per-document rooms with backpressure
//! - [`server`]: WebSocket relay

pub mod protocol;
pub mod storage;
pub mod transport;
pub mod network;
pub mod client;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{JoinMessage, ProtocolError, SyncDoneMessage, SyncOpMessage, WireMessage};
pub use storage::{DocStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{Connector, Duplex, Frame, MemoryConnector, RemoteEnd, TransportError, WebSocketConnector};
pub use network::{backoff_delay, CollabNetwork, ConnectionStatus, NetworkConfig, NetworkEvent};
pub use client::{new_doc_id, ClientConfig, ClientEvent, CrdtClient};
pub use broadcast::{BroadcastStats, ConnId, Room, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerStats};
