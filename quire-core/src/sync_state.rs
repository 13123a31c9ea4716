//! Syncing/live mode with a buffer for the join catch-up window.
//!
//! ```text
//!   connect ──► Syncing ──(sync_done | wait timer)──► Live
//!                  ▲                                   │
//!                  └────────────── reconnect ──────────┘
//! ```
//!
//! While syncing, everything operation-shaped is parked so the full backlog
//! lands before any live edit that might reference positions from it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Syncing,
    Live,
}

/// Buffered items are tagged by the caller (`T`), typically historical
/// replay vs. live broadcast.
#[derive(Debug, Clone)]
pub struct SyncState<T> {
    mode: SyncMode,
    buffer: Vec<T>,
}

impl<T> Default for SyncState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncState<T> {
    pub fn new() -> Self {
        Self {
            mode: SyncMode::Syncing,
            buffer: Vec::new(),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn is_syncing(&self) -> bool {
        self.mode == SyncMode::Syncing
    }

    pub fn is_live(&self) -> bool {
        self.mode == SyncMode::Live
    }

    /// Park an item until the catch-up completes.
    pub fn push(&mut self, item: T) {
        self.buffer.push(item);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Switch to live and hand back everything parked, in receipt order.
    pub fn go_live(&mut self) -> Vec<T> {
        self.mode = SyncMode::Live;
        std::mem::take(&mut self.buffer)
    }

    /// Back to syncing for a fresh connection. Anything still parked from
    /// the previous connection is discarded; it will be re-served.
    pub fn reset(&mut self) {
        self.mode = SyncMode::Syncing;
        self.buffer.clear();
    }
}
