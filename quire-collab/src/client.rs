//! Client facade: index-level editing on top of the replica and network.
//!
//! Provides:
//! - Uniquely identified operations from index edits (`site`, `counter`)
//! - Speculative local application with echo acknowledgement
//! - Selective per-site undo and redo
//! - Cursor anchoring that survives remote edits
//! - Startup restore from the persisted log
//!
//! A local commit is atomic from the caller's view:
//! ```text
//! apply to confirmed → push pending → record history → log → send/queue
//! ```
//! and only then are [`ClientEvent`]s queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use quire_core::{
    generate_between, seed_operations, EditorState, HistoryManager, OpId, OpKind, OpPayload,
    Operation, Position, SequenceStore,
};

use crate::network::{CollabNetwork, ConnectionStatus, NetworkConfig, NetworkEvent};
use crate::storage::{self, DocStore};
use crate::transport::{Connector, WebSocketConnector};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL
    pub url: String,
    pub doc_id: String,
    /// Stable identity of this replica
    pub site_id: String,
    /// Added to the op counter to spread this site's positions
    pub site_bias: i64,
    pub sync_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4();
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            doc_id: "default".to_string(),
            site_id: format!("site-{}", id.simple()),
            site_bias: (id.as_u128() % 100) as i64,
            sync_timeout: Duration::from_millis(2000),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(30_000),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            doc_id: doc_id.into(),
            ..Self::default()
        }
    }

    /// Fixed site id and short timers for tests.
    pub fn for_testing(url: impl Into<String>, doc_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        let site_id = site_id.into();
        let site_bias = site_id
            .bytes()
            .fold(0i64, |h, b| (h * 31 + b as i64) % 1000);
        Self {
            url: url.into(),
            doc_id: doc_id.into(),
            site_id,
            site_bias,
            sync_timeout: Duration::from_millis(200),
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(400),
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            url: self.url.clone(),
            doc_id: self.doc_id.clone(),
            site_id: self.site_id.clone(),
            sync_timeout: self.sync_timeout,
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
        }
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Visible text or cursor index may have changed
    StateChanged,
    StatusChanged(ConnectionStatus),
    /// Number of operations waiting for a connection
    PendingCountChanged(usize),
    /// Catch-up finished; the client is live
    SyncComplete,
}

/// Why an operation is being committed.
enum Origin {
    /// A fresh edit. Invalidates the redo stack.
    User,
    Undo(OpId),
    Redo(OpId),
}

pub struct CrdtClient {
    config: ClientConfig,
    store: Arc<dyn DocStore>,
    state: EditorState,
    history: HistoryManager,
    network: CollabNetwork,
    counter: u64,
    events: VecDeque<ClientEvent>,
}

impl CrdtClient {
    /// Create a client and restore the persisted log of its document.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, store: Arc<dyn DocStore>) -> Self {
        let mut network = CollabNetwork::new(config.network_config(), connector, store.clone());
        let mut state = EditorState::new();
        let mut history = HistoryManager::new();

        let persisted = storage::load_ops(store.as_ref(), &config.doc_id);
        let restored = network.restore(persisted, |op| {
            let deleted = state.apply_to_confirmed(op);
            history.record(op, false, deleted);
        });
        let counter = network
            .log()
            .max_counter_for(&config.site_id)
            .map_or(0, |c| c + 1);
        if restored > 0 {
            log::info!(
                "Restored {restored} operations for doc {} (next counter {counter})",
                config.doc_id
            );
        }

        Self {
            config,
            store,
            state,
            history,
            network,
            counter,
            events: VecDeque::new(),
        }
    }

    /// Client talking WebSocket to the configured relay URL.
    pub fn with_websocket(config: ClientConfig, store: Arc<dyn DocStore>) -> Self {
        Self::new(config, Arc::new(WebSocketConnector), store)
    }

    // ─── Connection ───────────────────────────────────────────────────

    pub fn connect(&mut self) {
        self.network.connect();
        self.absorb_network_events();
    }

    pub fn disconnect(&mut self) {
        self.network.disconnect();
        self.absorb_network_events();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.network.status()
    }

    /// Operations queued while offline.
    pub fn pending_count(&self) -> usize {
        self.network.pending_count()
    }

    // ─── Editing ──────────────────────────────────────────────────────

    /// Insert `value` so that it becomes the visible character at `index`.
    /// Indexes past the end append.
    pub fn insert_at(&mut self, index: usize, value: char) -> Operation {
        let visible = self.state.visible_state();
        let (left, right) = visible.bounds_at(index.min(visible.len()));
        self.insert_between(&left, &right, value)
    }

    /// Insert a run of characters starting at `index`.
    pub fn insert_str(&mut self, index: usize, text: &str) -> Vec<Operation> {
        let visible = self.state.visible_state();
        let (mut left, right) = visible.bounds_at(index.min(visible.len()));
        let mut ops = Vec::with_capacity(text.len());
        for ch in text.chars() {
            let op = self.insert_between(&left, &right, ch);
            left = op.position().clone();
            ops.push(op);
        }
        ops
    }

    fn insert_between(&mut self, left: &Position, right: &Position, value: char) -> Operation {
        let bias = self.config.site_bias.wrapping_add(self.counter as i64);
        let mut position = generate_between(left, right, bias);
        // Tombstones sit between visible neighbours; never reuse their slot.
        while self.state.confirmed().element(&position).is_some() {
            position = generate_between(&position, right, bias);
        }
        self.commit(OpPayload::Insert { position, value }, Origin::User)
    }

    /// Delete the visible character at `index`.
    pub fn delete_at(&mut self, index: usize) -> Option<Operation> {
        let position = self.state.visible_state().positions().get(index)?.clone();
        Some(self.commit(OpPayload::Delete { position }, Origin::User))
    }

    /// Delete `len` visible characters starting at `start`.
    pub fn delete_range(&mut self, start: usize, len: usize) -> Vec<Operation> {
        let positions: Vec<Position> = self
            .state
            .visible_state()
            .positions()
            .into_iter()
            .skip(start)
            .take(len)
            .collect();
        self.delete_positions(&positions)
    }

    /// Delete the elements at exactly these positions.
    pub fn delete_positions(&mut self, positions: &[Position]) -> Vec<Operation> {
        positions
            .iter()
            .map(|position| {
                self.commit(
                    OpPayload::Delete {
                        position: position.clone(),
                    },
                    Origin::User,
                )
            })
            .collect()
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    /// Revert this site's most recent edit that is not yet undone.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.history.last_undoable(&self.config.site_id).cloned() else {
            return false;
        };
        self.commit(entry.inverse_payload(), Origin::Undo(entry.op_id.clone()));
        self.history.mark_undone(entry.op_id);
        true
    }

    /// Re-issue the most recently undone edit as a new operation.
    pub fn redo(&mut self) -> bool {
        let Some(original_id) = self.history.pop_redo() else {
            return false;
        };
        let Some(original) = self.network.log().get(&original_id) else {
            log::warn!("Redo target {original_id} is not in the log");
            return false;
        };
        let payload = original.payload.clone();
        self.commit(payload, Origin::Redo(original_id));
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo(&self.config.site_id)
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn commit(&mut self, payload: OpPayload, origin: Origin) -> Operation {
        let op_id = OpId::new(self.config.site_id.clone(), self.counter);
        self.counter += 1;

        let mut op = Operation::new(self.config.doc_id.clone(), op_id, payload);
        let mut fallback_deleted = None;
        match &origin {
            Origin::User => self.history.clear_redo(),
            Origin::Undo(target) => op = op.inverse_of(target.clone()),
            Origin::Redo(original) => fallback_deleted = self.history.deleted_value(original),
        }

        let deleted = match self.state.apply_to_confirmed(&op) {
            Some(value) => Some(value),
            None if op.kind() == OpKind::Delete => fallback_deleted,
            None => None,
        };
        self.state.push_pending(op.clone());
        self.history.record(&op, true, deleted);
        self.network.record_op(op.clone());
        self.network.send_op(op.clone());

        self.absorb_network_events();
        self.events.push_back(ClientEvent::StateChanged);
        op
    }

    // ─── Remote input and events ──────────────────────────────────────

    /// Inject an operation as if it had arrived as a live broadcast.
    pub fn apply_remote(&mut self, op: Operation) {
        self.network.receive_op(op);
        self.absorb_network_events();
    }

    /// Wait for the next client event, driving network I/O meanwhile.
    pub async fn next_event(&mut self) -> ClientEvent {
        loop {
            if let Some(event) = self.events.pop_front() {
                return event;
            }
            let event = self.network.next_event().await;
            self.handle_network_event(event);
        }
    }

    /// Drive whatever network I/O is ready and return the queued events.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        self.absorb_network_events();
        self.events.drain(..).collect()
    }

    fn absorb_network_events(&mut self) {
        for event in self.network.drain_ready() {
            self.handle_network_event(event);
        }
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Apply { op, from_self } => {
                let deleted = self.state.apply_to_confirmed(&op);
                if from_self {
                    self.state.acknowledge(&op.op_id);
                }
                self.history.record(&op, from_self, deleted);
                self.events.push_back(ClientEvent::StateChanged);
            }
            NetworkEvent::Acknowledged(op_id) => {
                if self.state.acknowledge(&op_id) {
                    log::trace!("Acknowledged {op_id}");
                }
            }
            NetworkEvent::StatusChanged(status) => {
                self.events.push_back(ClientEvent::StatusChanged(status));
            }
            NetworkEvent::PendingCountChanged(count) => {
                self.events.push_back(ClientEvent::PendingCountChanged(count));
            }
            NetworkEvent::SyncComplete => {
                self.events.push_back(ClientEvent::SyncComplete);
            }
        }
    }

    // ─── State ────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        self.state.visible_text()
    }

    pub fn visible_state(&self) -> SequenceStore {
        self.state.visible_state()
    }

    pub fn editor_state(&self) -> &EditorState {
        &self.state
    }

    pub fn cursor_index(&self) -> usize {
        self.state.cursor_index()
    }

    /// Anchor the cursor before the visible character at `index`.
    pub fn set_cursor_index(&mut self, index: usize) {
        let visible = self.state.visible_state();
        let anchor = visible.index_to_position(index.min(visible.len()));
        self.state.set_cursor(Some(anchor));
    }

    pub fn site_id(&self) -> &str {
        &self.config.site_id
    }

    pub fn doc_id(&self) -> &str {
        &self.config.doc_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of operations in the log.
    pub fn log_len(&self) -> usize {
        self.network.log().len()
    }

    /// Seed `new_doc_id` in the store with the current visible text, written
    /// as sequential inserts by this site. Returns how many were written.
    pub fn save_copy(&self, new_doc_id: &str) -> usize {
        let ops = seed_operations(new_doc_id, &self.config.site_id, &self.text());
        storage::persist_ops(self.store.as_ref(), new_doc_id, &ops);
        storage::persist_pending(self.store.as_ref(), new_doc_id, &[]);
        log::info!("Saved {} characters of {} as {new_doc_id}", ops.len(), self.config.doc_id);
        ops.len()
    }
}

/// A fresh random document id.
pub fn new_doc_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
