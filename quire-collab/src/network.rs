//! Connection lifecycle, join/catch-up protocol and offline outbound queue.
//!
//! ```text
//!            connect()                open                 sync_done | timer
//!  Offline ───────────► Connecting ─────────► Syncing ──────────────────────► Online
//!     ▲                     │                    │                              │
//!     │    close / error    │                    │                              │
//!     └─────────────────────┴────────────────────┴──────────────────────────────┘
//!              retry after min(base * 2^attempts, max) unless disconnect()
//! ```
//!
//! [`CollabNetwork`] is owned by a single task. Socket I/O and timers run as
//! spawned tasks that only post [`Signal`]s back to the owner; every signal
//! carries the connection generation it was created for, and anything from an
//! older generation is discarded. All state changes happen inside
//! [`CollabNetwork::next_event`] / [`CollabNetwork::drain_ready`] on the
//! owner's task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quire_core::{OpId, Operation, OperationLog, ReplayEngine, SyncState};

use crate::protocol::WireMessage;
use crate::storage::{self, DocStore};
use crate::transport::{Connector, Frame};

/// Network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:8080`
    pub url: String,
    pub doc_id: String,
    pub site_id: String,
    /// How long to wait for a peer's catch-up before assuming we are alone
    pub sync_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            doc_id: "default".to_string(),
            site_id: uuid::Uuid::new_v4().to_string(),
            sync_timeout: Duration::from_millis(2000),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(30_000),
        }
    }
}

impl NetworkConfig {
    /// Short timers for tests.
    pub fn for_testing(url: impl Into<String>, doc_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            doc_id: doc_id.into(),
            site_id: site_id.into(),
            sync_timeout: Duration::from_millis(200),
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(400),
        }
    }
}

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    Connecting,
    Syncing,
    Online,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Online => "online",
        };
        f.write_str(name)
    }
}

/// Events emitted to the owner of the network layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A fresh operation passed the log's dedup filter and must be applied.
    Apply { op: Operation, from_self: bool },
    /// One of our own operations came back from the relay.
    Acknowledged(OpId),
    StatusChanged(ConnectionStatus),
    PendingCountChanged(usize),
    /// Catch-up finished and the outbound queue was flushed.
    SyncComplete,
}

/// Posted by spawned I/O and timer tasks.
#[derive(Debug)]
enum Signal {
    Opened {
        generation: u64,
        outgoing: mpsc::UnboundedSender<String>,
    },
    Frame {
        generation: u64,
        frame: Frame,
    },
    Closed {
        generation: u64,
    },
    SyncTimeout {
        generation: u64,
    },
    ReconnectDue {
        generation: u64,
    },
}

/// Items parked while syncing.
#[derive(Debug, Clone)]
enum Buffered {
    Historical(Operation),
    Live(Operation),
}

/// Delay before reconnect attempt number `attempts` (0-based).
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts)).min(max)
}

pub struct CollabNetwork {
    config: NetworkConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn DocStore>,

    engine: ReplayEngine,
    sync: SyncState<Buffered>,
    status: ConnectionStatus,

    /// Writer half of the open connection, if any.
    outgoing: Option<mpsc::UnboundedSender<String>>,
    /// Operations issued while no connection was open.
    pending_outbound: Vec<Operation>,

    should_reconnect: bool,
    reconnect_attempts: u32,
    generation: u64,

    connection_task: Option<JoinHandle<()>>,
    sync_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,

    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    events: VecDeque<NetworkEvent>,
}

impl CollabNetwork {
    pub fn new(config: NetworkConfig, connector: Arc<dyn Connector>, store: Arc<dyn DocStore>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            store,
            engine: ReplayEngine::new(),
            sync: SyncState::new(),
            status: ConnectionStatus::Offline,
            outgoing: None,
            pending_outbound: Vec::new(),
            should_reconnect: true,
            reconnect_attempts: 0,
            generation: 0,
            connection_task: None,
            sync_timer: None,
            reconnect_timer: None,
            signal_tx,
            signal_rx,
            events: VecDeque::new(),
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn pending_count(&self) -> usize {
        self.pending_outbound.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn log(&self) -> &OperationLog {
        self.engine.log()
    }

    pub fn is_live(&self) -> bool {
        self.sync.is_live()
    }

    // ─── Commands ─────────────────────────────────────────────────────

    /// Replay persisted operations into the log before connecting. `apply`
    /// runs for each operation not already logged.
    pub fn restore<F>(&mut self, ops: Vec<Operation>, apply: F) -> usize
    where
        F: FnMut(&Operation),
    {
        let fresh = self.engine.replay_in_order(ops, apply);
        log::debug!("Restored {fresh} operations for doc {}", self.config.doc_id);
        fresh
    }

    /// Open a connection, replacing any existing one.
    pub fn connect(&mut self) {
        self.should_reconnect = true;
        self.cancel_reconnect();
        self.close_connection();

        self.pending_outbound = storage::load_pending(self.store.as_ref(), &self.config.doc_id);
        self.set_status(ConnectionStatus::Connecting);
        self.open();
    }

    /// Close the connection and stop reconnecting. Applied operations stay.
    pub fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.cancel_reconnect();
        self.close_connection();
        self.set_status(ConnectionStatus::Offline);
        log::info!("Disconnected from doc {}", self.config.doc_id);
    }

    /// Append a locally issued operation to the log and persist it.
    pub fn record_op(&mut self, op: Operation) -> bool {
        let fresh = self.engine.record(op);
        if fresh {
            self.persist_log();
        }
        fresh
    }

    /// Transmit `op`, or queue it for the next connection.
    pub fn send_op(&mut self, op: Operation) {
        if let Some(tx) = &self.outgoing {
            match WireMessage::Operation(op.clone()).encode() {
                Ok(text) => {
                    if tx.send(text).is_ok() {
                        return;
                    }
                }
                Err(e) => log::warn!("Failed to encode operation {}: {e}", op.op_id),
            }
        }
        self.pending_outbound.push(op);
        storage::persist_pending(self.store.as_ref(), &self.config.doc_id, &self.pending_outbound);
        self.events
            .push_back(NetworkEvent::PendingCountChanged(self.pending_outbound.len()));
    }

    /// Inject an operation as if it had arrived as a live broadcast.
    pub fn receive_op(&mut self, op: Operation) {
        if self.sync.is_syncing() && self.outgoing.is_some() {
            self.sync.push(Buffered::Live(op));
        } else {
            self.apply_live(op);
            self.persist_log();
        }
    }

    // ─── Event pump ───────────────────────────────────────────────────

    /// Wait for the next event, processing I/O signals as they arrive.
    pub async fn next_event(&mut self) -> NetworkEvent {
        loop {
            if let Some(event) = self.events.pop_front() {
                return event;
            }
            match self.signal_rx.recv().await {
                Some(signal) => self.handle_signal(signal),
                // Unreachable while `self` holds a sender.
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Process every signal that is already waiting and return the events
    /// they produced, without blocking.
    pub fn drain_ready(&mut self) -> Vec<NetworkEvent> {
        while let Ok(signal) = self.signal_rx.try_recv() {
            self.handle_signal(signal);
        }
        self.events.drain(..).collect()
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Opened { generation, outgoing } if generation == self.generation => {
                self.on_open(outgoing);
            }
            Signal::Frame { generation, frame } if generation == self.generation => {
                self.on_frame(frame);
            }
            Signal::Closed { generation } if generation == self.generation => {
                self.on_close();
            }
            Signal::SyncTimeout { generation } if generation == self.generation => {
                self.sync_timer = None;
                if self.sync.is_syncing() {
                    log::debug!("No catch-up for doc {}; going live", self.config.doc_id);
                    self.go_live();
                }
            }
            Signal::ReconnectDue { generation } if generation == self.generation => {
                self.reconnect_timer = None;
                if self.should_reconnect {
                    self.connect();
                }
            }
            stale => log::trace!("Ignoring stale signal {stale:?}"),
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    fn open(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let signals = self.signal_tx.clone();
        let connecting = self.connector.connect(&self.config.url);
        let url = self.config.url.clone();

        self.connection_task = Some(tokio::spawn(async move {
            match connecting.await {
                Ok(mut duplex) => {
                    let _ = signals.send(Signal::Opened {
                        generation,
                        outgoing: duplex.outgoing,
                    });
                    while let Some(frame) = duplex.incoming.recv().await {
                        if signals.send(Signal::Frame { generation, frame }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => log::warn!("Connection to {url} failed: {e}"),
            }
            let _ = signals.send(Signal::Closed { generation });
        }));
    }

    fn on_open(&mut self, outgoing: mpsc::UnboundedSender<String>) {
        self.reconnect_attempts = 0;
        self.outgoing = Some(outgoing);
        self.sync.reset();
        self.set_status(ConnectionStatus::Syncing);
        log::info!(
            "Connected to {} as site {}; requesting catch-up for doc {}",
            self.config.url,
            self.config.site_id,
            self.config.doc_id
        );

        let known_clock = self.engine.log().len() as u64;
        self.send(&WireMessage::join(&self.config.doc_id, &self.config.site_id, known_clock));
        self.start_sync_timer();
    }

    fn on_close(&mut self) {
        self.clear_sync_timer();
        self.outgoing = None;
        self.connection_task = None;
        self.set_status(ConnectionStatus::Offline);
        self.schedule_reconnect();
    }

    fn close_connection(&mut self) {
        self.clear_sync_timer();
        self.outgoing = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        // Anything still in flight from the old connection is now stale.
        self.generation += 1;
    }

    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect {
            return;
        }
        self.cancel_reconnect();
        let delay = backoff_delay(
            self.reconnect_attempts,
            self.config.reconnect_base,
            self.config.reconnect_max,
        );
        self.reconnect_attempts += 1;
        log::warn!(
            "Connection to {} lost; retry {} in {delay:?}",
            self.config.url,
            self.reconnect_attempts
        );

        let generation = self.generation;
        let signals = self.signal_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn start_sync_timer(&mut self) {
        self.clear_sync_timer();
        let generation = self.generation;
        let timeout = self.config.sync_timeout;
        let signals = self.signal_tx.clone();
        self.sync_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = signals.send(Signal::SyncTimeout { generation });
        }));
    }

    fn clear_sync_timer(&mut self) {
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            log::debug!("Status {} -> {status}", self.status);
            self.status = status;
            self.events.push_back(NetworkEvent::StatusChanged(status));
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    fn on_frame(&mut self, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                log::debug!("Ignoring {}-byte binary frame", data.len());
                return;
            }
        };
        let msg = match WireMessage::decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping frame: {e}");
                return;
            }
        };
        if msg.doc_id() != self.config.doc_id {
            log::debug!("Dropping {} for doc {}", msg.type_name(), msg.doc_id());
            return;
        }
        if let Some(target) = msg.target() {
            if target != self.config.site_id {
                return;
            }
        }

        match msg {
            WireMessage::Join(join) => {
                if join.site_id != self.config.site_id {
                    self.serve_catch_up(&join.site_id);
                }
            }
            WireMessage::SyncOp(sync_op) => {
                if self.sync.is_syncing() {
                    // Each historical op proves a peer is still streaming.
                    self.start_sync_timer();
                    self.sync.push(Buffered::Historical(sync_op.op));
                } else {
                    self.apply_historical(sync_op.op);
                    self.persist_log();
                }
            }
            WireMessage::SyncDone(_) => {
                self.clear_sync_timer();
                if self.sync.is_syncing() {
                    self.go_live();
                }
            }
            WireMessage::Operation(op) => {
                if self.sync.is_syncing() {
                    self.sync.push(Buffered::Live(op));
                } else {
                    self.apply_live(op);
                    self.persist_log();
                }
            }
        }
    }

    /// Stream our whole log to `joiner`, then mark the end.
    fn serve_catch_up(&mut self, joiner: &str) {
        let Some(tx) = &self.outgoing else {
            return;
        };
        let doc_id = &self.config.doc_id;
        let mut sent = 0usize;
        for op in self.engine.log().iter() {
            match WireMessage::sync_op(doc_id, joiner, op.clone()).encode() {
                Ok(text) => {
                    if tx.send(text).is_err() {
                        return;
                    }
                    sent += 1;
                }
                Err(e) => log::warn!("Failed to encode sync_op {}: {e}", op.op_id),
            }
        }
        if let Ok(text) = WireMessage::sync_done(doc_id, joiner).encode() {
            let _ = tx.send(text);
        }
        log::info!("Served {sent} operations to joining site {joiner}");
    }

    fn apply_historical(&mut self, op: Operation) {
        let events = &mut self.events;
        self.engine.apply_one(op, |op| {
            events.push_back(NetworkEvent::Apply {
                op: op.clone(),
                from_self: false,
            });
        });
    }

    fn apply_live(&mut self, op: Operation) {
        let from_self = op.site_id == self.config.site_id;
        let op_id = op.op_id.clone();
        let events = &mut self.events;
        let fresh = self.engine.apply_one(op, |op| {
            events.push_back(NetworkEvent::Apply {
                op: op.clone(),
                from_self,
            });
        });
        if !fresh && from_self {
            self.events.push_back(NetworkEvent::Acknowledged(op_id));
        }
    }

    fn go_live(&mut self) {
        self.clear_sync_timer();
        let buffered = self.sync.go_live();
        let (historical, live): (Vec<_>, Vec<_>) = buffered
            .into_iter()
            .partition(|item| matches!(item, Buffered::Historical(_)));
        let caught_up = historical.len();

        for item in historical.into_iter().chain(live) {
            match item {
                Buffered::Historical(op) => self.apply_historical(op),
                Buffered::Live(op) => self.apply_live(op),
            }
        }

        self.set_status(ConnectionStatus::Online);
        self.persist_log();
        self.flush_pending();
        log::info!(
            "Doc {} live after {caught_up} catch-up operations ({} logged)",
            self.config.doc_id,
            self.engine.log().len()
        );
        self.events.push_back(NetworkEvent::SyncComplete);
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn send(&self, msg: &WireMessage) -> bool {
        let Some(tx) = &self.outgoing else {
            return false;
        };
        match msg.encode() {
            Ok(text) => tx.send(text).is_ok(),
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", msg.type_name());
                false
            }
        }
    }

    fn flush_pending(&mut self) {
        if self.outgoing.is_none() {
            return;
        }
        let queued = std::mem::take(&mut self.pending_outbound);
        if !queued.is_empty() {
            log::info!("Flushing {} queued operations", queued.len());
        }
        let had_pending = !queued.is_empty();
        for op in queued {
            self.send(&WireMessage::Operation(op));
        }
        storage::persist_pending(self.store.as_ref(), &self.config.doc_id, &[]);
        if had_pending {
            self.events.push_back(NetworkEvent::PendingCountChanged(0));
        }
    }

    fn persist_log(&self) {
        storage::persist_ops(self.store.as_ref(), &self.config.doc_id, self.engine.log().as_slice());
    }
}

impl Drop for CollabNetwork {
    fn drop(&mut self) {
        for task in [
            self.connection_task.take(),
            self.sync_timer.take(),
            self.reconnect_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
