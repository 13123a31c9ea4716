//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── join ──────► oldest other peer
//!             ├── Room (doc_id) ──┼── sync_op ───► target site only
//! Client B ──┘                    └── insert/delete ► every peer (incl. sender)
//! ```
//!
//! The relay holds no document state. Catch-up is served peer to peer: a
//! join is forwarded to one established peer, which streams its log back as
//! targeted `sync_op` frames followed by `sync_done`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnId, RoomManager, SharedFrame};
use crate::protocol::WireMessage;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per peer before sends start failing
    pub peer_channel_capacity: usize,
    /// Larger inbound frames are dropped
    pub max_message_bytes: usize,
    /// Consecutive failed sends before a peer is removed
    pub drop_after_failures: u32,
    /// Whether operations are echoed back to their sender
    pub echo_to_sender: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            peer_channel_capacity: 2048,
            max_message_bytes: 1 << 20,
            drop_after_failures: 5,
            echo_to_sender: true,
        }
    }
}

impl ServerConfig {
    /// Any free loopback port, small channels.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            peer_channel_capacity: 64,
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_ops: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub peers_dropped: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    relayed_ops: AtomicU64,
    rejected_frames: AtomicU64,
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
}

/// The relay server.
pub struct RelayServer {
    shared: Shared,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.drop_after_failures));
        Self {
            shared: Shared {
                config,
                rooms,
                stats: Arc::new(AtomicServerStats::default()),
            },
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            log::debug!("New TCP connection {conn_id} from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn_id, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Snapshot of the server and delivery counters.
    pub async fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        let delivery = self.shared.rooms.stats();
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            relayed_ops: s.relayed_ops.load(Ordering::Relaxed),
            rejected_frames: s.rejected_frames.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
            messages_sent: delivery.messages_sent,
            messages_dropped: delivery.messages_dropped,
            peers_dropped: delivery.peers_dropped,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }
}

/// Outbound channel of one connection.
///
/// The strong sender is held locally only until the first join; after that
/// the rooms own every strong handle, so being dropped from all rooms ends
/// the receiver and closes the connection.
struct Outbound {
    unjoined: Option<mpsc::Sender<SharedFrame>>,
    weak: mpsc::WeakSender<SharedFrame>,
}

impl Outbound {
    fn new(tx: mpsc::Sender<SharedFrame>) -> Self {
        Self {
            weak: tx.downgrade(),
            unjoined: Some(tx),
        }
    }

    fn sender(&mut self) -> Option<mpsc::Sender<SharedFrame>> {
        self.unjoined.take().or_else(|| self.weak.upgrade())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, conn_id: ConnId, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection {conn_id} established from {addr}");

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (tx, mut rx) = mpsc::channel::<SharedFrame>(shared.config.peer_channel_capacity);
    let mut outbound = Outbound::new(tx);

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            route(text.as_str(), conn_id, &shared, &mut outbound).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            shared.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Ignoring {}-byte binary frame from {conn_id}", data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        None => {
                            log::warn!("Closing connection {conn_id}: dropped from every room");
                            let _ = ws_sender.close().await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    shared.rooms.leave_all(conn_id).await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// Dispatch one inbound text frame.
async fn route(text: &str, conn_id: ConnId, shared: &Shared, outbound: &mut Outbound) {
    let stats = &shared.stats;
    stats.total_messages.fetch_add(1, Ordering::Relaxed);
    stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

    if text.len() > shared.config.max_message_bytes {
        stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
        log::warn!("Dropping {}-byte frame from {conn_id}: over limit", text.len());
        return;
    }
    let msg = match WireMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping frame from {conn_id}: {e}");
            return;
        }
    };
    if msg.doc_id().is_empty() {
        stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
        log::debug!("Dropping {} from {conn_id}: missing docId", msg.type_name());
        return;
    }

    let frame: SharedFrame = Arc::from(text);
    let rooms = &shared.rooms;
    match &msg {
        WireMessage::Join(join) => {
            if join.site_id.is_empty() {
                stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping join from {conn_id}: missing siteId");
                return;
            }
            let Some(tx) = outbound.sender() else { return };
            rooms.join(&join.doc_id, conn_id, &join.site_id, tx).await;
            match rooms.forward_join(&join.doc_id, conn_id, frame).await {
                Some(peer) => log::info!(
                    "Site {} joined doc {} (knows {} ops); catch-up from connection {peer}",
                    join.site_id,
                    join.doc_id,
                    join.known_clock
                ),
                None => log::info!("Site {} joined doc {} as first peer", join.site_id, join.doc_id),
            }
        }
        WireMessage::SyncOp(_) | WireMessage::SyncDone(_) => {
            let target = msg.target().unwrap_or_default();
            if !rooms.send_to_target(msg.doc_id(), target, frame).await {
                log::debug!("No deliverable peer {target} in doc {}", msg.doc_id());
            }
        }
        WireMessage::Operation(op) => {
            if op.site_id.is_empty() {
                stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping operation from {conn_id}: missing siteId");
                return;
            }
            if let Some(tx) = outbound.sender() {
                rooms.join(&op.doc_id, conn_id, &op.site_id, tx).await;
            }
            let exclude = (!shared.config.echo_to_sender).then_some(conn_id);
            let delivered = rooms.broadcast(&op.doc_id, frame, exclude).await;
            stats.relayed_ops.fetch_add(1, Ordering::Relaxed);
            log::trace!("Relayed {} to {delivered} peers", op.op_id);
        }
    }
}
