//! Duplex message channels the network layer talks through.
//!
//! ```text
//!            outgoing (String)
//! network ─────────────────────► writer task ──► socket
//!         ◄───────────────────── reader task ◄── socket
//!            incoming (Frame)
//! ```
//!
//! The incoming receiver ending is the only close signal: a socket error, a
//! close frame and the remote dropping its sender all look the same.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// An open connection.
#[derive(Debug)]
pub struct Duplex {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection refused: {0}")]
    Refused(String),
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Duplex, TransportError>> + Send>>;

/// Opens duplex channels to a URL.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> ConnectFuture;
}

/// WebSocket transport over tokio-tungstenite. Only text frames are sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> ConnectFuture {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if ws_writer.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward frames until close or error
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let frame = match msg {
                        Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                        Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                    };
                    if in_tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            log::info!("WebSocket connected to {url}");
            Ok(Duplex {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// The far end of a [`MemoryConnector`] connection.
#[derive(Debug)]
pub struct RemoteEnd {
    pub url: String,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the client. Dropping it closes the connection.
    pub to_client: mpsc::UnboundedSender<Frame>,
}

impl RemoteEnd {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).is_ok()
    }
}

/// In-process transport: each `connect` hands its remote end to whoever
/// holds the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: AtomicBool::new(false),
            },
            accept_rx,
        )
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    fn is_refusing(&self) -> bool {
        self.refuse.load(Ordering::Relaxed)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> ConnectFuture {
        let url = url.to_string();
        if self.is_refusing() {
            return Box::pin(async move { Err(TransportError::Refused(url)) });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let remote = RemoteEnd {
            url: url.clone(),
            from_client: out_rx,
            to_client: in_tx,
        };
        let accepted = self.accept_tx.send(remote).is_ok();

        Box::pin(async move {
            if !accepted {
                return Err(TransportError::Refused(url));
            }
            Ok(Duplex {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}
