//! quire-relay: WebSocket relay for Quire documents.
//!
//! Usage: `quire-relay [ADDR]`. The bind address falls back to
//! `QUIRE_RELAY_ADDR`, then to `127.0.0.1:8080`. Set `RUST_LOG=info` for
//! connection logs.

use log::info;
use quire_collab::server::{RelayServer, ServerConfig};

const ADDR_ENV: &str = "QUIRE_RELAY_ADDR";

fn bind_addr(arg: Option<String>, env: Option<String>) -> String {
    arg.or(env)
        .filter(|addr| !addr.trim().is_empty())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: bind_addr(std::env::args().nth(1), std::env::var(ADDR_ENV).ok()),
        ..ServerConfig::default()
    };
    info!(
        "Starting relay on {} (max frame {} bytes, peer buffer {})",
        config.bind_addr, config.max_message_bytes, config.peer_channel_capacity
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
