//! End-to-end tests: real relay, real WebSocket clients.
//!
//! Each test binds the relay to a free loopback port and drives every client
//! from the test task by polling, so catch-up requests get served while we
//! wait on another client.

use std::sync::Arc;
use std::time::Duration;

use quire_collab::client::{ClientConfig, CrdtClient};
use quire_collab::network::ConnectionStatus;
use quire_collab::server::{RelayServer, ServerConfig};
use quire_collab::storage::MemoryStore;
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Start a relay on a free port, return its URL.
async fn start_relay() -> (String, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(ServerConfig::for_testing()));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

fn client(url: &str, doc: &str, site: &str) -> CrdtClient {
    CrdtClient::with_websocket(ClientConfig::for_testing(url, doc, site), Arc::new(MemoryStore::new()))
}

/// Poll every client until `done` holds.
async fn pump_until(clients: &mut [CrdtClient], done: impl Fn(&[CrdtClient]) -> bool) {
    let result = timeout(Duration::from_secs(10), async {
        loop {
            for c in clients.iter_mut() {
                c.poll_events();
            }
            if done(clients) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if result.is_err() {
        let texts: Vec<String> = clients.iter().map(|c| c.text()).collect();
        panic!("clients did not settle: {texts:?}");
    }
}

fn all_online(clients: &[CrdtClient]) -> bool {
    clients.iter().all(|c| c.status() == ConnectionStatus::Online)
}

fn all_show(clients: &[CrdtClient], text: &str) -> bool {
    clients
        .iter()
        .all(|c| c.text() == text && c.editor_state().pending().is_empty())
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (url, _server) = start_relay().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_first_client_goes_live_alone() {
    let (url, server) = start_relay().await;
    let mut clients = vec![client(&url, "solo", "alice")];
    clients[0].connect();
    assert_eq!(clients[0].status(), ConnectionStatus::Connecting);

    pump_until(&mut clients, all_online).await;
    clients[0].insert_str(0, "hi");
    pump_until(&mut clients, |c| all_show(c, "hi")).await;

    let stats = server.stats().await;
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.relayed_ops, 2);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, _server) = start_relay().await;
    let mut clients = vec![client(&url, "doc", "alice")];
    clients[0].connect();
    pump_until(&mut clients, all_online).await;

    clients.push(client(&url, "doc", "bob"));
    clients[1].connect();
    pump_until(&mut clients, all_online).await;

    clients[0].insert_str(0, "hello");
    pump_until(&mut clients, |c| all_show(c, "hello")).await;

    // Concurrent edits in different gaps.
    clients[1].insert_at(5, '!');
    clients[0].insert_at(0, '>');
    pump_until(&mut clients, |c| all_show(c, ">hello!")).await;

    clients[1].delete_range(1, 5);
    pump_until(&mut clients, |c| all_show(c, ">!")).await;
    assert_eq!(clients[0].log_len(), clients[1].log_len());
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let (url, _server) = start_relay().await;
    let mut clients = vec![client(&url, "doc", "alice")];
    clients[0].connect();
    pump_until(&mut clients, all_online).await;

    clients[0].insert_str(0, "abc");
    clients[0].delete_at(1);
    pump_until(&mut clients, |c| all_show(c, "ac")).await;

    clients.push(client(&url, "doc", "carol"));
    clients[1].connect();
    pump_until(&mut clients, |c| all_online(c) && all_show(c, "ac")).await;
    assert_eq!(clients[1].log_len(), 4);
}

#[tokio::test]
async fn test_offline_edits_flush_on_reconnect() {
    let (url, _server) = start_relay().await;
    let mut clients = vec![client(&url, "doc", "alice")];
    clients[0].connect();
    pump_until(&mut clients, all_online).await;
    clients.push(client(&url, "doc", "bob"));
    clients[1].connect();
    pump_until(&mut clients, all_online).await;

    clients[0].insert_str(0, "123");
    pump_until(&mut clients, |c| all_show(c, "123")).await;

    clients[1].disconnect();
    assert_eq!(clients[1].status(), ConnectionStatus::Offline);
    clients[1].insert_str(3, "xyz");
    assert_eq!(clients[1].pending_count(), 3);
    clients[0].insert_at(0, '0');

    pump_until(&mut clients, |c| c[0].text() == "0123" && c[0].editor_state().pending().is_empty()).await;
    assert_eq!(clients[1].text(), "123xyz");

    clients[1].connect();
    pump_until(&mut clients, |c| all_online(c) && all_show(c, "0123xyz")).await;
    assert_eq!(clients[1].pending_count(), 0);
}

#[tokio::test]
async fn test_selective_undo_across_relay() {
    let (url, _server) = start_relay().await;
    let mut clients = vec![client(&url, "doc", "alice")];
    clients[0].connect();
    pump_until(&mut clients, all_online).await;
    clients.push(client(&url, "doc", "bob"));
    clients[1].connect();
    pump_until(&mut clients, all_online).await;

    clients[0].insert_at(0, 'A');
    pump_until(&mut clients, |c| all_show(c, "A")).await;
    clients[1].insert_at(1, 'B');
    pump_until(&mut clients, |c| all_show(c, "AB")).await;
    clients[0].insert_at(2, 'C');
    pump_until(&mut clients, |c| all_show(c, "ABC")).await;

    assert!(clients[0].undo());
    pump_until(&mut clients, |c| all_show(c, "AB")).await;

    assert!(clients[0].redo());
    pump_until(&mut clients, |c| all_show(c, "ABC")).await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (url, server) = start_relay().await;
    let mut clients = vec![client(&url, "one", "alice"), client(&url, "two", "bob")];
    for c in clients.iter_mut() {
        c.connect();
    }
    pump_until(&mut clients, all_online).await;

    clients[0].insert_str(0, "first");
    clients[1].insert_str(0, "second");
    pump_until(&mut clients, |c| {
        c[0].text() == "first"
            && c[1].text() == "second"
            && c.iter().all(|x| x.editor_state().pending().is_empty())
    })
    .await;

    assert_eq!(server.stats().await.active_rooms, 2);
}
