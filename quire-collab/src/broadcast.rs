//! Per-document rooms with bounded per-peer outbound channels.
//!
//! Every peer owns one `mpsc` receiver; rooms hold the senders. Sends never
//! block: a full channel counts as a failure, and a peer that fails
//! `drop_after_failures` times in a row is removed from its room. Once a
//! connection's last sender is gone its receiver ends, which closes it.
//!
//! Peers are kept in join order so that catch-up requests go to the
//! longest-connected peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Connection identifier assigned by the server.
pub type ConnId = u64;

/// A pre-encoded text frame shared across every recipient.
pub type SharedFrame = Arc<str>;

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub peers_dropped: u64,
}

/// Lock-free counters, read via [`RoomManager::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    peers_dropped: AtomicU64,
}

struct Peer {
    conn_id: ConnId,
    site_id: String,
    tx: mpsc::Sender<SharedFrame>,
    send_failures: u32,
}

/// Outcome of offering a frame to one peer.
enum Offer {
    Sent,
    Skipped,
    /// The peer must be removed.
    Drop,
}

/// One document's peers, in join order.
pub struct Room {
    doc_id: String,
    peers: Vec<Peer>,
    drop_after_failures: u32,
}

impl Room {
    pub fn new(doc_id: impl Into<String>, drop_after_failures: u32) -> Self {
        Self {
            doc_id: doc_id.into(),
            peers: Vec::new(),
            drop_after_failures,
        }
    }

    /// Register a connection. A repeat join updates its site id and keeps
    /// its place in the join order.
    pub fn join(&mut self, conn_id: ConnId, site_id: &str, tx: mpsc::Sender<SharedFrame>) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.conn_id == conn_id) {
            if peer.site_id != site_id {
                peer.site_id = site_id.to_string();
            }
            return;
        }
        self.peers.push(Peer {
            conn_id,
            site_id: site_id.to_string(),
            tx,
            send_failures: 0,
        });
    }

    pub fn leave(&mut self, conn_id: ConnId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.conn_id != conn_id);
        self.peers.len() != before
    }

    pub fn contains(&self, conn_id: ConnId) -> bool {
        self.peers.iter().any(|p| p.conn_id == conn_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn offer(peer: &mut Peer, frame: &SharedFrame, limit: u32) -> Offer {
        match peer.tx.try_send(frame.clone()) {
            Ok(()) => {
                peer.send_failures = 0;
                Offer::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                peer.send_failures += 1;
                if peer.send_failures >= limit {
                    Offer::Drop
                } else {
                    Offer::Skipped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Drop,
        }
    }

    /// Send to every peer, optionally skipping one connection.
    fn broadcast(&mut self, frame: &SharedFrame, exclude: Option<ConnId>, stats: &AtomicBroadcastStats) -> usize {
        let limit = self.drop_after_failures;
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for peer in self.peers.iter_mut() {
            if Some(peer.conn_id) == exclude {
                continue;
            }
            match Self::offer(peer, frame, limit) {
                Offer::Sent => delivered += 1,
                Offer::Skipped => {
                    stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Drop => {
                    stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    dropped.push(peer.conn_id);
                }
            }
        }
        stats.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        self.remove_dropped(&dropped, stats);
        delivered
    }

    /// Send to the longest-connected peer other than `exclude`. Stale
    /// connections of the excluded peer's own site are skipped too, since a
    /// client never serves its own join.
    fn send_to_oldest(&mut self, frame: &SharedFrame, exclude: ConnId, stats: &AtomicBroadcastStats) -> Option<ConnId> {
        let limit = self.drop_after_failures;
        let joiner_site = self
            .peers
            .iter()
            .find(|p| p.conn_id == exclude)
            .map(|p| p.site_id.clone());
        let peer = self
            .peers
            .iter()
            .find(|p| p.conn_id != exclude && joiner_site.as_deref() != Some(p.site_id.as_str()))?;
        let conn_id = peer.conn_id;
        self.deliver_one(conn_id, frame, limit, stats).then_some(conn_id)
    }

    /// Send to the peer registered under `site_id`.
    fn send_to_site(&mut self, site_id: &str, frame: &SharedFrame, stats: &AtomicBroadcastStats) -> bool {
        let limit = self.drop_after_failures;
        let Some(conn_id) = self
            .peers
            .iter()
            .rev()
            .find(|p| p.site_id == site_id)
            .map(|p| p.conn_id)
        else {
            return false;
        };
        self.deliver_one(conn_id, frame, limit, stats)
    }

    fn deliver_one(&mut self, conn_id: ConnId, frame: &SharedFrame, limit: u32, stats: &AtomicBroadcastStats) -> bool {
        let Some(peer) = self.peers.iter_mut().find(|p| p.conn_id == conn_id) else {
            return false;
        };
        match Self::offer(peer, frame, limit) {
            Offer::Sent => {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Offer::Skipped => {
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Offer::Drop => {
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.remove_dropped(&[conn_id], stats);
                false
            }
        }
    }

    fn remove_dropped(&mut self, dropped: &[ConnId], stats: &AtomicBroadcastStats) {
        for conn_id in dropped {
            if self.leave(*conn_id) {
                stats.peers_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropped unresponsive peer {conn_id} from doc {}", self.doc_id);
            }
        }
    }
}

/// Room manager: maps document ids to rooms.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    drop_after_failures: u32,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    pub fn new(drop_after_failures: u32) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            drop_after_failures,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register `conn_id` in the room for `doc_id`, creating it if needed.
    pub async fn join(&self, doc_id: &str, conn_id: ConnId, site_id: &str, tx: mpsc::Sender<SharedFrame>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Room::new(doc_id, self.drop_after_failures));
        room.join(conn_id, site_id, tx);
    }

    /// Remove `conn_id` from every room, deleting rooms left empty.
    pub async fn leave_all(&self, conn_id: ConnId) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut left = 0;
        rooms.retain(|doc_id, room| {
            if room.leave(conn_id) {
                left += 1;
            }
            if room.is_empty() {
                log::debug!("Room {doc_id} removed (empty)");
                false
            } else {
                true
            }
        });
        left
    }

    /// Fan `frame` out to the room. Returns how many peers received it.
    pub async fn broadcast(&self, doc_id: &str, frame: SharedFrame, exclude: Option<ConnId>) -> usize {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(doc_id) {
            Some(room) => room.broadcast(&frame, exclude, &self.stats),
            None => 0,
        }
    }

    /// Forward a join to one established peer, which serves the catch-up.
    pub async fn forward_join(&self, doc_id: &str, joiner: ConnId, frame: SharedFrame) -> Option<ConnId> {
        let mut rooms = self.rooms.write().await;
        rooms.get_mut(doc_id)?.send_to_oldest(&frame, joiner, &self.stats)
    }

    /// Deliver a targeted frame to the peer whose site id is `target`.
    pub async fn send_to_target(&self, doc_id: &str, target: &str, frame: SharedFrame) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(doc_id) {
            Some(room) => room.send_to_site(target, &frame, &self.stats),
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, doc_id: &str) -> usize {
        self.rooms.read().await.get(doc_id).map_or(0, Room::peer_count)
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Lock-free snapshot of the delivery counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            peers_dropped: self.stats.peers_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> SharedFrame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let manager = RoomManager::new(5);
        let (tx, _rx) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx.clone()).await;
        manager.join("doc", 1, "a", tx).await;
        assert_eq!(manager.peer_count("doc").await, 1);
        assert_eq!(manager.room_count().await, 1);

        assert_eq!(manager.leave_all(1).await, 1);
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(manager.leave_all(1).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_includes_sender() {
        let manager = RoomManager::new(5);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx1).await;
        manager.join("doc", 2, "b", tx2).await;

        assert_eq!(manager.broadcast("doc", frame("op"), None).await, 2);
        assert_eq!(&*rx1.recv().await.unwrap(), "op");
        assert_eq!(&*rx2.recv().await.unwrap(), "op");

        assert_eq!(manager.broadcast("doc", frame("x"), Some(1)).await, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(manager.broadcast("other", frame("x"), None).await, 0);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = RoomManager::new(5);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        manager.join("one", 1, "a", tx1).await;
        manager.join("two", 2, "b", tx2).await;

        manager.broadcast("one", frame("hello"), None).await;
        assert_eq!(&*rx1.recv().await.unwrap(), "hello");
        assert!(rx2.try_recv().is_err());

        let mut docs = manager.active_documents().await;
        docs.sort();
        assert_eq!(docs, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_forward_join_picks_oldest_peer() {
        let manager = RoomManager::new(5);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, _rx3) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx1).await;
        manager.join("doc", 2, "b", tx2).await;
        manager.join("doc", 3, "c", tx3).await;

        assert_eq!(manager.forward_join("doc", 3, frame("join")).await, Some(1));
        assert_eq!(&*rx1.recv().await.unwrap(), "join");
        assert!(rx2.try_recv().is_err());

        // The oldest peer asking again goes to the next one.
        assert_eq!(manager.forward_join("doc", 1, frame("join")).await, Some(2));
    }

    #[tokio::test]
    async fn test_forward_join_skips_own_stale_connection() {
        let manager = RoomManager::new(5);
        let (stale_tx, mut stale_rx) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, _rx3) = mpsc::channel(8);
        manager.join("doc", 1, "a", stale_tx).await;
        manager.join("doc", 2, "b", tx2).await;
        manager.join("doc", 3, "a", tx3).await;

        assert_eq!(manager.forward_join("doc", 3, frame("join")).await, Some(2));
        assert_eq!(&*rx2.recv().await.unwrap(), "join");
        assert!(stale_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_join_alone() {
        let manager = RoomManager::new(5);
        let (tx, _rx) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx).await;
        assert_eq!(manager.forward_join("doc", 1, frame("join")).await, None);
        assert_eq!(manager.forward_join("nope", 1, frame("join")).await, None);
    }

    #[tokio::test]
    async fn test_send_to_target() {
        let manager = RoomManager::new(5);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx1).await;
        manager.join("doc", 2, "b", tx2).await;

        assert!(manager.send_to_target("doc", "b", frame("sync")).await);
        assert_eq!(&*rx2.recv().await.unwrap(), "sync");
        assert!(rx1.try_recv().is_err());
        assert!(!manager.send_to_target("doc", "zed", frame("sync")).await);
    }

    #[tokio::test]
    async fn test_slow_peer_dropped_after_failures() {
        let manager = RoomManager::new(3);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        let (slow_tx, slow_rx) = mpsc::channel(1);
        manager.join("doc", 1, "fast", fast_tx).await;
        manager.join("doc", 2, "slow", slow_tx).await;

        // One frame fills the slow channel, three more fail.
        for i in 0..4 {
            manager.broadcast("doc", frame(&format!("m{i}")), None).await;
        }
        assert_eq!(manager.peer_count("doc").await, 1);
        for i in 0..4 {
            assert_eq!(&*fast_rx.recv().await.unwrap(), format!("m{i}"));
        }

        let stats = manager.stats();
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.peers_dropped, 1);
        drop(slow_rx);
    }

    #[tokio::test]
    async fn test_failures_reset_on_success() {
        let manager = RoomManager::new(2);
        let (tx, mut rx) = mpsc::channel(1);
        manager.join("doc", 1, "a", tx).await;

        manager.broadcast("doc", frame("1"), None).await;
        manager.broadcast("doc", frame("2"), None).await;
        rx.recv().await.unwrap();
        manager.broadcast("doc", frame("3"), None).await;
        rx.recv().await.unwrap();
        manager.broadcast("doc", frame("4"), None).await;
        manager.broadcast("doc", frame("5"), None).await;
        assert_eq!(manager.peer_count("doc").await, 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_dropped() {
        let manager = RoomManager::new(5);
        let (tx, rx) = mpsc::channel(8);
        manager.join("doc", 1, "a", tx).await;
        drop(rx);
        assert_eq!(manager.broadcast("doc", frame("x"), None).await, 0);
        assert_eq!(manager.peer_count("doc").await, 0);
    }
}
