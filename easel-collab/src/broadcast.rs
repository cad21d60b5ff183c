//! Per-board fan-out with backpressure, and the in-process transport
//! built on it.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; a subscriber that falls further behind skips ahead
//! and is told how many frames it lost.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::channel::{ChannelEvent, Subscription, Transport, TransportError};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames sent while nobody was subscribed.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single board.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Track a peer and hand back a receiver for the board's frames.
    ///
    /// Fails with `RoomFull` once `max_peers` other peers are tracked.
    /// Re-tracking a known peer replaces its info.
    pub async fn add_peer(
        &self,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, TransportError> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&info.peer_id) && peers.len() >= max_peers {
            return Err(TransportError::RoomFull);
        }
        peers.insert(info.peer_id, info);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and fan out.  Returns the number of receivers reached,
    /// including the sender's own receiver if it has one.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Fan out pre-encoded bytes.  Lock-free.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(n) => n,
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Raw receiver without presence tracking.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps board ids to broadcast groups so boards never see each other's
/// traffic.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, board_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&board_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(board_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Drop the board's group if nobody is tracked on it.
    pub async fn remove_if_empty(&self, board_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(board_id) {
            if room.peer_count().await == 0 {
                rooms.remove(board_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process transport
// ───────────────────────────────────────────────────────────────────

/// `Transport` over a shared `RoomManager`, for replicas living in the
/// same process.  `set_online(false)` partitions this peer: sends fail
/// with `Offline` and frames addressed to it are lost.
pub struct LocalTransport {
    group: Arc<BroadcastGroup>,
    board_id: Uuid,
    peer_id: Uuid,
    max_peers: usize,
    online: Arc<AtomicBool>,
}

impl LocalTransport {
    pub async fn join(rooms: &RoomManager, board_id: Uuid, peer_id: Uuid) -> Self {
        Self {
            group: rooms.get_or_create(board_id).await,
            board_id,
            peer_id,
            max_peers: usize::MAX,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
        log::debug!("Peer {} is now {}", self.peer_id, if online { "online" } else { "offline" });
    }

    pub fn group(&self) -> &Arc<BroadcastGroup> {
        &self.group
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Offline)
        }
    }

    fn send(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        let msg = event.to_message(self.board_id, self.peer_id)?;
        self.group.broadcast(&msg)?;
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.ensure_online()
    }

    async fn broadcast(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        self.ensure_online()?;
        self.send(event)
    }

    async fn subscribe(&self) -> Result<Subscription, TransportError> {
        self.ensure_online()?;
        Ok(Subscription::hub(self.group.subscribe(), self.peer_id, self.online.clone()))
    }

    async fn track(&self, peer: &PeerInfo) -> Result<(), TransportError> {
        self.ensure_online()?;
        // The receiver is unused; subscriptions come from `subscribe`.
        drop(self.group.add_peer(peer.clone(), self.max_peers).await?);
        self.send(&ChannelEvent::PeerJoined(peer.clone()))?;
        let roster = self.group.peers().await;
        self.send(&ChannelEvent::PresenceSync(roster))
    }

    async fn untrack(&self, peer_id: Uuid) -> Result<(), TransportError> {
        if self.group.remove_peer(&peer_id).await.is_some() {
            // Best effort: a partitioned peer cannot say goodbye.
            if self.online.load(Ordering::Acquire) {
                self.send(&ChannelEvent::PeerLeft(peer_id))?;
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer, 10).await.unwrap();
        assert!(group.has_peer(&peer_id).await);

        group.remove_peer(&peer_id).await;
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let mut rx1 = group.add_peer(alice.clone(), 10).await.unwrap();
        let mut rx2 = group.add_peer(PeerInfo::new("Bob"), 10).await.unwrap();

        let msg = SyncMessage::delta(alice.peer_id, Uuid::new_v4(), 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_room_full() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let _a = group.add_peer(alice.clone(), 1).await.unwrap();
        assert_eq!(group.add_peer(PeerInfo::new("Bob"), 1).await.unwrap_err(), TransportError::RoomFull);
        // Re-joining is not a new seat.
        assert!(group.add_peer(alice, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_count_dropped() {
        let group = BroadcastGroup::new(16);
        let msg = SyncMessage::ping(Uuid::new_v4());
        group.broadcast(&msg).unwrap();
        let _rx = group.subscribe();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_room_manager_isolation_and_cleanup() {
        let manager = RoomManager::new(16);
        let (b1, b2) = (Uuid::new_v4(), Uuid::new_v4());
        let room1 = manager.get_or_create(b1).await;
        assert!(Arc::ptr_eq(&room1, &manager.get_or_create(b1).await));
        let _room2 = manager.get_or_create(b2).await;
        assert_eq!(manager.room_count().await, 2);

        let peer = PeerInfo::new("Alice");
        let _rx = room1.add_peer(peer.clone(), 10).await.unwrap();
        assert!(!manager.remove_if_empty(&b1).await);
        room1.remove_peer(&peer.peer_id).await;
        assert!(manager.remove_if_empty(&b1).await);
        assert_eq!(manager.active_boards().await, vec![b2]);
    }

    #[tokio::test]
    async fn test_local_transport_delivers_to_others() {
        let rooms = RoomManager::new(64);
        let board = Uuid::new_v4();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let a = LocalTransport::join(&rooms, board, a_id).await;
        let b = LocalTransport::join(&rooms, board, b_id).await;
        let mut a_sub = a.subscribe().await.unwrap();
        let mut b_sub = b.subscribe().await.unwrap();

        let event = ChannelEvent::Delta { author_id: a_id, payload: vec![7] };
        a.broadcast(&event).await.unwrap();

        assert_eq!(b_sub.try_recv(), Some(event));
        assert_eq!(a_sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_local_transport_track_sends_roster() {
        let rooms = RoomManager::new(64);
        let board = Uuid::new_v4();
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let a = LocalTransport::join(&rooms, board, alice.peer_id).await;
        let b = LocalTransport::join(&rooms, board, bob.peer_id).await;
        let mut a_sub = a.subscribe().await.unwrap();

        a.track(&alice).await.unwrap();
        b.track(&bob).await.unwrap();

        let events = a_sub.drain();
        assert!(events.contains(&ChannelEvent::PeerJoined(bob.clone())));
        let roster = events.iter().rev().find_map(|e| match e {
            ChannelEvent::PresenceSync(peers) => Some(peers.len()),
            _ => None,
        });
        assert_eq!(roster, Some(2));
    }

    #[tokio::test]
    async fn test_local_transport_offline() {
        let rooms = RoomManager::new(64);
        let t = LocalTransport::join(&rooms, Uuid::new_v4(), Uuid::new_v4()).await;
        t.set_online(false);
        assert!(!t.is_connected());
        let event = ChannelEvent::PeerLeft(Uuid::new_v4());
        assert_eq!(t.broadcast(&event).await.unwrap_err(), TransportError::Offline);
        assert!(t.subscribe().await.is_err());
        t.set_online(true);
        assert!(t.broadcast(&event).await.is_ok());
    }
}
