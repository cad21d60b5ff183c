//! WebSocket relay with per-board rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (board_id) ── BroadcastGroup ──┬── Client A
//! Client B ──┘                                        ├── Client B
//!                                                     └── Client C
//! ```
//!
//! The relay is stateless with respect to board content: it never decodes
//! deltas, only routes them.  Durability lives behind the replicas'
//! `OperationLog` / `SnapshotStore`, so a relay restart loses nothing but
//! presence.
//!
//! Each room keeps:
//! - a `BroadcastGroup` for fan-out to connected peers
//! - the roster of tracked peers, answered as a `PresenceSync` on join
//!
//! A peer whose outgoing queue overflows is sent a `Resync` frame with the
//! number of frames it lost, so its replica can catch up from the log.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::channel::TransportError;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
        }
    }

    /// Defaults overridden by `EASEL_RELAY_ADDR`, `EASEL_RELAY_CAPACITY`
    /// and `EASEL_MAX_PEERS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("EASEL_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = env_usize("EASEL_RELAY_CAPACITY") {
            config.broadcast_capacity = capacity.max(1);
        }
        if let Some(max_peers) = env_usize("EASEL_MAX_PEERS") {
            config.max_peers_per_room = max_peers;
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring {key}={raw}: {e}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Joins refused because the room was full.
    pub rejected_joins: u64,
    /// Resync frames sent to peers that fell behind.
    pub resyncs_sent: u64,
    pub active_rooms: usize,
}

/// Where a connection is in its life.
struct Session {
    peer_id: Uuid,
    board_id: Uuid,
    group: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::PeerJoined => {
                                    if session.is_some() {
                                        log::debug!("Duplicate join from {addr}");
                                        continue;
                                    }
                                    let info = sync_msg.peer_info()?;
                                    let board_id = sync_msg.board_id;
                                    let group = rooms.get_or_create(board_id).await;

                                    let rx = match group.add_peer(info.clone(), config.max_peers_per_room).await {
                                        Ok(rx) => rx,
                                        Err(TransportError::RoomFull) => {
                                            log::warn!("Board {board_id} is full, refusing {}", info.peer_id);
                                            stats.write().await.rejected_joins += 1;
                                            rooms.remove_if_empty(&board_id).await;
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        }
                                        Err(e) => return Err(e.into()),
                                    };

                                    // The joiner gets the roster; everyone else the join.
                                    let roster = SyncMessage::presence_sync(board_id, &group.peers().await)?;
                                    ws_sender.send(Message::Binary(roster.encode()?.into())).await?;
                                    group.broadcast_raw(Arc::new(bytes));

                                    stats.write().await.active_rooms = rooms.room_count().await;
                                    log::info!("Peer {} ({}) joined board {board_id}", info.name, info.peer_id);
                                    session = Some(Session { peer_id: info.peer_id, board_id, group, rx });
                                }

                                MessageType::Delta | MessageType::Presence => {
                                    let Some(s) = &session else {
                                        log::debug!("Frame from {addr} before join, dropped");
                                        continue;
                                    };
                                    if sync_msg.board_id != s.board_id {
                                        log::warn!("Peer {} sent a frame for another board", s.peer_id);
                                        continue;
                                    }
                                    if sync_msg.msg_type == MessageType::Presence {
                                        log_presence(&sync_msg, s.board_id);
                                    }
                                    s.group.broadcast_raw(Arc::new(bytes));
                                }

                                MessageType::PeerLeft => {
                                    if let Some(s) = session.take() {
                                        Self::leave(&rooms, &s).await;
                                        stats.write().await.active_rooms = rooms.room_count().await;
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.peer_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                MessageType::Pong | MessageType::PresenceSync | MessageType::Resync => {
                                    log::debug!("Ignoring {:?} from {addr}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                msg = async {
                    match session.as_mut() {
                        Some(s) => s.rx.recv().await,
                        // Not joined yet, wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo back to sender
                            let own = session.as_ref().map(|s| s.peer_id);
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if Some(sync_msg.peer_id) == own {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Dropped frames may include deltas; the client
                            // has to catch up from the log.
                            let Some(s) = &session else { continue };
                            log::warn!("Peer {} lagged by {n} messages, sending resync", s.peer_id);
                            let resync = SyncMessage::resync(s.board_id, n);
                            ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                            stats.write().await.resyncs_sent += 1;
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        if let Some(s) = session.take() {
            Self::leave(&rooms, &s).await;
        }
        let mut st = stats.write().await;
        st.active_connections -= 1;
        st.active_rooms = rooms.room_count().await;
        Ok(())
    }

    /// Untrack, tell the room, drop the room if it emptied.
    async fn leave(rooms: &RoomManager, session: &Session) {
        if session.group.remove_peer(&session.peer_id).await.is_some() {
            let leave_msg = SyncMessage::peer_left(session.peer_id, session.board_id);
            if let Err(e) = session.group.broadcast(&leave_msg) {
                log::warn!("Failed to announce departure of {}: {e}", session.peer_id);
            }
            log::info!("Peer {} left board {}", session.peer_id, session.board_id);
        }
        if rooms.remove_if_empty(&session.board_id).await {
            log::info!("Room {} removed (empty)", session.board_id);
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn log_presence(msg: &SyncMessage, board_id: Uuid) {
    match msg.awareness() {
        Ok(AwarenessMessage::Join { user_name, .. }) => {
            log::info!("Presence: {user_name} joined board {board_id}");
        }
        Ok(AwarenessMessage::Leave { user_id }) => {
            log::info!("Presence: {user_id} left board {board_id}");
        }
        Ok(AwarenessMessage::Cursor { .. }) => {
            log::trace!("Presence: cursor update on board {board_id}");
        }
        Ok(AwarenessMessage::Selection { user_id, node_ids }) => {
            log::debug!("Presence: {user_id} selected {} nodes on board {board_id}", node_ids.len());
        }
        Err(e) => log::warn!("Undecodable presence on board {board_id}: {e}"),
    }
}
