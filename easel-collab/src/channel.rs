//! Per-board pub/sub channel: the typed event set and the transport seam.
//!
//! ```text
//!   BoardReplica ──broadcast(ChannelEvent)──▸ Transport ──▸ other replicas
//!        ▲                                        │
//!        └────────── Subscription::try_recv ◂─────┘
//! ```
//!
//! Every event a replica can see is one of the `ChannelEvent` variants, so
//! handling is an exhaustive `match` rather than a set of string-keyed
//! callbacks.  A `Subscription` is owned by whoever subscribed and never
//! yields the subscriber's own frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A CRDT update produced by `author_id`.
    Delta { author_id: Uuid, payload: Vec<u8> },
    Presence(AwarenessMessage),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// Everyone currently tracked on the board.
    PresenceSync(Vec<PeerInfo>),
    /// Frames were dropped before reaching this subscriber.  Deltas may be
    /// missing; the subscriber has to catch up from durable storage.
    Resync { missed: u64 },
}

impl ChannelEvent {
    /// Frame this event for the wire.
    pub fn to_message(&self, board_id: Uuid, sender: Uuid) -> Result<SyncMessage, ProtocolError> {
        match self {
            ChannelEvent::Delta { author_id, payload } => {
                Ok(SyncMessage::delta(*author_id, board_id, 0, payload.clone()))
            }
            ChannelEvent::Presence(msg) => SyncMessage::presence(sender, board_id, msg),
            ChannelEvent::PeerJoined(info) => SyncMessage::peer_joined(board_id, info),
            ChannelEvent::PeerLeft(peer_id) => Ok(SyncMessage::peer_left(*peer_id, board_id)),
            ChannelEvent::PresenceSync(peers) => SyncMessage::presence_sync(board_id, peers),
            ChannelEvent::Resync { missed } => Ok(SyncMessage::resync(board_id, *missed)),
        }
    }

    /// Lift a frame into an event.  Heartbeats have no event form.
    pub fn from_message(msg: SyncMessage) -> Result<Option<Self>, ProtocolError> {
        let event = match msg.msg_type {
            MessageType::Delta => ChannelEvent::Delta {
                author_id: msg.peer_id,
                payload: msg.payload,
            },
            MessageType::Presence => ChannelEvent::Presence(msg.awareness()?),
            MessageType::PeerJoined => ChannelEvent::PeerJoined(msg.peer_info()?),
            MessageType::PeerLeft => ChannelEvent::PeerLeft(msg.peer_id),
            MessageType::PresenceSync => ChannelEvent::PresenceSync(msg.roster()?),
            MessageType::Resync => ChannelEvent::Resync { missed: msg.clock },
            MessageType::Ping | MessageType::Pong => return Ok(None),
        };
        Ok(Some(event))
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The channel is unreachable; the caller should queue and retry.
    Offline,
    /// The board is at its peer limit.
    RoomFull,
    Protocol(ProtocolError),
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Offline => write!(f, "Transport offline"),
            TransportError::RoomFull => write!(f, "Board is full"),
            TransportError::Protocol(e) => write!(f, "Protocol error: {e}"),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Subscription
// ───────────────────────────────────────────────────────────────────

enum Source {
    /// In-process hub: raw frames, filtered and decoded on receipt.
    Hub {
        rx: broadcast::Receiver<Arc<Vec<u8>>>,
        own_id: Uuid,
        online: Arc<AtomicBool>,
    },
    /// Socket reader task pushes decoded events.
    Socket(mpsc::UnboundedReceiver<ChannelEvent>),
}

/// Owned receiving end of a board channel.
pub struct Subscription {
    source: Source,
}

impl Subscription {
    pub(crate) fn hub(rx: broadcast::Receiver<Arc<Vec<u8>>>, own_id: Uuid, online: Arc<AtomicBool>) -> Self {
        Self { source: Source::Hub { rx, own_id, online } }
    }

    pub(crate) fn socket(rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { source: Source::Socket(rx) }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        match &mut self.source {
            Source::Socket(rx) => rx.try_recv().ok(),
            Source::Hub { rx, own_id, online } => loop {
                match rx.try_recv() {
                    Ok(bytes) => {
                        if let Some(event) = lift(&bytes, *own_id, online) {
                            return Some(event);
                        }
                    }
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        if let Some(event) = lagged(n, online) {
                            return Some(event);
                        }
                    }
                    Err(_) => return None,
                }
            },
        }
    }

    /// Everything that is ready right now.
    pub fn drain(&mut self) -> Vec<ChannelEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Wait for the next event.  `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        match &mut self.source {
            Source::Socket(rx) => rx.recv().await,
            Source::Hub { rx, own_id, online } => loop {
                match rx.recv().await {
                    Ok(bytes) => {
                        if let Some(event) = lift(&bytes, *own_id, online) {
                            return Some(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if let Some(event) = lagged(n, online) {
                            return Some(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Overflowed frames become a `Resync`.  While partitioned the frames would
/// have been dropped anyway and reconnecting bootstraps from scratch.
fn lagged(missed: u64, online: &AtomicBool) -> Option<ChannelEvent> {
    if !online.load(Ordering::Acquire) {
        return None;
    }
    log::warn!("Subscription lagged by {missed} frames, requesting resync");
    Some(ChannelEvent::Resync { missed })
}

/// Decode a hub frame, dropping our own frames and anything that arrives
/// while partitioned.
fn lift(bytes: &[u8], own_id: Uuid, online: &AtomicBool) -> Option<ChannelEvent> {
    if !online.load(Ordering::Acquire) {
        return None;
    }
    let msg = match SyncMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {e}");
            return None;
        }
    };
    if msg.peer_id == own_id {
        return None;
    }
    match ChannelEvent::from_message(msg) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {e}");
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// One board's channel as seen by one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// (Re-)establish the link.  Idempotent while connected.
    async fn open(&self) -> Result<(), TransportError>;

    /// Publish to every other subscriber of the board.
    async fn broadcast(&self, event: &ChannelEvent) -> Result<(), TransportError>;

    async fn subscribe(&self) -> Result<Subscription, TransportError>;

    /// Announce `peer` as present; the channel answers with a
    /// `PresenceSync`.
    async fn track(&self, peer: &PeerInfo) -> Result<(), TransportError>;

    async fn untrack(&self, peer_id: Uuid) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
