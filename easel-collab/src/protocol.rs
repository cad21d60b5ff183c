//! Binary frame format shared by the WebSocket transport and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ board_id │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` is the sender; frames generated by the relay itself carry the
//! nil id.  Delta payloads are raw CRDT updates and are never inspected on
//! the way through.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{AwarenessMessage, CursorColor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Incremental CRDT update
    Delta = 1,
    /// Cursor / selection / join / leave awareness
    Presence = 2,
    /// Peer joined the board (first frame of every session)
    PeerJoined = 3,
    /// Peer left the board
    PeerLeft = 4,
    /// Full roster, sent by the relay to a joining peer
    PresenceSync = 5,
    Ping = 6,
    Pong = 7,
    /// Sent by the relay when a peer fell behind and frames were dropped;
    /// `clock` carries how many.
    Resync = 8,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA colour for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Explicit id; the colour is derived from it.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id).to_array(),
        }
    }
}

/// Top-level frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub board_id: Uuid,
    /// Sender-local counter, informational only
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, board_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self { msg_type, peer_id, board_id, clock, payload }
    }

    pub fn delta(peer_id: Uuid, board_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, board_id, clock, update)
    }

    pub fn presence(peer_id: Uuid, board_id: Uuid, msg: &AwarenessMessage) -> Result<Self, ProtocolError> {
        let payload = msg.encode().map_err(ProtocolError::SerializationError)?;
        Ok(Self::new(MessageType::Presence, peer_id, board_id, 0, payload))
    }

    pub fn peer_joined(board_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = encode_payload(info)?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, board_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, board_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, board_id, 0, Vec::new())
    }

    /// Roster frame; sent by the relay, so the sender is nil.
    pub fn presence_sync(board_id: Uuid, peers: &[PeerInfo]) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&peers)?;
        Ok(Self::new(MessageType::PresenceSync, Uuid::nil(), board_id, 0, payload))
    }

    /// `missed` frames never reached this peer; it must catch up from the
    /// log.
    pub fn resync(board_id: Uuid, missed: u64) -> Self {
        Self::new(MessageType::Resync, Uuid::nil(), board_id, missed, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn awareness(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Presence)?;
        AwarenessMessage::decode(&self.payload).map_err(ProtocolError::DeserializationError)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    pub fn roster(&self) -> Result<Vec<PeerInfo>, ProtocolError> {
        self.expect(MessageType::PresenceSync)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == msg_type {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
