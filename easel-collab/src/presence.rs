//! Presence side channel: who is on the board, where their cursor is and
//! what they have selected.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (rate-limited, 33ms by default)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   ChannelEvent::Presence
//! Remote PresenceRoom::handle_message()
//! ```
//!
//! Presence is never written to the operation log or to snapshots.  While
//! the replica is offline the room is suspended: nothing is emitted and the
//! remote roster is dropped.  `resume` re-announces the local user.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use easel_core::Point;

use crate::protocol::PeerInfo;

/// Default cursor broadcast interval (~30 updates per second).
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Colour
// ───────────────────────────────────────────────────────────────────

/// RGBA colour for a collaborator's cursor and selection outline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated colour derived from a user id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn from_array(c: [f32; 4]) -> Self {
        Self { r: c[0], g: c[1], b: c[2], a: c[3] }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence payloads carried by `ChannelEvent::Presence`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    Join {
        user_id: Uuid,
        user_name: String,
        user_color: CursorColor,
    },

    Leave {
        user_id: Uuid,
    },

    /// High frequency, rate-limited on the sending side.
    Cursor {
        user_id: Uuid,
        position: Point,
        /// Per-sender counter; stale updates are ignored.
        timestamp: u64,
    },

    Selection {
        user_id: Uuid,
        node_ids: Vec<Uuid>,
    },
}

impl AwarenessMessage {
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. } => *user_id,
            AwarenessMessage::Leave { user_id } => *user_id,
            AwarenessMessage::Cursor { user_id, .. } => *user_id,
            AwarenessMessage::Selection { user_id, .. } => *user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote peer state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub user_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Point>,
    pub selection: Vec<Uuid>,
    last_timestamp: u64,
}

impl PeerPresence {
    fn new(user_id: Uuid, name: String, color: CursorColor) -> Self {
        Self {
            user_id,
            name,
            color,
            cursor: None,
            selection: Vec::new(),
            last_timestamp: 0,
        }
    }

    fn placeholder(user_id: Uuid) -> Self {
        let short = user_id.to_string();
        Self::new(user_id, format!("Peer-{}", &short[..8]), CursorColor::from_uuid(user_id))
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state of one board as seen by the local user.
pub struct PresenceRoom {
    local: PeerInfo,
    peers: HashMap<Uuid, PeerPresence>,
    cursor_interval: Duration,
    last_cursor_broadcast: Option<Instant>,
    local_cursor: Option<Point>,
    local_selection: Vec<Uuid>,
    timestamp_counter: u64,
    suspended: bool,
}

impl PresenceRoom {
    /// A new room starts suspended; `resume` once the channel is up.
    pub fn new(local: PeerInfo, cursor_interval: Duration) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            cursor_interval,
            last_cursor_broadcast: None,
            local_cursor: None,
            local_selection: Vec::new(),
            timestamp_counter: 0,
            suspended: true,
        }
    }

    // ─── Incoming ────────────────────────────────────────────────────

    /// Apply a presence message from the channel.  Our own messages are
    /// ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        if msg.user_id() == self.local.peer_id {
            return;
        }

        match msg {
            AwarenessMessage::Join { user_id, user_name, user_color } => {
                let entry = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| PeerPresence::new(*user_id, user_name.clone(), *user_color));
                entry.name = user_name.clone();
                entry.color = *user_color;
            }

            AwarenessMessage::Leave { user_id } => {
                self.peers.remove(user_id);
            }

            AwarenessMessage::Cursor { user_id, position, timestamp } => {
                let peer = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| PeerPresence::placeholder(*user_id));
                if *timestamp >= peer.last_timestamp {
                    peer.cursor = Some(*position);
                    peer.last_timestamp = *timestamp;
                }
            }

            AwarenessMessage::Selection { user_id, node_ids } => {
                let peer = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| PeerPresence::placeholder(*user_id));
                peer.selection = node_ids.clone();
            }
        }
    }

    pub fn handle_peer_joined(&mut self, info: &PeerInfo) {
        if info.peer_id == self.local.peer_id {
            return;
        }
        self.peers.entry(info.peer_id).or_insert_with(|| {
            PeerPresence::new(info.peer_id, info.name.clone(), CursorColor::from_array(info.color))
        });
    }

    pub fn handle_peer_left(&mut self, peer_id: Uuid) {
        self.peers.remove(&peer_id);
    }

    /// Replace the roster with the channel's view of who is present.
    /// Known peers keep their cursor and selection.
    pub fn handle_sync(&mut self, roster: &[PeerInfo]) {
        let local = self.local.peer_id;
        self.peers.retain(|id, _| roster.iter().any(|p| p.peer_id == *id));
        for info in roster.iter().filter(|p| p.peer_id != local) {
            self.handle_peer_joined(info);
        }
    }

    // ─── Outgoing ────────────────────────────────────────────────────

    /// Record the local cursor.  Returns a message when one is due.
    pub fn update_local_cursor(&mut self, position: Point) -> Option<AwarenessMessage> {
        self.local_cursor = Some(position);
        if self.suspended {
            return None;
        }
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_interval {
                return None;
            }
        }
        Some(self.cursor_message(position))
    }

    /// Record the local selection.  Selection changes are never throttled.
    pub fn update_local_selection(&mut self, node_ids: Vec<Uuid>) -> Option<AwarenessMessage> {
        self.local_selection = node_ids.clone();
        if self.suspended {
            return None;
        }
        Some(AwarenessMessage::Selection {
            user_id: self.local.peer_id,
            node_ids,
        })
    }

    fn cursor_message(&mut self, position: Point) -> AwarenessMessage {
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Some(Instant::now());
        AwarenessMessage::Cursor {
            user_id: self.local.peer_id,
            position,
            timestamp: self.timestamp_counter,
        }
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.local.peer_id,
            user_name: self.local.name.clone(),
            user_color: CursorColor::from_array(self.local.color),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { user_id: self.local.peer_id }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Stop emitting and forget remote peers.
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.peers.clear();
    }

    /// Start emitting again.  Returns the messages that re-announce the
    /// local user: join, then the current selection and cursor.
    pub fn resume(&mut self) -> Vec<AwarenessMessage> {
        self.suspended = false;
        let mut out = vec![self.join_message()];
        if !self.local_selection.is_empty() {
            out.push(AwarenessMessage::Selection {
                user_id: self.local.peer_id,
                node_ids: self.local_selection.clone(),
            });
        }
        if let Some(position) = self.local_cursor {
            out.push(self.cursor_message(position));
        }
        out
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn local_cursor(&self) -> Option<Point> {
        self.local_cursor
    }

    pub fn local_selection(&self) -> &[Uuid] {
        &self.local_selection
    }
}

// ===================================================================
// Tests
// ===================================================================
