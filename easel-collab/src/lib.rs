//! # easel-collab: replication engine for Easel boards
//!
//! Turns local edits into deltas that are broadcast to every collaborator
//! on the board, appended to a durable log and periodically compacted into
//! snapshots.  Late joiners bootstrap from the newest snapshot plus the log
//! tail.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ChannelEvent    ┌──────────────┐
//! │ BoardReplica │ ◄───────────────► │ Transport    │  LocalTransport (in-process)
//! │ (per user)   │                   │ (per board)  │  WsTransport ⇄ RelayServer
//! └──────┬───────┘                   └──────────────┘
//!        │ append / query / insert / latest
//!        ▼
//! ┌──────────────────────────────────┐
//! │ OperationLog · SnapshotStore ·   │  MemoryBackend
//! │ ConnectionEdgeStore              │  RocksBackend (LZ4, column families)
//! └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire frames (bincode-encoded `SyncMessage`)
//! - [`channel`]: the typed `ChannelEvent` set, `Subscription`, `Transport`
//! - [`broadcast`]: per-board fan-out and the in-process transport
//! - [`presence`]: cursors, selections, rosters
//! - [`queue`]: outbound retry queue
//! - [`storage`]: operation log, snapshots, connection edges
//! - [`replica`]: `BoardReplica`
//! - [`client`] / [`server`]: WebSocket transport and relay
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode (1KB delta) | <500ns |
//! | Broadcast 1K frames × 100 peers | <10ms |
//! | Bootstrap (snapshot + 1K ops) | <50ms |
//! | Presence interval | 33ms |

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod replica;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, LocalTransport, RoomManager};
pub use channel::{ChannelEvent, Subscription, Transport, TransportError};
pub use client::WsTransport;
pub use config::ReplicaConfig;
pub use presence::{
    AwarenessMessage, CursorColor, PeerPresence, PresenceRoom, DEFAULT_PRESENCE_INTERVAL,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use queue::{OutboundQueue, PendingWrite};
pub use replica::{BoardReplica, PollSummary, ReplicaError, SyncStatus};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use storage::{
    BoardMetadata, ConnectionEdgeStore, MemoryBackend, OperationLog, RocksBackend, ServerClock,
    SnapshotStore, StoreConfig, StoreError,
};
