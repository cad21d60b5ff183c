//! Durable side of replication: the operation log, compaction snapshots
//! and the connection-edge table.
//!
//! ```text
//! ┌──────────────┐  append / query   ┌──────────────────────────────┐
//! │ BoardReplica │ ────────────────▸ │ OperationLog                 │
//! │              │  insert / latest  │ SnapshotStore                │
//! │              │ ────────────────▸ │ ConnectionEdgeStore          │
//! └──────────────┘                   └──────┬───────────────┬───────┘
//!                                           │               │
//!                                     MemoryBackend    RocksBackend
//!                                     (tests, demos)   (LZ4 + CFs)
//! ```
//!
//! Timestamps are assigned by the store from a monotonic `ServerClock`, so
//! two operations on a board never share a timestamp and replay after a
//! snapshot (`timestamp > created_at`) is exact.

pub mod memory;
pub mod rocks;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use easel_core::{now_millis, BoardSnapshot, Connection, Operation, Timestamp};

pub use memory::MemoryBackend;
pub use rocks::{BoardMetadata, RocksBackend, StoreConfig};

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backend could not be reached; retry later.
    Unavailable(String),
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl StoreError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::DatabaseError(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Record not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ─── Traits ──────────────────────────────────────────────────────────

/// Append-only log of deltas per board.
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Persist a delta.  `timestamp` is the author's clock; the stored
    /// record carries the store-assigned timestamp, which is returned.
    async fn append(
        &self,
        board_id: Uuid,
        author_id: Uuid,
        delta: &[u8],
        timestamp: Timestamp,
    ) -> Result<Operation, StoreError>;

    /// Every operation with `timestamp > since`, oldest first.
    async fn query(&self, board_id: Uuid, since: Timestamp) -> Result<Vec<Operation>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a full-state snapshot.  `covers` is the timestamp of the
    /// newest operation folded into `state` and becomes `created_at`.
    async fn insert(
        &self,
        board_id: Uuid,
        state: Vec<u8>,
        size: usize,
        author_id: Uuid,
        covers: Timestamp,
    ) -> Result<BoardSnapshot, StoreError>;

    /// The snapshot with the greatest `created_at`, if any.
    async fn latest(&self, board_id: Uuid) -> Result<Option<BoardSnapshot>, StoreError>;
}

/// Connection records scoped by board.  All writes are idempotent so an
/// at-least-once retry is harmless.
#[async_trait]
pub trait ConnectionEdgeStore: Send + Sync {
    async fn insert(&self, connection: &Connection) -> Result<(), StoreError>;

    /// Replace an existing record; `NotFound` if there is none.
    async fn update(&self, connection: &Connection) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, board_id: Uuid, id: Uuid) -> Result<bool, StoreError>;

    async fn list(&self, board_id: Uuid) -> Result<Vec<Connection>, StoreError>;
}

// ─── Clock ───────────────────────────────────────────────────────────

/// Strictly increasing millisecond clock.  Never goes backwards even if
/// the wall clock does.
#[derive(Debug, Default)]
pub struct ServerClock {
    last: AtomicU64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after `last` (recovered from disk).
    pub fn starting_after(last: Timestamp) -> Self {
        Self { last: AtomicU64::new(last) }
    }

    /// Issue the next timestamp: the largest of the wall clock, the
    /// caller's hint and one past the previous stamp.
    pub fn stamp(&self, hint: Timestamp) -> Timestamp {
        let floor = now_millis().max(hint);
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = floor.max(prev + 1);
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Most recent timestamp issued.
    pub fn last(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }
}
