//! Durable records: the operation log entry and the compaction snapshot.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch, assigned by the log store.
pub type Timestamp = u64;

/// Immutable log entry.  `timestamp` only bounds replay after a snapshot;
/// causal order comes from the CRDT merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub board_id: Uuid,
    pub author_id: Uuid,
    pub delta: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Full document state at `created_at`.  Replaying every operation with a
/// later timestamp on top of `state` yields the current board.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub board_id: Uuid,
    pub state: Vec<u8>,
    pub size: usize,
    pub author_id: Uuid,
    pub created_at: Timestamp,
}

/// Wall clock in milliseconds.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
