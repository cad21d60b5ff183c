//! Replica tuning.

use std::time::Duration;

use uuid::Uuid;

use crate::presence::DEFAULT_PRESENCE_INTERVAL;
use crate::protocol::PeerInfo;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub board_id: Uuid,
    /// Who this replica edits as.
    pub peer: PeerInfo,
    /// Writes held while offline before local edits are refused (default: 10,000)
    pub queue_capacity: usize,
    /// Quiet time after the last edit before `tick` compacts (default: 5s)
    pub compaction_debounce: Duration,
    /// Edits since the last snapshot before `tick` bothers (default: 50)
    pub compaction_min_edits: usize,
    /// Minimum gap between cursor broadcasts (default: 33ms)
    pub presence_interval: Duration,
}

impl ReplicaConfig {
    pub fn new(board_id: Uuid, peer: PeerInfo) -> Self {
        Self {
            board_id,
            peer,
            queue_capacity: 10_000,
            compaction_debounce: Duration::from_secs(5),
            compaction_min_edits: 50,
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
        }
    }

    /// No debounce and no throttling, so tests are deterministic.
    pub fn for_testing(board_id: Uuid, name: &str) -> Self {
        Self {
            compaction_debounce: Duration::ZERO,
            compaction_min_edits: 1,
            presence_interval: Duration::ZERO,
            ..Self::new(board_id, PeerInfo::new(name))
        }
    }
}
