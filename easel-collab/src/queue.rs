//! Outbound retry queue.
//!
//! Every local write lands here before any I/O.  `BoardReplica::flush`
//! works the queue front to back; a write leaves the queue only once all
//! of its effects have succeeded, and partial progress is recorded on the
//! entry so nothing is sent twice on the same path.

use std::collections::VecDeque;

use uuid::Uuid;

use easel_core::{Connection, Timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Delta {
        delta: Vec<u8>,
        /// Author clock at the time of the edit.
        timestamp: Timestamp,
        needs_broadcast: bool,
        needs_log: bool,
    },
    /// Mirror a connection into the edge table.
    EdgeUpsert(Connection),
    EdgeDelete { board_id: Uuid, id: Uuid },
}

impl PendingWrite {
    pub fn delta(delta: Vec<u8>, timestamp: Timestamp) -> Self {
        PendingWrite::Delta {
            delta,
            timestamp,
            needs_broadcast: true,
            needs_log: true,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            PendingWrite::Delta {
                needs_broadcast: false,
                needs_log: false,
                ..
            }
        )
    }
}

/// Bounded FIFO of writes not yet acknowledged.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<PendingWrite>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue.  Returns `false` (and drops nothing) when full.
    pub fn push(&mut self, write: PendingWrite) -> bool {
        if self.queue.len() >= self.capacity {
            log::warn!("Outbound queue full ({} writes)", self.capacity);
            return false;
        }
        self.queue.push_back(write);
        true
    }

    pub fn front(&self) -> Option<&PendingWrite> {
        self.queue.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut PendingWrite> {
        self.queue.front_mut()
    }

    pub fn pop(&mut self) -> Option<PendingWrite> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deltas still waiting for the broadcast leg.
    pub fn unbroadcast(&self) -> usize {
        self.queue
            .iter()
            .filter(|w| matches!(w, PendingWrite::Delta { needs_broadcast: true, .. }))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.queue.iter()
    }
}
