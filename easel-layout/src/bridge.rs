//! Document → Store projection bridge
//!
//! Keeps a `SpatialStore` in step with a `ReplicatedDocument`.  Data flows
//! one way only:
//!
//! ```text
//!  local edit ──▸ ReplicatedDocument ◂── remote delta
//!                        │
//!          refresh() / refresh_nodes() diff
//!                        ▼
//!                 ProjectionBridge ──flush()──▸ SpatialStore
//!                        │
//!                   batch buffer
//! ```
//!
//! Local and remote changes take the same path, so a remote merge can
//! never be mistaken for a local edit and nothing needs an echo guard.
//! The store is disposable: `regenerate` rebuilds it from the document.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use uuid::Uuid;

use easel_core::{Node, ReplicatedDocument};

use crate::store::SpatialStore;

// ---------------------------------------------------------------
// Error types
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Undecodable node entry '{key}': {reason}")]
    Decode { key: String, reason: String },

    #[error("Node entry '{key}' holds node {found}")]
    KeyMismatch { key: String, found: Uuid },
}

// ---------------------------------------------------------------
// Projection ops
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOp {
    Upsert { key: String, json: String },
    Remove { key: String },
}

// ---------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------

/// One-way projection from document entries into the spatial store.
///
/// The bridge owns neither side; it borrows the document during
/// `refresh` and the store during `flush`.
pub struct ProjectionBridge {
    /// Last JSON seen per node key.
    projected: FxHashMap<String, String>,

    /// Operations waiting to be applied.
    pending: VecDeque<ProjectionOp>,

    /// Running count of ops processed (lifetime of the bridge).
    ops_processed: u64,
}

impl Default for ProjectionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionBridge {
    pub fn new() -> Self {
        Self {
            projected: FxHashMap::default(),
            pending: VecDeque::new(),
            ops_processed: 0,
        }
    }

    // ---------------------------------------------------------------
    // Ingress
    // ---------------------------------------------------------------

    /// Diff the whole document against what was last projected and buffer
    /// the difference.  Returns the number of ops enqueued.
    pub fn refresh(&mut self, doc: &ReplicatedDocument) -> usize {
        let entries = doc.node_entries();
        let before = self.pending.len();

        for (key, json) in &entries {
            self.stage_upsert(key, json);
        }

        let gone: Vec<String> = self
            .projected
            .keys()
            .filter(|k| !entries.contains_key(*k))
            .cloned()
            .collect();
        for key in gone {
            self.projected.remove(&key);
            self.pending.push_back(ProjectionOp::Remove { key });
        }

        self.pending.len() - before
    }

    /// Diff only `ids` against the document.  For edits that know which
    /// nodes they touched; anything else goes through [`refresh`].
    ///
    /// [`refresh`]: Self::refresh
    pub fn refresh_nodes(&mut self, doc: &ReplicatedDocument, ids: &[Uuid]) -> usize {
        let before = self.pending.len();
        for id in ids {
            let key = id.to_string();
            match doc.node_entry(*id) {
                Some(json) => self.stage_upsert(&key, &json),
                None => {
                    if self.projected.remove(&key).is_some() {
                        self.pending.push_back(ProjectionOp::Remove { key });
                    }
                }
            }
        }
        self.pending.len() - before
    }

    fn stage_upsert(&mut self, key: &str, json: &str) {
        if self.projected.get(key).map(String::as_str) == Some(json) {
            return;
        }
        self.projected.insert(key.to_string(), json.to_string());
        self.pending.push_back(ProjectionOp::Upsert {
            key: key.to_string(),
            json: json.to_string(),
        });
    }

    /// Number of buffered operations awaiting flush.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total operations processed over the lifetime of this bridge.
    #[inline]
    pub fn total_processed(&self) -> u64 {
        self.ops_processed
    }

    // ---------------------------------------------------------------
    // Flush (batch apply)
    // ---------------------------------------------------------------

    /// Apply **all** pending operations to the store.
    ///
    /// A bad entry is logged and counted; it never blocks the rest of the
    /// batch and never touches other nodes.
    pub fn flush(&mut self, store: &mut SpatialStore) -> FlushResult {
        let mut result = FlushResult::default();
        let total = self.pending.len();

        while let Some(op) = self.pending.pop_front() {
            match Self::apply_one(store, &op) {
                Ok(true) => result.applied += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => {
                    log::warn!("Bridge: convergence anomaly, entry dropped: {e}");
                    result.errors += 1;
                }
            }
        }

        self.ops_processed += total as u64;
        result.total = total;
        result
    }

    /// `refresh` followed by `flush`.
    pub fn sync(&mut self, doc: &ReplicatedDocument, store: &mut SpatialStore) -> FlushResult {
        self.refresh(doc);
        self.flush(store)
    }

    /// Throw the projection away and rebuild it from the document.
    pub fn regenerate(&mut self, doc: &ReplicatedDocument, store: &mut SpatialStore) -> FlushResult {
        self.projected.clear();
        self.pending.clear();
        store.clear();
        self.sync(doc, store)
    }

    /// Apply **one** operation.  Returns `true` if it mutated the store.
    fn apply_one(store: &mut SpatialStore, op: &ProjectionOp) -> Result<bool, BridgeError> {
        match op {
            ProjectionOp::Upsert { key, json } => {
                let node: Node = serde_json::from_str(json).map_err(|e| BridgeError::Decode {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                if node.id.to_string() != *key {
                    return Err(BridgeError::KeyMismatch {
                        key: key.clone(),
                        found: node.id,
                    });
                }
                store.upsert(node);
                Ok(true)
            }
            ProjectionOp::Remove { key } => {
                let id = Uuid::parse_str(key).map_err(|e| BridgeError::Decode {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok(store.remove_node(id).is_some())
            }
        }
    }
}

/// Result of a `flush()` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushResult {
    /// Total ops drained from the buffer.
    pub total: usize,
    /// Ops that mutated the store.
    pub applied: usize,
    /// Ops with nothing to do (e.g. removing an absent node).
    pub skipped: usize,
    /// Ops dropped as undecodable.
    pub errors: usize,
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{NodePatch, Point};

    fn rect(x: f32, y: f32) -> Node {
        Node::rectangle(x, y, 100.0, 100.0)
    }

    #[test]
    fn test_refresh_enqueues_new_nodes() {
        let mut doc = ReplicatedDocument::new();
        doc.upsert_node(&rect(0.0, 0.0)).unwrap();
        doc.upsert_node(&rect(200.0, 0.0)).unwrap();

        let mut bridge = ProjectionBridge::new();
        assert_eq!(bridge.refresh(&doc), 2);
        assert_eq!(bridge.pending_count(), 2);
        // Nothing changed since: nothing new to enqueue.
        assert_eq!(bridge.refresh(&doc), 0);
    }

    #[test]
    fn test_flush_projects_into_store() {
        let mut doc = ReplicatedDocument::new();
        let n = rect(0.0, 0.0);
        doc.upsert_node(&n).unwrap();

        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        let result = bridge.sync(&doc, &mut store);

        assert_eq!(result, FlushResult { total: 1, applied: 1, skipped: 0, errors: 0 });
        assert_eq!(store.get_node(n.id), Some(&n));
        assert_eq!(bridge.total_processed(), 1);
    }

    #[test]
    fn test_updates_and_removals_follow_document() {
        let mut doc = ReplicatedDocument::new();
        let a = rect(0.0, 0.0);
        let b = rect(500.0, 0.0);
        doc.upsert_node(&a).unwrap();
        doc.upsert_node(&b).unwrap();

        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        bridge.sync(&doc, &mut store);

        let moved = NodePatch::moved_to(50.0, 50.0).apply(&a).unwrap();
        doc.upsert_node(&moved).unwrap();
        doc.remove_node(b.id);

        let result = bridge.sync(&doc, &mut store);
        assert_eq!(result.applied, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_node(a.id).map(|n| n.transform.position), Some(Point::new(50.0, 50.0)));
        assert!(store.get_node(b.id).is_none());
    }

    #[test]
    fn test_refresh_nodes_diffs_only_named_ids() {
        let mut doc = ReplicatedDocument::new();
        let (a, b, c) = (rect(0.0, 0.0), rect(200.0, 0.0), rect(400.0, 0.0));
        for n in [&a, &b, &c] {
            doc.upsert_node(n).unwrap();
        }
        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        assert_eq!(bridge.refresh_nodes(&doc, &[a.id]), 1);
        bridge.flush(&mut store);
        assert!(store.contains(a.id));
        assert!(!store.contains(b.id));

        doc.remove_node(a.id);
        let moved = NodePatch::moved_to(250.0, 0.0).apply(&b).unwrap();
        doc.upsert_node(&moved).unwrap();
        // Only the named ids are looked at; b's move waits for a full refresh.
        assert_eq!(bridge.refresh_nodes(&doc, &[a.id, c.id, Uuid::new_v4()]), 2);
        let result = bridge.flush(&mut store);
        assert_eq!(result.applied, 2);
        assert!(!store.contains(a.id));
        assert!(store.contains(c.id));
        assert!(!store.contains(b.id));

        // A full refresh picks up the rest.
        assert_eq!(bridge.refresh(&doc), 1);
        bridge.flush(&mut store);
        assert_eq!(store.get_node(b.id).map(|n| n.transform.position), Some(Point::new(250.0, 0.0)));
    }

    #[test]
    fn test_remote_delta_reaches_store() {
        let mut author = ReplicatedDocument::new();
        let n = rect(10.0, 10.0);
        let delta = author.upsert_node(&n).unwrap();

        let mut replica = ReplicatedDocument::new();
        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        replica.apply_remote(&delta).unwrap();
        bridge.sync(&replica, &mut store);
        assert!(store.contains(n.id));
    }

    #[test]
    fn test_bad_entry_counted_and_others_applied() {
        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        let good = rect(0.0, 0.0);
        bridge.pending.push_back(ProjectionOp::Upsert {
            key: Uuid::new_v4().to_string(),
            json: "{not json".to_string(),
        });
        bridge.pending.push_back(ProjectionOp::Upsert {
            key: good.id.to_string(),
            json: serde_json::to_string(&good).unwrap(),
        });

        let result = bridge.flush(&mut store);
        assert_eq!(result.errors, 1);
        assert_eq!(result.applied, 1);
        assert!(store.contains(good.id));
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        let n = rect(0.0, 0.0);
        bridge.pending.push_back(ProjectionOp::Upsert {
            key: Uuid::new_v4().to_string(),
            json: serde_json::to_string(&n).unwrap(),
        });
        let result = bridge.flush(&mut store);
        assert_eq!(result.errors, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_regenerate_rebuilds_from_scratch() {
        let mut doc = ReplicatedDocument::new();
        for i in 0..5 {
            doc.upsert_node(&rect(i as f32 * 200.0, 0.0)).unwrap();
        }
        let mut store = SpatialStore::new();
        let mut bridge = ProjectionBridge::new();
        bridge.sync(&doc, &mut store);

        let result = bridge.regenerate(&doc, &mut store);
        assert_eq!(result.applied, 5);
        assert_eq!(store.len(), 5);
    }
}
