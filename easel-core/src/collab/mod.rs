//! Replicated board document backed by a Yrs CRDT.
//!
//! # Layout
//!
//! ```text
//!  Doc
//!   ├── Map "nodes"        node id → JSON(Node)
//!   └── Map "connections"  conn id → JSON(Connection)
//! ```
//!
//! Each entity is one map entry, so concurrent writes to the same entity
//! resolve last-writer-wins per entity while writes to different entities
//! always merge.  Every local mutation returns the binary v1 update it
//! produced; that delta is what gets broadcast and logged.
//!
//! # Framing
//!
//! Every blob leaving the document (delta, full state, state vector) is
//! sealed in a small frame:
//!
//! ```text
//!  ┌──────┬─────────┬──────────────────┬──────────────┐
//!  │ "EZ" │ version │ blake3[..8] (8B) │ yrs v1 bytes │
//!  └──────┴─────────┴──────────────────┴──────────────┘
//! ```
//!
//! The decoder never sees bytes whose checksum does not match, so a
//! truncated or bit-flipped blob is rejected as a whole instead of being
//! partially integrated.
//!
//! Merging is idempotent and commutative: applying the same delta twice, or
//! two independent deltas in either order, yields the same content.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::connection::Connection;
use crate::node::Node;

const NODES: &str = "nodes";
const CONNECTIONS: &str = "connections";

const FRAME_MAGIC: [u8; 2] = *b"EZ";
const FRAME_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + 1 + CHECKSUM_LEN;

// ---------------------------------------------------------------
// Errors
// ---------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    /// A remote delta or snapshot that cannot be decoded or integrated.
    #[error("Convergence anomaly: {0}")]
    ConvergenceAnomaly(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::ConvergenceAnomaly(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------
// ReplicatedDocument
// ---------------------------------------------------------------

pub struct ReplicatedDocument {
    doc: Doc,
    nodes: MapRef,
    connections: MapRef,
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let nodes = doc.get_or_insert_map(NODES);
        let connections = doc.get_or_insert_map(CONNECTIONS);
        Self { doc, nodes, connections }
    }

    /// Rebuild a document from a full-state blob (see [`encode_state`]).
    ///
    /// [`encode_state`]: Self::encode_state
    pub fn from_state(state: &[u8]) -> Result<Self, CollabError> {
        let mut doc = Self::new();
        doc.apply_remote(state)?;
        Ok(doc)
    }

    // ---------------------------------------------------------------
    // Local mutations (each returns its delta)
    // ---------------------------------------------------------------

    /// Insert or replace a node.
    pub fn upsert_node(&mut self, node: &Node) -> Result<Vec<u8>, CollabError> {
        let json = serde_json::to_string(node)?;
        let mut txn = self.doc.transact_mut();
        self.nodes.insert(&mut txn, node.id.to_string(), json);
        Ok(seal(txn.encode_update_v1()))
    }

    pub fn remove_node(&mut self, id: Uuid) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.nodes.remove(&mut txn, &id.to_string());
        seal(txn.encode_update_v1())
    }

    pub fn upsert_connection(&mut self, conn: &Connection) -> Result<Vec<u8>, CollabError> {
        let json = serde_json::to_string(conn)?;
        let mut txn = self.doc.transact_mut();
        self.connections.insert(&mut txn, conn.id.to_string(), json);
        Ok(seal(txn.encode_update_v1()))
    }

    pub fn remove_connection(&mut self, id: Uuid) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.connections.remove(&mut txn, &id.to_string());
        seal(txn.encode_update_v1())
    }

    // ---------------------------------------------------------------
    // Remote merge
    // ---------------------------------------------------------------

    /// Merge a delta produced by any replica.
    ///
    /// A damaged frame or undecodable update is rejected before any
    /// transaction is opened, so the document is left untouched.
    pub fn apply_remote(&mut self, delta: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(unseal(delta)?)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::ConvergenceAnomaly(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Sync encodings
    // ---------------------------------------------------------------

    /// Full document state, suitable for a snapshot.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        seal(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        seal(txn.state_vector().encode_v1())
    }

    /// Everything this replica has that the holder of `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(unseal(state_vector)?)?;
        let txn = self.doc.transact();
        Ok(seal(txn.encode_diff_v1(&sv)))
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub fn node(&self, id: Uuid) -> Option<Node> {
        let txn = self.doc.transact();
        let raw = json_of(self.nodes.get(&txn, &id.to_string()))?;
        match serde_json::from_str(&raw) {
            Ok(node) => Some(node),
            Err(e) => {
                log::warn!("Document: undecodable node {id}: {e}");
                None
            }
        }
    }

    /// All decodable nodes, in key order.
    pub fn nodes(&self) -> Vec<Node> {
        self.node_entries()
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<Node>(&raw) {
                Ok(node) => Some(node),
                Err(e) => {
                    log::warn!("Document: undecodable node {key}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Raw JSON of one node entry.
    pub fn node_entry(&self, id: Uuid) -> Option<String> {
        let txn = self.doc.transact();
        json_of(self.nodes.get(&txn, &id.to_string()))
    }

    /// Raw `id → json` entries of the node map.
    pub fn node_entries(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        entries(&self.nodes, &txn)
    }

    pub fn connection(&self, id: Uuid) -> Option<Connection> {
        let txn = self.doc.transact();
        let raw = json_of(self.connections.get(&txn, &id.to_string()))?;
        serde_json::from_str(&raw).ok()
    }

    pub fn connections(&self) -> Vec<Connection> {
        let txn = self.doc.transact();
        entries(&self.connections, &txn)
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<Connection>(&raw) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    log::warn!("Document: undecodable connection {key}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn node_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.nodes.len(&txn)
    }

    pub fn connection_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.connections.len(&txn)
    }

    /// Ordered view of the full content, for comparing replicas.
    pub fn content_digest(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        let mut out = BTreeMap::new();
        for (k, v) in entries(&self.nodes, &txn) {
            out.insert(format!("node:{k}"), v);
        }
        for (k, v) in entries(&self.connections, &txn) {
            out.insert(format!("connection:{k}"), v);
        }
        out
    }
}

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut sum = [0u8; CHECKSUM_LEN];
    sum.copy_from_slice(&blake3::hash(payload).as_bytes()[..CHECKSUM_LEN]);
    sum
}

fn seal(payload: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    frame
}

/// The payload of an intact frame.
fn unseal(frame: &[u8]) -> Result<&[u8], CollabError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(CollabError::ConvergenceAnomaly(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let (magic, rest) = frame.split_at(FRAME_MAGIC.len());
    if magic != FRAME_MAGIC {
        return Err(CollabError::ConvergenceAnomaly("bad frame magic".into()));
    }
    if rest[0] != FRAME_VERSION {
        return Err(CollabError::ConvergenceAnomaly(format!(
            "unsupported frame version {}",
            rest[0]
        )));
    }
    let (sum, payload) = rest[1..].split_at(CHECKSUM_LEN);
    if sum != checksum(payload) {
        return Err(CollabError::ConvergenceAnomaly("frame checksum mismatch".into()));
    }
    Ok(payload)
}

fn json_of(value: Option<Out>) -> Option<String> {
    match value {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn entries<T: ReadTxn>(map: &MapRef, txn: &T) -> BTreeMap<String, String> {
    map.iter(txn)
        .filter_map(|(k, v)| json_of(Some(v)).map(|json| (k.to_string(), json)))
        .collect()
}

// ===================================================================
// Tests
// ===================================================================
