//! In-memory backend implementing all three storage traits.
//!
//! Shared between replicas through an `Arc` so a test can stand up a
//! whole board in one process.  Failures can be injected per concern to
//! exercise the retry queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use easel_core::{BoardSnapshot, Connection, Operation, Timestamp};

use super::{ConnectionEdgeStore, OperationLog, ServerClock, SnapshotStore, StoreError};

#[derive(Default)]
struct Faults {
    appends: AtomicUsize,
    snapshots: AtomicUsize,
    edges: AtomicUsize,
    down: AtomicBool,
}

impl Faults {
    fn check(&self, counter: &AtomicUsize, what: &str) -> Result<(), StoreError> {
        if self.down.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable(format!("{what}: backend down")));
        }
        let injected = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Unavailable(format!("{what}: injected failure")))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    clock: ServerClock,
    operations: RwLock<HashMap<Uuid, Vec<Operation>>>,
    snapshots: RwLock<HashMap<Uuid, Vec<BoardSnapshot>>>,
    edges: RwLock<HashMap<Uuid, BTreeMap<Uuid, Connection>>>,
    faults: Faults,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Fault injection ─────────────────────────────────────────────

    /// Fail the next `n` appends with `Unavailable`.
    pub fn fail_next_appends(&self, n: usize) {
        self.faults.appends.store(n, Ordering::Release);
    }

    pub fn fail_next_snapshots(&self, n: usize) {
        self.faults.snapshots.store(n, Ordering::Release);
    }

    pub fn fail_next_edge_writes(&self, n: usize) {
        self.faults.edges.store(n, Ordering::Release);
    }

    /// Take the whole backend down (or bring it back).
    pub fn set_available(&self, available: bool) {
        self.faults.down.store(!available, Ordering::Release);
    }

    // ─── Inspection ──────────────────────────────────────────────────

    pub async fn operation_count(&self, board_id: Uuid) -> usize {
        self.operations.read().await.get(&board_id).map_or(0, Vec::len)
    }

    pub async fn snapshot_count(&self, board_id: Uuid) -> usize {
        self.snapshots.read().await.get(&board_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl OperationLog for MemoryBackend {
    async fn append(
        &self,
        board_id: Uuid,
        author_id: Uuid,
        delta: &[u8],
        timestamp: Timestamp,
    ) -> Result<Operation, StoreError> {
        self.faults.check(&self.faults.appends, "append")?;
        // Stamp under the lock so log order matches timestamp order.
        let mut ops = self.operations.write().await;
        let op = Operation {
            board_id,
            author_id,
            delta: delta.to_vec(),
            timestamp: self.clock.stamp(timestamp),
        };
        ops.entry(board_id).or_default().push(op.clone());
        Ok(op)
    }

    async fn query(&self, board_id: Uuid, since: Timestamp) -> Result<Vec<Operation>, StoreError> {
        if self.faults.down.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("query: backend down".into()));
        }
        let ops = self.operations.read().await;
        Ok(ops
            .get(&board_id)
            .map(|log| log.iter().filter(|op| op.timestamp > since).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotStore for MemoryBackend {
    async fn insert(
        &self,
        board_id: Uuid,
        state: Vec<u8>,
        size: usize,
        author_id: Uuid,
        covers: Timestamp,
    ) -> Result<BoardSnapshot, StoreError> {
        self.faults.check(&self.faults.snapshots, "snapshot")?;
        let snapshot = BoardSnapshot {
            board_id,
            state,
            size,
            author_id,
            created_at: covers,
        };
        self.snapshots
            .write()
            .await
            .entry(board_id)
            .or_default()
            .push(snapshot.clone());
        Ok(snapshot)
    }

    async fn latest(&self, board_id: Uuid) -> Result<Option<BoardSnapshot>, StoreError> {
        if self.faults.down.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("latest: backend down".into()));
        }
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(&board_id)
            .and_then(|list| list.iter().max_by_key(|s| s.created_at))
            .cloned())
    }
}

#[async_trait]
impl ConnectionEdgeStore for MemoryBackend {
    async fn insert(&self, connection: &Connection) -> Result<(), StoreError> {
        self.faults.check(&self.faults.edges, "edge insert")?;
        self.edges
            .write()
            .await
            .entry(connection.board_id)
            .or_default()
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn update(&self, connection: &Connection) -> Result<(), StoreError> {
        self.faults.check(&self.faults.edges, "edge update")?;
        let mut edges = self.edges.write().await;
        match edges.get_mut(&connection.board_id).and_then(|b| b.get_mut(&connection.id)) {
            Some(slot) => {
                *slot = connection.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(connection.id)),
        }
    }

    async fn delete(&self, board_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
        self.faults.check(&self.faults.edges, "edge delete")?;
        let mut edges = self.edges.write().await;
        Ok(edges.get_mut(&board_id).and_then(|b| b.remove(&id)).is_some())
    }

    async fn list(&self, board_id: Uuid) -> Result<Vec<Connection>, StoreError> {
        let edges = self.edges.read().await;
        Ok(edges
            .get(&board_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{AnchorRef, AnchorSide, ConnectionStyle, Point};

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    fn edge(board_id: Uuid) -> Connection {
        let end = |side| AnchorRef { node_id: uid(), side, point: Point::ZERO };
        Connection {
            id: uid(),
            board_id,
            from: end(AnchorSide::Right),
            to: end(AnchorSide::Left),
            path: vec![Point::ZERO],
            style: ConnectionStyle::default(),
            title: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_append_query_since() {
        let store = MemoryBackend::new();
        let board = uid();
        let a = store.append(board, uid(), b"a", 0).await.unwrap();
        let b = store.append(board, uid(), b"b", 0).await.unwrap();
        assert!(b.timestamp > a.timestamp);

        let all = store.query(board, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        let after_a = store.query(board, a.timestamp).await.unwrap();
        assert_eq!(after_a, vec![b]);
        assert!(store.query(uid(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_append_failure() {
        let store = MemoryBackend::new();
        let board = uid();
        store.fail_next_appends(1);
        let err = store.append(board, uid(), b"x", 0).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.append(board, uid(), b"x", 0).await.is_ok());
        assert_eq!(store.operation_count(board).await, 1);
    }

    #[tokio::test]
    async fn test_latest_snapshot() {
        let store = MemoryBackend::new();
        let board = uid();
        assert!(store.latest(board).await.unwrap().is_none());
        SnapshotStore::insert(&store, board, vec![1], 1, uid(), 10).await.unwrap();
        SnapshotStore::insert(&store, board, vec![2], 1, uid(), 30).await.unwrap();
        SnapshotStore::insert(&store, board, vec![3], 1, uid(), 20).await.unwrap();
        assert_eq!(store.latest(board).await.unwrap().unwrap().state, vec![2]);
    }

    #[tokio::test]
    async fn test_edges_crud() {
        let store = MemoryBackend::new();
        let board = uid();
        let mut c = edge(board);
        assert_eq!(ConnectionEdgeStore::update(&store, &c).await.unwrap_err(), StoreError::NotFound(c.id));

        ConnectionEdgeStore::insert(&store, &c).await.unwrap();
        ConnectionEdgeStore::insert(&store, &c).await.unwrap();
        assert_eq!(store.list(board).await.unwrap().len(), 1);

        c.title = Some("depends on".into());
        ConnectionEdgeStore::update(&store, &c).await.unwrap();
        assert_eq!(store.list(board).await.unwrap()[0].title.as_deref(), Some("depends on"));

        assert!(store.delete(board, c.id).await.unwrap());
        assert!(!store.delete(board, c.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_down() {
        let store = MemoryBackend::new();
        store.set_available(false);
        assert!(store.query(uid(), 0).await.is_err());
        assert!(store.latest(uid()).await.is_err());
        store.set_available(true);
        assert!(store.query(uid(), 0).await.is_ok());
    }
}
