//! Persistence integration tests.
//!
//! Verifies:
//! - The store clock resumes past the newest stamp after a reopen
//! - A replica rebuilds a board from snapshot + log after a restart
//! - Connection edges survive a reopen, including updates and deletes
//! - Boards stay isolated on disk

use std::sync::Arc;

use easel_collab::{
    BoardReplica, ConnectionEdgeStore, LocalTransport, OperationLog, ReplicaConfig, RocksBackend,
    RoomManager, SnapshotStore, StoreConfig,
};
use easel_core::{AnchorSide, Node};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(dir: &tempfile::TempDir) -> Arc<RocksBackend> {
    Arc::new(RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
}

async fn replica(rooms: &RoomManager, board: Uuid, backend: &Arc<RocksBackend>, name: &str) -> BoardReplica {
    let config = ReplicaConfig::for_testing(board, name);
    let link = Arc::new(LocalTransport::join(rooms, board, config.peer.peer_id).await);
    let mut replica = BoardReplica::new(config, link, backend.clone());
    replica.connect().await.unwrap();
    replica
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clock_resumes_after_reopen() {
    let dir = tempdir().unwrap();
    let board = Uuid::new_v4();

    let last = {
        let store = open(&dir);
        let mut last = 0;
        for i in 0..3u8 {
            last = store.append(board, Uuid::new_v4(), &[i], 0).await.unwrap().timestamp;
        }
        last
    };

    let store = open(&dir);
    // A hint far in the past must not reuse an old stamp.
    let op = store.append(board, Uuid::new_v4(), &[3], 1).await.unwrap();
    assert!(op.timestamp > last);

    let ops = store.query(board, 0).await.unwrap();
    assert_eq!(ops.iter().map(|o| o.delta[0]).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(store.metadata(board).unwrap().unwrap().op_count, 4);
}

#[tokio::test]
async fn test_replica_rebuilds_board_after_restart() {
    let dir = tempdir().unwrap();
    let board = Uuid::new_v4();
    let rooms = RoomManager::new(64);

    let (digest, ids) = {
        let backend = open(&dir);
        let mut alice = replica(&rooms, board, &backend, "Alice").await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let node = Node::rectangle(200.0 * i as f32, 0.0, 100.0, 100.0);
            ids.push(node.id);
            alice.add_node(node).await.unwrap();
        }
        alice.select(vec![ids[0]]).await;
        alice.begin_connection(&format!("{}-right", ids[0])).unwrap();
        alice.finish_connection(ids[1], AnchorSide::Left).await.unwrap();
        alice.compact().await.unwrap().expect("snapshot written");

        // Past the snapshot: only in the log.
        alice.remove_node(ids[3]).await.unwrap();
        alice.disconnect().await;
        (alice.document().content_digest(), ids)
    };

    let backend = open(&dir);
    assert!(backend.latest(board).await.unwrap().is_some());

    let bob = replica(&rooms, board, &backend, "Bob").await;
    assert_eq!(bob.document().content_digest(), digest);
    assert_eq!(bob.node_count(), 3);
    assert!(bob.node(ids[3]).is_none());
    assert_eq!(bob.connections().len(), 1);
    assert_eq!(ConnectionEdgeStore::list(&*backend, board).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_edge_changes_survive_reopen() {
    let dir = tempdir().unwrap();
    let board = Uuid::new_v4();
    let rooms = RoomManager::new(64);

    let (kept, dropped) = {
        let backend = open(&dir);
        let mut alice = replica(&rooms, board, &backend, "Alice").await;
        let nodes: Vec<Node> = (0..3).map(|i| Node::rectangle(300.0 * i as f32, 0.0, 80.0, 80.0)).collect();
        for node in &nodes {
            alice.add_node(node.clone()).await.unwrap();
        }

        alice.select(vec![nodes[0].id, nodes[1].id]).await;
        alice.begin_connection(&format!("{}-right", nodes[0].id)).unwrap();
        let mut kept = alice.finish_connection(nodes[1].id, AnchorSide::Left).await.unwrap();
        alice.begin_connection(&format!("{}-right", nodes[1].id)).unwrap();
        let dropped = alice.finish_connection(nodes[2].id, AnchorSide::Left).await.unwrap();

        kept.title = Some("depends on".into());
        alice.update_connection(kept.clone()).await.unwrap();
        alice.delete_connection(dropped.id).await.unwrap();
        (kept, dropped)
    };

    let backend = open(&dir);
    let edges = ConnectionEdgeStore::list(&*backend, board).await.unwrap();
    assert_eq!(edges, vec![kept.clone()]);
    assert!(!ConnectionEdgeStore::delete(&*backend, board, dropped.id).await.unwrap());
    assert!(ConnectionEdgeStore::list(&*backend, Uuid::new_v4()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_boards_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let rooms = RoomManager::new(64);
    let (one, two) = (Uuid::new_v4(), Uuid::new_v4());

    {
        let backend = open(&dir);
        let mut a = replica(&rooms, one, &backend, "A").await;
        let mut b = replica(&rooms, two, &backend, "B").await;
        a.add_node(Node::rectangle(0.0, 0.0, 10.0, 10.0)).await.unwrap();
        for i in 0..3 {
            b.add_node(Node::rectangle(20.0 * i as f32, 0.0, 10.0, 10.0)).await.unwrap();
        }
    }

    let backend = open(&dir);
    let mut boards = backend.list_boards().unwrap();
    boards.sort();
    let mut expected = vec![one, two];
    expected.sort();
    assert_eq!(boards, expected);

    assert_eq!(replica(&rooms, one, &backend, "C").await.node_count(), 1);
    assert_eq!(replica(&rooms, two, &backend, "D").await.node_count(), 3);
}
