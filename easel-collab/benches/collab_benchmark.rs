use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use easel_collab::{
    AwarenessMessage, BoardReplica, BroadcastGroup, LocalTransport, MemoryBackend, OperationLog,
    OutboundQueue, PeerInfo, PendingWrite, PresenceRoom, ReplicaConfig, RoomManager,
    SnapshotStore, SyncMessage,
};
use easel_core::{Node, Point, ReplicatedDocument};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let board = Uuid::new_v4();
    let delta = vec![0u8; 64]; // Typical single-node delta

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(
                black_box(peer),
                black_box(board),
                black_box(1),
                black_box(delta.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("Peer{i}"));
                    receivers.push(group.add_peer(peer, 100).await.unwrap());
                }

                let data = Arc::new(vec![0u8; 64]);
                black_box(group.broadcast_raw(black_box(data)));
            });
        })
    });
}

fn bench_presence_cursor_1000(c: &mut Criterion) {
    let peers: Vec<Uuid> = (0..1000).map(|_| Uuid::new_v4()).collect();

    c.bench_function("presence_handle_1000_cursors", |b| {
        let mut room = PresenceRoom::new(PeerInfo::new("Local"), Duration::ZERO);
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            for (i, user_id) in peers.iter().enumerate() {
                room.handle_message(&AwarenessMessage::Cursor {
                    user_id: *user_id,
                    position: Point::new(i as f32, ts as f32),
                    timestamp: ts,
                });
            }
            black_box(room.peer_count());
        })
    });
}

fn bench_outbound_queue(c: &mut Criterion) {
    c.bench_function("outbound_queue_push_pop_1000", |b| {
        b.iter(|| {
            let mut queue = OutboundQueue::new(10_000);
            for i in 0..1000u64 {
                queue.push(PendingWrite::delta(vec![0u8; 64], i));
            }
            while let Some(write) = queue.pop() {
                black_box(write);
            }
        })
    });
}

fn bench_memory_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemoryBackend::new();
    let (board, author) = (Uuid::new_v4(), Uuid::new_v4());
    let delta = vec![0u8; 64];

    c.bench_function("memory_log_append", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(store.append(board, author, black_box(&delta), 0).await.unwrap());
            });
        })
    });
}

/// Snapshot of 500 nodes plus 100 trailing ops, replayed by a fresh replica.
fn bench_bootstrap(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let board = Uuid::new_v4();
    let author = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());

    rt.block_on(async {
        let mut doc = ReplicatedDocument::new();
        for i in 0..500 {
            doc.upsert_node(&Node::rectangle((i % 25) as f32 * 120.0, (i / 25) as f32 * 120.0, 100.0, 80.0))
                .unwrap();
        }
        let state = doc.encode_state();
        let size = state.len() as u64;
        SnapshotStore::insert(&*backend, board, state, size, author, 0).await.unwrap();
        for i in 0..100 {
            let delta = doc.upsert_node(&Node::rectangle(i as f32 * 10.0, 5_000.0, 50.0, 50.0)).unwrap();
            backend.append(board, author, &delta, 0).await.unwrap();
        }
    });

    let rooms = RoomManager::new(256);
    c.bench_function("bootstrap_500_nodes_plus_100_ops", |b| {
        b.iter(|| {
            rt.block_on(async {
                let config = ReplicaConfig::for_testing(board, "Bench");
                let link = Arc::new(LocalTransport::join(&rooms, board, config.peer.peer_id).await);
                let mut replica = BoardReplica::new(config, link, backend.clone());
                replica.connect().await.unwrap();
                black_box(replica.node_count());
                replica.disconnect().await;
            });
        })
    });
}

fn bench_local_add_node(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let board = Uuid::new_v4();
    let rooms = RoomManager::new(4096);
    let mut replica = rt.block_on(async {
        let config = ReplicaConfig::for_testing(board, "Bench");
        let link = Arc::new(LocalTransport::join(&rooms, board, config.peer.peer_id).await);
        let mut replica = BoardReplica::new(config, link, Arc::new(MemoryBackend::new()));
        replica.connect().await.unwrap();
        replica
    });

    let mut i = 0u32;
    c.bench_function("replica_add_node", |b| {
        b.iter(|| {
            i += 1;
            let node = Node::rectangle((i % 100) as f32 * 120.0, (i / 100) as f32 * 120.0, 100.0, 80.0);
            rt.block_on(replica.add_node(black_box(node))).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_broadcast_raw,
    bench_presence_cursor_1000,
    bench_outbound_queue,
    bench_memory_append,
    bench_bootstrap,
    bench_local_add_node,
);
criterion_main!(benches);
