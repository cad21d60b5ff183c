//! The replication engine: one client's view of one board.
//!
//! ```text
//!  local edit ─▸ ReplicatedDocument ─▸ delta ─▸ OutboundQueue ─▸ append, then broadcast
//!                     │  ▲
//!                     │  └──── remote delta (Subscription) / snapshot + replay
//!                     ▼
//!             ProjectionBridge ─▸ SpatialStore (+ index) ─▸ queries, anchors
//! ```
//!
//! The document is upstream of everything.  Local and remote edits both
//! reach the store through the bridge, so a projected remote change can
//! never re-enter the outbound path.
//!
//! All I/O is async but the replica itself is single-owner (`&mut self`);
//! callers drive it cooperatively: local ops, `poll_events`, `tick`.
//!
//! A delta is appended to the log before it is broadcast.  A subscriber
//! that missed a broadcast (it joined late, or its channel overflowed)
//! can therefore always find the delta in the log, and catches up by
//! replaying the log past the newest operation it has merged.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use easel_core::{
    now_millis, AnchorSide, BoardSnapshot, Bounds, CanvasError, CollabError, Connection, Node,
    NodePatch, Point, ReplicatedDocument,
};
use easel_layout::{
    reroute, AnchorPoint, AnchorSet, ConnectError, ConnectionTool, PendingConnection,
    ProjectionBridge, SpatialStore,
};

use crate::channel::{ChannelEvent, Subscription, Transport, TransportError};
use crate::config::ReplicaConfig;
use crate::presence::{AwarenessMessage, PeerPresence, PresenceRoom};
use crate::queue::{OutboundQueue, PendingWrite};
use crate::storage::{ConnectionEdgeStore, OperationLog, SnapshotStore, StoreError};

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    /// Rejected local mutation; nothing changed.
    Canvas(CanvasError),
    Connect(ConnectError),
    UnknownAnchor(String),
    Transport(TransportError),
    Store(StoreError),
    Convergence(CollabError),
    /// Too many writes waiting for the network; the edit was not applied.
    QueueFull,
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::Canvas(e) => write!(f, "{e}"),
            ReplicaError::Connect(e) => write!(f, "Connection tool: {e}"),
            ReplicaError::UnknownAnchor(id) => write!(f, "Unknown anchor: {id}"),
            ReplicaError::Transport(e) => write!(f, "Transport: {e}"),
            ReplicaError::Store(e) => write!(f, "Store: {e}"),
            ReplicaError::Convergence(e) => write!(f, "{e}"),
            ReplicaError::QueueFull => write!(f, "Outbound queue is full"),
        }
    }
}

impl std::error::Error for ReplicaError {}

impl From<CanvasError> for ReplicaError {
    fn from(e: CanvasError) -> Self {
        ReplicaError::Canvas(e)
    }
}

impl From<ConnectError> for ReplicaError {
    fn from(e: ConnectError) -> Self {
        ReplicaError::Connect(e)
    }
}

impl From<TransportError> for ReplicaError {
    fn from(e: TransportError) -> Self {
        ReplicaError::Transport(e)
    }
}

impl From<StoreError> for ReplicaError {
    fn from(e: StoreError) -> Self {
        ReplicaError::Store(e)
    }
}

impl From<CollabError> for ReplicaError {
    fn from(e: CollabError) -> Self {
        ReplicaError::Convergence(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Status
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Offline,
    /// Connected, but bootstrap or a resync has not finished, or writes
    /// are queued.
    Syncing,
    Synced,
}

/// What one `poll_events` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub deltas_applied: usize,
    /// Deltas dropped as undecodable.
    pub anomalies: usize,
    pub presence_events: usize,
    /// Catch-ups from the log after the channel dropped frames.
    pub resyncs: usize,
}

// ───────────────────────────────────────────────────────────────────
// BoardReplica
// ───────────────────────────────────────────────────────────────────

pub struct BoardReplica {
    config: ReplicaConfig,
    doc: ReplicatedDocument,
    store: SpatialStore,
    bridge: ProjectionBridge,

    selection: Vec<Uuid>,
    anchors: AnchorSet,
    tool: ConnectionTool,
    presence: PresenceRoom,

    transport: Arc<dyn Transport>,
    subscription: Option<Subscription>,
    log: Arc<dyn OperationLog>,
    snapshots: Arc<dyn SnapshotStore>,
    edges: Arc<dyn ConnectionEdgeStore>,
    queue: OutboundQueue,

    connected: bool,
    bootstrapped: bool,
    /// `created_at` of the newest snapshot this replica has folded in.
    snapshot_floor: u64,
    /// Timestamp of the newest logged operation merged from storage.
    log_floor: u64,
    edits_since_compaction: usize,
    last_edit: Instant,
}

impl BoardReplica {
    /// A replica backed by one store implementing all three persistence
    /// traits.
    pub fn new<B>(config: ReplicaConfig, transport: Arc<dyn Transport>, backend: Arc<B>) -> Self
    where
        B: OperationLog + SnapshotStore + ConnectionEdgeStore + 'static,
    {
        Self::with_stores(config, transport, backend.clone(), backend.clone(), backend)
    }

    pub fn with_stores(
        config: ReplicaConfig,
        transport: Arc<dyn Transport>,
        log: Arc<dyn OperationLog>,
        snapshots: Arc<dyn SnapshotStore>,
        edges: Arc<dyn ConnectionEdgeStore>,
    ) -> Self {
        let presence = PresenceRoom::new(config.peer.clone(), config.presence_interval);
        Self {
            queue: OutboundQueue::new(config.queue_capacity),
            config,
            doc: ReplicatedDocument::new(),
            store: SpatialStore::new(),
            bridge: ProjectionBridge::new(),
            selection: Vec::new(),
            anchors: AnchorSet::new(),
            tool: ConnectionTool::new(),
            presence,
            transport,
            subscription: None,
            log,
            snapshots,
            edges,
            connected: false,
            bootstrapped: false,
            snapshot_floor: 0,
            log_floor: 0,
            edits_since_compaction: 0,
            last_edit: Instant::now(),
        }
    }

    #[inline]
    pub fn board_id(&self) -> Uuid {
        self.config.board_id
    }

    #[inline]
    pub fn peer_id(&self) -> Uuid {
        self.config.peer.peer_id
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.doc
    }

    // ─── Local node edits ────────────────────────────────────────────

    pub async fn add_node(&mut self, node: Node) -> Result<(), ReplicaError> {
        if self.store.contains(node.id) {
            return Err(CanvasError::DuplicateNode(node.id).into());
        }
        self.ensure_capacity(1)?;
        let id = node.id;
        let delta = self.doc.upsert_node(&node)?;
        self.commit(delta, None, &[id]).await
    }

    /// Patch a node.  A type change is rejected with `InvalidMutation`
    /// before anything is touched.
    pub async fn update_node(&mut self, id: Uuid, patch: &NodePatch) -> Result<(), ReplicaError> {
        let current = self.store.get_node(id).ok_or(CanvasError::NodeNotFound(id))?;
        let updated = patch.apply(current)?;
        self.ensure_capacity(1)?;
        let delta = self.doc.upsert_node(&updated)?;
        self.commit(delta, None, &[id]).await
    }

    /// Remove a node.  Connections touching it stay in the document and
    /// are left out of [`renderable_connections`](Self::renderable_connections).
    pub async fn remove_node(&mut self, id: Uuid) -> Result<(), ReplicaError> {
        if !self.store.contains(id) {
            return Err(CanvasError::NodeNotFound(id).into());
        }
        self.ensure_capacity(1)?;
        let delta = self.doc.remove_node(id);
        self.commit(delta, None, &[id]).await
    }

    // ─── Local connection edits ──────────────────────────────────────

    pub async fn add_connection(&mut self, connection: Connection) -> Result<(), ReplicaError> {
        if connection.from.node_id == connection.to.node_id {
            return Err(ConnectError::SameNode(connection.from.node_id).into());
        }
        for end in [connection.from.node_id, connection.to.node_id] {
            if !self.store.contains(end) {
                return Err(CanvasError::NodeNotFound(end).into());
            }
        }
        self.ensure_capacity(2)?;
        let delta = self.doc.upsert_connection(&connection)?;
        self.commit(delta, Some(PendingWrite::EdgeUpsert(connection)), &[]).await
    }

    /// Replace a connection's record (style, title, notes, endpoints).
    pub async fn update_connection(&mut self, connection: Connection) -> Result<(), ReplicaError> {
        if self.doc.connection(connection.id).is_none() {
            return Err(CanvasError::ConnectionNotFound(connection.id).into());
        }
        self.ensure_capacity(2)?;
        let delta = self.doc.upsert_connection(&connection)?;
        self.commit(delta, Some(PendingWrite::EdgeUpsert(connection)), &[]).await
    }

    pub async fn delete_connection(&mut self, id: Uuid) -> Result<(), ReplicaError> {
        if self.doc.connection(id).is_none() {
            return Err(CanvasError::ConnectionNotFound(id).into());
        }
        self.ensure_capacity(2)?;
        let delta = self.doc.remove_connection(id);
        let edge = PendingWrite::EdgeDelete { board_id: self.board_id(), id };
        self.commit(delta, Some(edge), &[]).await
    }

    fn ensure_capacity(&self, writes: usize) -> Result<(), ReplicaError> {
        if self.queue.len() + writes > self.queue.capacity() {
            return Err(ReplicaError::QueueFull);
        }
        Ok(())
    }

    /// Project a local delta, queue its side effects and try to send.
    /// Network and store failures leave the writes queued; the edit itself
    /// has already succeeded.
    async fn commit(
        &mut self,
        delta: Vec<u8>,
        edge: Option<PendingWrite>,
        touched: &[Uuid],
    ) -> Result<(), ReplicaError> {
        self.bridge.refresh_nodes(&self.doc, touched);
        self.settle();
        self.queue.push(PendingWrite::delta(delta, now_millis()));
        if let Some(edge) = edge {
            self.queue.push(edge);
        }
        self.edits_since_compaction += 1;
        self.last_edit = Instant::now();

        if let Err(e) = self.flush().await {
            log::warn!("Board {}: write queued for retry: {e}", self.board_id());
        }
        Ok(())
    }

    /// Bring the whole store in line with the document, after merges whose
    /// touched nodes are unknown.
    fn project(&mut self) {
        self.bridge.refresh(&self.doc);
        self.settle();
    }

    /// Apply staged projection ops and fix up everything derived from node
    /// geometry.
    fn settle(&mut self) {
        let result = self.bridge.flush(&mut self.store);
        if result.errors > 0 {
            log::warn!("Board {}: {} node entries failed to project", self.board_id(), result.errors);
        }

        let store = &self.store;
        self.selection.retain(|id| store.contains(*id));
        self.anchors
            .regenerate(self.selection.iter().filter_map(|id| store.get_node(*id)));

        let orphaned = self
            .tool
            .pending()
            .is_some_and(|p| !store.contains(p.from.node_id));
        if orphaned {
            log::debug!("Pending connection source vanished, cancelling");
            self.tool.cancel();
        }
    }

    // ─── Connection tool ─────────────────────────────────────────────

    /// Replace the selection and regenerate anchors for it.
    pub async fn select(&mut self, ids: Vec<Uuid>) {
        let store = &self.store;
        let ids: Vec<Uuid> = ids.into_iter().filter(|id| store.contains(*id)).collect();
        self.anchors
            .regenerate(ids.iter().filter_map(|id| store.get_node(*id)));
        self.selection = ids.clone();
        self.update_selection(ids).await;
    }

    pub fn selection(&self) -> &[Uuid] {
        &self.selection
    }

    pub fn begin_connection(&mut self, anchor_id: &str) -> Result<(), ReplicaError> {
        let anchor = self
            .anchors
            .get(anchor_id)
            .ok_or_else(|| ReplicaError::UnknownAnchor(anchor_id.to_string()))?;
        self.tool.start(anchor.to_ref())?;
        Ok(())
    }

    /// Preview path for the pointer, while connecting.
    pub fn move_pointer(&mut self, cursor: Point) -> Option<Vec<Point>> {
        self.tool.update_pointer(cursor).map(<[Point]>::to_vec)
    }

    /// Drop the pending connection on `side` of `target`.  The connection
    /// is routed, added to the document and mirrored to the edge store.
    ///
    /// On any error the pending connection is kept, so the user can pick
    /// another target or cancel.
    pub async fn finish_connection(
        &mut self,
        target: Uuid,
        side: AnchorSide,
    ) -> Result<Connection, ReplicaError> {
        let bounds = self
            .store
            .bounds_of(target)
            .ok_or(CanvasError::NodeNotFound(target))?;
        let to = AnchorPoint::new(target, side, &bounds).to_ref();
        let connection = self.tool.build(to, self.board_id())?;
        self.add_connection(connection.clone()).await?;
        self.tool.finish();
        Ok(connection)
    }

    /// Pointer released over empty canvas.
    pub fn release_connection(&mut self) -> bool {
        self.tool.release_over_empty()
    }

    pub fn cancel_connection(&mut self) -> bool {
        self.tool.cancel()
    }

    pub fn pending_connection(&self) -> Option<&PendingConnection> {
        self.tool.pending()
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.store.get_node(id)
    }

    pub fn nodes(&self) -> Vec<&Node> {
        self.store.get_all_nodes()
    }

    pub fn node_count(&self) -> usize {
        self.store.len()
    }

    /// Topmost first.
    pub fn hit_test(&mut self, point: Point) -> Vec<Uuid> {
        self.store.hit_test(point)
    }

    pub fn nodes_in_bounds(&mut self, bounds: &Bounds) -> Vec<&Node> {
        self.store.get_nodes_in_bounds(bounds)
    }

    pub fn visible_nodes(&mut self, viewport: &Bounds) -> Vec<&Node> {
        self.store.get_visible_nodes(viewport)
    }

    /// Every connection in the document, as stored.  Includes connections
    /// whose endpoint node has been removed; rendering skips those.
    pub fn connections(&self) -> Vec<Connection> {
        self.doc.connections()
    }

    /// Resolvable connections re-routed against current node bounds.
    pub fn renderable_connections(&self) -> Vec<Connection> {
        self.doc
            .connections()
            .iter()
            .filter_map(|c| reroute(c, &self.store))
            .collect()
    }

    pub fn anchors(&self) -> &[AnchorPoint] {
        self.anchors.anchors()
    }

    pub fn index_rebuilds(&self) -> u64 {
        self.store.index_rebuilds()
    }

    // ─── Sync ────────────────────────────────────────────────────────

    /// Join the board channel, bootstrap, announce presence and flush
    /// whatever was queued while offline.
    ///
    /// Subscribing comes before reading the log: a delta appended after
    /// the read is broadcast after the subscription exists.
    pub async fn connect(&mut self) -> Result<(), ReplicaError> {
        self.transport.open().await?;
        let subscription = self.transport.subscribe().await?;
        self.transport.track(&self.config.peer).await?;
        self.subscription = Some(subscription);
        self.connected = true;
        log::info!("Board {}: connected as {}", self.board_id(), self.peer_id());

        self.bootstrap().await?;

        for msg in self.presence.resume() {
            if self.send_presence(msg).await.is_err() {
                return Err(TransportError::Offline.into());
            }
        }
        self.flush().await?;
        Ok(())
    }

    /// Leave the channel.  Local state and queued writes are kept.
    pub async fn disconnect(&mut self) {
        if self.connected {
            if let Err(e) = self.transport.untrack(self.peer_id()).await {
                log::debug!("Board {}: untrack failed: {e}", self.board_id());
            }
        }
        self.go_offline();
    }

    fn go_offline(&mut self) {
        if self.connected {
            log::info!("Board {}: offline, {} writes queued", self.board_id(), self.queue.len());
        }
        self.connected = false;
        self.bootstrapped = false;
        self.subscription = None;
        self.presence.suspend();
    }

    /// Catch up from storage: the latest snapshot if it is newer than
    /// anything merged so far, then every logged operation past that, in
    /// order.  The first call replays the board from scratch; later calls
    /// (reconnect, resync) only read what is new.
    ///
    /// Merged into the existing document rather than replacing it, so
    /// edits made while offline survive.  The replica reports `Syncing`
    /// until this returns `Ok`.
    pub async fn bootstrap(&mut self) -> Result<(), ReplicaError> {
        self.bootstrapped = false;
        let board_id = self.board_id();
        if let Some(snapshot) = self.snapshots.latest(board_id).await? {
            if snapshot.created_at > self.log_floor {
                match self.doc.apply_remote(&snapshot.state) {
                    Ok(()) => {
                        self.snapshot_floor = snapshot.created_at;
                        self.log_floor = snapshot.created_at;
                    }
                    Err(e) => log::warn!("Board {board_id}: snapshot dropped, replaying log: {e}"),
                }
            }
        }

        let floor = self.log_floor;
        let (merged, anomalies) = self.merge_log_since(floor).await?;

        self.bootstrapped = true;
        self.project();
        log::info!("Board {board_id}: caught up from @{floor} with {merged} ops ({anomalies} dropped)");
        Ok(())
    }

    /// Merge every logged operation after `floor` and advance `log_floor`.
    /// Returns (ops read, ops dropped as undecodable).
    async fn merge_log_since(&mut self, floor: u64) -> Result<(usize, usize), ReplicaError> {
        let board_id = self.board_id();
        let ops = self.log.query(board_id, floor).await?;
        let mut anomalies = 0;
        for op in &ops {
            if let Err(e) = self.doc.apply_remote(&op.delta) {
                anomalies += 1;
                log::warn!("Board {board_id}: op at {} dropped: {e}", op.timestamp);
            }
        }
        if let Some(last) = ops.last() {
            self.log_floor = self.log_floor.max(last.timestamp);
        }
        Ok((ops.len(), anomalies))
    }

    /// Work the outbound queue front to back.  Stops at the first
    /// failure; a failed broadcast takes the replica offline.
    ///
    /// Each delta is appended to the log before it is broadcast, and a
    /// step that succeeded is not repeated on retry.
    pub async fn flush(&mut self) -> Result<usize, ReplicaError> {
        if !self.connected || !self.bootstrapped {
            return Ok(0);
        }

        let board_id = self.board_id();
        let author_id = self.peer_id();
        let mut completed = 0;
        while let Some(write) = self.queue.front().cloned() {
            match write {
                PendingWrite::Delta { delta, timestamp, needs_broadcast, needs_log } => {
                    if needs_log {
                        if let Err(e) = self.log.append(board_id, author_id, &delta, timestamp).await {
                            log::error!("Board {board_id}: append failed: {e}");
                            return Err(e.into());
                        }
                        if let Some(PendingWrite::Delta { needs_log, .. }) = self.queue.front_mut() {
                            *needs_log = false;
                        }
                    }
                    if needs_broadcast {
                        let event = ChannelEvent::Delta { author_id, payload: delta };
                        if let Err(e) = self.transport.broadcast(&event).await {
                            self.go_offline();
                            return Err(e.into());
                        }
                        if let Some(PendingWrite::Delta { needs_broadcast, .. }) = self.queue.front_mut() {
                            *needs_broadcast = false;
                        }
                    }
                }
                PendingWrite::EdgeUpsert(connection) => {
                    if let Err(e) = self.edges.insert(&connection).await {
                        log::error!("Board {board_id}: edge write failed: {e}");
                        return Err(e.into());
                    }
                }
                PendingWrite::EdgeDelete { board_id, id } => {
                    if let Err(e) = self.edges.delete(board_id, id).await {
                        log::error!("Board {board_id}: edge delete failed: {e}");
                        return Err(e.into());
                    }
                }
            }
            self.queue.pop();
            completed += 1;
        }
        Ok(completed)
    }

    /// Drain the subscription: merge remote deltas, apply presence.
    ///
    /// If the channel reports dropped frames, or an earlier catch-up
    /// failed, the replica catches up from the log before returning.
    pub async fn poll_events(&mut self) -> Result<PollSummary, ReplicaError> {
        let mut summary = PollSummary::default();
        if self.connected && !self.transport.is_connected() {
            self.go_offline();
        }
        let events = match self.subscription.as_mut() {
            Some(sub) => sub.drain(),
            None => return Ok(summary),
        };
        let mut resync = !self.bootstrapped;

        for event in events {
            match event {
                ChannelEvent::Delta { author_id, payload } => match self.doc.apply_remote(&payload) {
                    Ok(()) => summary.deltas_applied += 1,
                    Err(e) => {
                        summary.anomalies += 1;
                        log::warn!("Board {}: delta from {author_id} dropped: {e}", self.board_id());
                    }
                },
                ChannelEvent::Presence(msg) => {
                    self.presence.handle_message(&msg);
                    summary.presence_events += 1;
                }
                ChannelEvent::PeerJoined(info) => {
                    self.presence.handle_peer_joined(&info);
                    summary.presence_events += 1;
                }
                ChannelEvent::PeerLeft(peer_id) => {
                    self.presence.handle_peer_left(peer_id);
                    summary.presence_events += 1;
                }
                ChannelEvent::PresenceSync(roster) => {
                    self.presence.handle_sync(&roster);
                    summary.presence_events += 1;
                }
                ChannelEvent::Resync { missed } => {
                    log::warn!("Board {}: {missed} frames dropped, catching up from the log", self.board_id());
                    self.bootstrapped = false;
                    resync = true;
                }
            }
        }

        if resync {
            self.bootstrap().await?;
            summary.resyncs += 1;
            if let Err(e) = self.flush().await {
                log::warn!("Board {}: writes still queued after resync: {e}", self.board_id());
            }
        } else if summary.deltas_applied > 0 {
            self.project();
        }
        Ok(summary)
    }

    /// Snapshot the full document.
    ///
    /// Operations logged since the last merge are merged first so the
    /// snapshot provably covers everything up to the newest logged
    /// operation; its `created_at` is that operation's timestamp.  Returns
    /// `None` when nothing has been logged since the last snapshot.
    pub async fn compact(&mut self) -> Result<Option<BoardSnapshot>, ReplicaError> {
        if !self.connected || !self.bootstrapped {
            return Ok(None);
        }
        let board_id = self.board_id();
        let (merged, _) = self.merge_log_since(self.log_floor).await?;
        let covers = self.log_floor;
        if covers <= self.snapshot_floor {
            return Ok(None);
        }
        self.project();

        let state = self.doc.encode_state();
        let size = state.len();
        let snapshot = self
            .snapshots
            .insert(board_id, state, size, self.peer_id(), covers)
            .await?;
        self.snapshot_floor = covers;
        self.edits_since_compaction = 0;
        log::info!("Board {board_id}: compacted through @{covers} ({merged} new ops) into {size} bytes");
        Ok(Some(snapshot))
    }

    /// Debounced compaction: runs once enough edits have accumulated and
    /// the board has been quiet for `compaction_debounce`.
    pub async fn tick(&mut self) -> Result<Option<BoardSnapshot>, ReplicaError> {
        let due = self.edits_since_compaction >= self.config.compaction_min_edits
            && self.last_edit.elapsed() >= self.config.compaction_debounce
            && self.queue.is_empty();
        if !due {
            return Ok(None);
        }
        self.compact().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        if !self.connected {
            SyncStatus::Offline
        } else if !self.bootstrapped || !self.queue.is_empty() {
            SyncStatus::Syncing
        } else {
            SyncStatus::Synced
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    // ─── Presence ────────────────────────────────────────────────────

    /// Record the local cursor; broadcast if the rate limit allows.
    pub async fn update_cursor(&mut self, position: Point) {
        if let Some(msg) = self.presence.update_local_cursor(position) {
            let _ = self.send_presence(msg).await;
        }
    }

    /// Announce the local selection.  Remembered while offline and
    /// re-announced on reconnect.
    pub async fn update_selection(&mut self, node_ids: Vec<Uuid>) {
        if let Some(msg) = self.presence.update_local_selection(node_ids) {
            let _ = self.send_presence(msg).await;
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.presence.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.presence.peer_count()
    }

    async fn send_presence(&mut self, msg: AwarenessMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Offline);
        }
        let result = self.transport.broadcast(&ChannelEvent::Presence(msg)).await;
        if let Err(e) = &result {
            log::debug!("Board {}: presence send failed: {e}", self.board_id());
            self.go_offline();
        }
        result
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{LocalTransport, RoomManager};
    use crate::storage::MemoryBackend;
    use easel_core::NodeKind;

    async fn replica(rooms: &RoomManager, board: Uuid, store: &Arc<MemoryBackend>) -> BoardReplica {
        let config = ReplicaConfig::for_testing(board, "tester");
        let transport = LocalTransport::join(rooms, board, config.peer.peer_id).await;
        BoardReplica::new(config, Arc::new(transport), store.clone())
    }

    #[tokio::test]
    async fn test_local_edit_projects_and_logs() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let board = Uuid::new_v4();
        let mut r = replica(&rooms, board, &backend).await;
        r.connect().await.unwrap();

        let node = Node::rectangle(0.0, 0.0, 100.0, 100.0);
        let id = node.id;
        r.add_node(node).await.unwrap();

        assert!(r.node(id).is_some());
        assert_eq!(r.hit_test(Point::new(50.0, 50.0)), vec![id]);
        assert_eq!(backend.operation_count(board).await, 1);
        assert_eq!(r.sync_status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_type_change_rejected_without_side_effects() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let board = Uuid::new_v4();
        let mut r = replica(&rooms, board, &backend).await;
        r.connect().await.unwrap();

        let node = Node::rectangle(0.0, 0.0, 10.0, 10.0);
        let id = node.id;
        r.add_node(node.clone()).await.unwrap();

        let patch = NodePatch::with_kind(NodeKind::Ellipse);
        let err = r.update_node(id, &patch).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Canvas(CanvasError::InvalidMutation { .. })));
        assert_eq!(r.node(id), Some(&node));
        assert_eq!(backend.operation_count(board).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_nodes() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let mut r = replica(&rooms, Uuid::new_v4(), &backend).await;

        let node = Node::rectangle(0.0, 0.0, 10.0, 10.0);
        r.add_node(node.clone()).await.unwrap();
        assert_eq!(
            r.add_node(node.clone()).await.unwrap_err(),
            ReplicaError::Canvas(CanvasError::DuplicateNode(node.id))
        );
        let ghost = Uuid::new_v4();
        assert_eq!(
            r.remove_node(ghost).await.unwrap_err(),
            ReplicaError::Canvas(CanvasError::NodeNotFound(ghost))
        );
    }

    #[tokio::test]
    async fn test_offline_edits_queue() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let board = Uuid::new_v4();
        let mut r = replica(&rooms, board, &backend).await;

        r.add_node(Node::rectangle(0.0, 0.0, 10.0, 10.0)).await.unwrap();
        assert_eq!(r.sync_status(), SyncStatus::Offline);
        assert_eq!(r.pending_writes(), 1);
        assert_eq!(backend.operation_count(board).await, 0);

        r.connect().await.unwrap();
        assert_eq!(r.pending_writes(), 0);
        assert_eq!(backend.operation_count(board).await, 1);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_edit() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let board = Uuid::new_v4();
        let mut config = ReplicaConfig::for_testing(board, "tester");
        config.queue_capacity = 1;
        let transport = LocalTransport::join(&rooms, board, config.peer.peer_id).await;
        let mut r = BoardReplica::new(config, Arc::new(transport), backend);

        r.add_node(Node::rectangle(0.0, 0.0, 10.0, 10.0)).await.unwrap();
        let second = Node::rectangle(20.0, 0.0, 10.0, 10.0);
        let id = second.id;
        assert_eq!(r.add_node(second).await.unwrap_err(), ReplicaError::QueueFull);
        assert!(r.node(id).is_none());
        assert!(r.document().node(id).is_none());
    }

    #[tokio::test]
    async fn test_connection_tool_flow() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let board = Uuid::new_v4();
        let mut r = replica(&rooms, board, &backend).await;
        r.connect().await.unwrap();

        let a = Node::rectangle(0.0, 0.0, 100.0, 100.0);
        let b = Node::rectangle(300.0, 0.0, 100.0, 100.0);
        let (a_id, b_id) = (a.id, b.id);
        r.add_node(a).await.unwrap();
        r.add_node(b).await.unwrap();

        r.select(vec![a_id]).await;
        assert_eq!(r.anchors().len(), 4);
        let anchor = format!("{a_id}-right");
        r.begin_connection(&anchor).unwrap();
        assert!(r.move_pointer(Point::new(200.0, 50.0)).is_some());

        let conn = r.finish_connection(b_id, AnchorSide::Left).await.unwrap();
        assert_eq!(conn.path.len(), 5);
        assert!(r.pending_connection().is_none());
        assert_eq!(r.connections().len(), 1);
        assert_eq!(backend.list(board).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_anchor() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let mut r = replica(&rooms, Uuid::new_v4(), &backend).await;
        assert!(matches!(
            r.begin_connection("nope-top"),
            Err(ReplicaError::UnknownAnchor(_))
        ));
    }

    #[tokio::test]
    async fn test_removing_source_cancels_pending_connection() {
        let rooms = RoomManager::new(64);
        let backend = Arc::new(MemoryBackend::new());
        let mut r = replica(&rooms, Uuid::new_v4(), &backend).await;

        let a = Node::rectangle(0.0, 0.0, 100.0, 100.0);
        let a_id = a.id;
        r.add_node(a).await.unwrap();
        r.select(vec![a_id]).await;
        r.begin_connection(&format!("{a_id}-top")).unwrap();

        r.remove_node(a_id).await.unwrap();
        assert!(r.pending_connection().is_none());
        assert!(r.selection().is_empty());
        assert!(r.anchors().is_empty());
    }
}
