//! Connection tooling: anchors, orthogonal routing and the pending-edge
//! state machine.
//!
//! ```text
//!            start()               complete(to)
//!   Idle ───────────▸ Connecting ───────────────▸ Completed
//!                        │  ▲
//!   cancel() / release   │  │ update_pointer()
//!   over empty space     ▼  │
//!                     Cancelled
//! ```
//!
//! Anchors are derived from the selection and never persisted.  A routed
//! path is five points: the two endpoints, a 50-unit stub out of each exit
//! side, and a single bend joining the stub tips.  Routing does not avoid
//! obstacles.

use uuid::Uuid;

use easel_core::{AnchorRef, AnchorSide, Bounds, Connection, ConnectionStyle, Node, Point};

use crate::store::SpatialStore;

/// Length of the perpendicular stub leaving each anchor.
pub const STUB_LENGTH: f32 = 50.0;

// ---------------------------------------------------------------
// Errors
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    #[error("A connection is already pending")]
    AlreadyConnecting,
    #[error("No connection is pending")]
    NotConnecting,
    #[error("Cannot connect node {0} to itself")]
    SameNode(Uuid),
}

// ---------------------------------------------------------------
// Anchors
// ---------------------------------------------------------------

/// Ephemeral connection target on the edge midpoint of a selected node.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorPoint {
    /// `<node>-<side>`
    pub id: String,
    pub node_id: Uuid,
    pub side: AnchorSide,
    pub point: Point,
}

impl AnchorPoint {
    pub fn new(node_id: Uuid, side: AnchorSide, bounds: &Bounds) -> Self {
        Self {
            id: format!("{node_id}-{side}"),
            node_id,
            side,
            point: side.midpoint(bounds),
        }
    }

    pub fn to_ref(&self) -> AnchorRef {
        AnchorRef {
            node_id: self.node_id,
            side: self.side,
            point: self.point,
        }
    }
}

/// The four anchors of one node.
pub fn anchors_for(node: &Node) -> [AnchorPoint; 4] {
    let bounds = node.bounds();
    AnchorSide::ALL.map(|side| AnchorPoint::new(node.id, side, &bounds))
}

/// Anchors of the current selection.  Regenerated wholesale whenever the
/// selection changes.
#[derive(Clone, Debug, Default)]
pub struct AnchorSet {
    anchors: Vec<AnchorPoint>,
}

impl AnchorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regenerate<'a>(&mut self, selected: impl IntoIterator<Item = &'a Node>) {
        self.anchors.clear();
        for node in selected {
            self.anchors.extend(anchors_for(node));
        }
    }

    pub fn clear(&mut self) {
        self.anchors.clear();
    }

    pub fn anchors(&self) -> &[AnchorPoint] {
        &self.anchors
    }

    pub fn get(&self, id: &str) -> Option<&AnchorPoint> {
        self.anchors.iter().find(|a| a.id == id)
    }

    /// Closest anchor within `radius` of `point`.
    pub fn nearest(&self, point: Point, radius: f32) -> Option<&AnchorPoint> {
        self.anchors
            .iter()
            .map(|a| (a.point.distance(&point), a))
            .filter(|(d, _)| *d <= radius)
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, a)| a)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

// ---------------------------------------------------------------
// Routing
// ---------------------------------------------------------------

#[inline]
fn stub(anchor: &AnchorRef) -> Point {
    let (nx, ny) = anchor.side.normal();
    anchor.point.offset(nx * STUB_LENGTH, ny * STUB_LENGTH)
}

/// `[start, stub_a, bend, stub_b, end]`, every segment axis-aligned.
///
/// Always five points, not a four-point elbow: the path leaves and enters
/// perpendicular to each anchor's side, even when both sides face the same
/// axis.
pub fn route_orthogonal(from: &AnchorRef, to: &AnchorRef) -> Vec<Point> {
    let a = stub(from);
    let b = stub(to);
    let bend = if from.side.is_horizontal() {
        Point::new(a.x, b.y)
    } else {
        Point::new(b.x, a.y)
    };
    vec![from.point, a, bend, b, to.point]
}

/// Preview path from an anchor to the free pointer.
pub fn route_to_point(from: &AnchorRef, cursor: Point) -> Vec<Point> {
    let a = stub(from);
    let bend = if from.side.is_horizontal() {
        Point::new(a.x, cursor.y)
    } else {
        Point::new(cursor.x, a.y)
    };
    vec![from.point, a, bend, cursor]
}

// ---------------------------------------------------------------
// State machine
// ---------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingConnection {
    pub from: AnchorRef,
    pub cursor: Point,
    pub preview: Vec<Point>,
}

/// At most one pending connection per session.  Cancelling leaves no
/// trace: nothing is persisted until `complete` returns.
#[derive(Debug)]
pub struct ConnectionTool {
    phase: ConnectionPhase,
    pending: Option<PendingConnection>,
}

impl Default for ConnectionTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTool {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            pending: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn pending(&self) -> Option<&PendingConnection> {
        self.pending.as_ref()
    }

    /// Begin dragging from an anchor.
    pub fn start(&mut self, from: AnchorRef) -> Result<(), ConnectError> {
        if self.phase == ConnectionPhase::Connecting {
            return Err(ConnectError::AlreadyConnecting);
        }
        self.pending = Some(PendingConnection {
            from,
            cursor: from.point,
            preview: vec![from.point],
        });
        self.phase = ConnectionPhase::Connecting;
        Ok(())
    }

    /// Track the pointer; returns the preview path while connecting.
    pub fn update_pointer(&mut self, cursor: Point) -> Option<&[Point]> {
        let pending = self.pending.as_mut()?;
        pending.cursor = cursor;
        pending.preview = route_to_point(&pending.from, cursor);
        Some(pending.preview.as_slice())
    }

    /// Finish on a target anchor.  A same-node target is rejected and the
    /// tool stays in `Connecting`.
    pub fn complete(&mut self, to: AnchorRef, board_id: Uuid) -> Result<Connection, ConnectError> {
        let connection = self.build(to, board_id)?;
        self.finish();
        Ok(connection)
    }

    /// The connection `complete` would produce, with the tool left in
    /// `Connecting`.  Callers that may still fail to store it call
    /// [`finish`](Self::finish) once it is stored.
    pub fn build(&self, to: AnchorRef, board_id: Uuid) -> Result<Connection, ConnectError> {
        let from = match &self.pending {
            Some(p) => p.from,
            None => return Err(ConnectError::NotConnecting),
        };
        if from.node_id == to.node_id {
            return Err(ConnectError::SameNode(to.node_id));
        }

        Ok(Connection {
            id: Uuid::new_v4(),
            board_id,
            from,
            to,
            path: route_orthogonal(&from, &to),
            style: ConnectionStyle::default(),
            title: None,
            notes: None,
        })
    }

    /// Leave `Connecting` as `Completed`.  Returns whether one was pending.
    pub fn finish(&mut self) -> bool {
        if self.pending.take().is_some() {
            self.phase = ConnectionPhase::Completed;
            true
        } else {
            false
        }
    }

    /// Pointer released away from any anchor.
    pub fn release_over_empty(&mut self) -> bool {
        self.cancel()
    }

    /// Drop the pending connection.  Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        if self.pending.take().is_some() {
            self.phase = ConnectionPhase::Cancelled;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------
// Read-time resolution
// ---------------------------------------------------------------

/// Connections whose both endpoints still exist in `store`.
pub fn resolvable_connections<'a>(
    connections: &'a [Connection],
    store: &SpatialStore,
) -> Vec<&'a Connection> {
    connections
        .iter()
        .filter(|c| store.contains(c.from.node_id) && store.contains(c.to.node_id))
        .collect()
}

/// Recompute endpoints and path from the nodes' current bounds.
/// `None` when either endpoint no longer resolves.
pub fn reroute(connection: &Connection, store: &SpatialStore) -> Option<Connection> {
    let from_bounds = store.bounds_of(connection.from.node_id)?;
    let to_bounds = store.bounds_of(connection.to.node_id)?;

    let from = AnchorRef {
        point: connection.from.side.midpoint(&from_bounds),
        ..connection.from
    };
    let to = AnchorRef {
        point: connection.to.side.midpoint(&to_bounds),
        ..connection.to
    };
    Some(Connection {
        from,
        to,
        path: route_orthogonal(&from, &to),
        ..connection.clone()
    })
}

// ===================================================================
// Tests
// ===================================================================
