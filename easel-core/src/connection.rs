//! Directed connections between node anchors.
//!
//! A connection references its endpoints weakly: deleting a node never
//! deletes the connections touching it.  Readers drop connections whose
//! endpoints no longer resolve.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{Bounds, Point};

/// Edge of a node's bounding box an anchor sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorSide {
    Top,
    Bottom,
    Left,
    Right,
}

impl AnchorSide {
    pub const ALL: [AnchorSide; 4] = [
        AnchorSide::Top,
        AnchorSide::Right,
        AnchorSide::Bottom,
        AnchorSide::Left,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorSide::Top => "top",
            AnchorSide::Bottom => "bottom",
            AnchorSide::Left => "left",
            AnchorSide::Right => "right",
        }
    }

    /// Outward unit normal (y grows downward).
    pub fn normal(&self) -> (f32, f32) {
        match self {
            AnchorSide::Top => (0.0, -1.0),
            AnchorSide::Bottom => (0.0, 1.0),
            AnchorSide::Left => (-1.0, 0.0),
            AnchorSide::Right => (1.0, 0.0),
        }
    }

    #[inline]
    pub fn is_horizontal(&self) -> bool {
        matches!(self, AnchorSide::Left | AnchorSide::Right)
    }

    /// Midpoint of this edge of `bounds`.
    pub fn midpoint(&self, bounds: &Bounds) -> Point {
        let c = bounds.center();
        match self {
            AnchorSide::Top => Point::new(c.x, bounds.min_y),
            AnchorSide::Bottom => Point::new(c.x, bounds.max_y),
            AnchorSide::Left => Point::new(bounds.min_x, c.y),
            AnchorSide::Right => Point::new(bounds.max_x, c.y),
        }
    }
}

impl std::fmt::Display for AnchorSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted endpoint: node + side + the coordinates at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorRef {
    pub node_id: Uuid,
    pub side: AnchorSide,
    pub point: Point,
}

impl AnchorRef {
    /// Anchor id in `<node>-<side>` form.
    pub fn anchor_id(&self) -> String {
        format!("{}-{}", self.node_id, self.side)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStyle {
    pub stroke: String,
    pub stroke_width: f32,
    pub dashed: bool,
    pub arrow_head: bool,
}

impl Default for ConnectionStyle {
    fn default() -> Self {
        Self {
            stroke: "#1e1e1e".to_string(),
            stroke_width: 2.0,
            dashed: false,
            arrow_head: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub board_id: Uuid,
    pub from: AnchorRef,
    pub to: AnchorRef,
    /// Routed polyline from `from.point` to `to.point`.
    pub path: Vec<Point>,
    #[serde(default)]
    pub style: ConnectionStyle,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Connection {
    /// Whether either endpoint references `node_id`.
    pub fn touches(&self, node_id: Uuid) -> bool {
        self.from.node_id == node_id || self.to.node_id == node_id
    }
}
