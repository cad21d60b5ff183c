//! Canvas nodes and partial updates.
//!
//! A node's type tag is fixed at creation: `NodePatch::apply` refuses any
//! patch whose payload carries a different tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CanvasError;
use crate::geometry::{Bounds, Point, Scale, Size, Transform};

// ───────────────────────────────────────────────────────────────────
// Type tag + payload
// ───────────────────────────────────────────────────────────────────

/// Fieldless type tag of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Rectangle,
    Ellipse,
    Polyline,
    Arrow,
    Text,
    StickyNote,
    Frame,
    Image,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Rectangle => "rectangle",
            NodeType::Ellipse => "ellipse",
            NodeType::Polyline => "polyline",
            NodeType::Arrow => "arrow",
            NodeType::Text => "text",
            NodeType::StickyNote => "sticky_note",
            NodeType::Frame => "frame",
            NodeType::Image => "image",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload.  Serialized with an internal `type` tag so the
/// JSON stored in the replicated document stays self-describing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Rectangle {
        #[serde(default)]
        corner_radius: f32,
    },
    Ellipse,
    /// Points are relative to the node's position.
    Polyline {
        points: Vec<Point>,
    },
    Arrow {
        start: Point,
        end: Point,
    },
    Text {
        content: String,
        font_size: f32,
    },
    StickyNote {
        text: String,
        color: String,
    },
    Frame {
        title: String,
    },
    Image {
        src: String,
    },
}

impl NodeKind {
    pub fn tag(&self) -> NodeType {
        match self {
            NodeKind::Rectangle { .. } => NodeType::Rectangle,
            NodeKind::Ellipse => NodeType::Ellipse,
            NodeKind::Polyline { .. } => NodeType::Polyline,
            NodeKind::Arrow { .. } => NodeType::Arrow,
            NodeKind::Text { .. } => NodeType::Text,
            NodeKind::StickyNote { .. } => NodeType::StickyNote,
            NodeKind::Frame { .. } => NodeType::Frame,
            NodeKind::Image { .. } => NodeType::Image,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Style
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStyle {
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: f32,
    pub opacity: f32,
}

impl Default for NodeStyle {
    fn default() -> Self {
        Self {
            fill: None,
            stroke: Some("#1e1e1e".to_string()),
            stroke_width: 1.0,
            opacity: 1.0,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Node
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub transform: Transform,
    pub size: Size,
    #[serde(default)]
    pub style: NodeStyle,
    pub kind: NodeKind,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub visible: bool,
    pub locked: bool,
    #[serde(default)]
    pub z_index: i64,
}

impl Node {
    /// New visible, unlocked node with a fresh id.
    pub fn new(kind: NodeKind, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            transform: Transform::at(x, y),
            size: Size::new(width, height),
            style: NodeStyle::default(),
            kind,
            metadata: BTreeMap::new(),
            visible: true,
            locked: false,
            z_index: 0,
        }
    }

    pub fn rectangle(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(NodeKind::Rectangle { corner_radius: 0.0 }, x, y, width, height)
    }

    pub fn sticky_note(x: f32, y: f32, text: impl Into<String>) -> Self {
        Self::new(
            NodeKind::StickyNote {
                text: text.into(),
                color: "#fff59d".to_string(),
            },
            x,
            y,
            200.0,
            200.0,
        )
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        self.kind.tag()
    }

    /// Axis-aligned bounds of the scaled, rotated box.
    ///
    /// Derived on demand, never stored.
    pub fn bounds(&self) -> Bounds {
        let t = &self.transform;
        let w = self.size.width * t.scale.x.abs();
        let h = self.size.height * t.scale.y.abs();
        let center = Point::new(
            t.position.x + self.size.width * 0.5,
            t.position.y + self.size.height * 0.5,
        );

        if t.rotation == 0.0 {
            return Bounds::from_center(center, w * 0.5, h * 0.5);
        }

        let (sin, cos) = t.rotation.sin_cos();
        let half_w = (w * 0.5 * cos).abs() + (h * 0.5 * sin).abs();
        let half_h = (w * 0.5 * sin).abs() + (h * 0.5 * cos).abs();
        Bounds::from_center(center, half_w, half_h)
    }
}

// ───────────────────────────────────────────────────────────────────
// NodePatch
// ───────────────────────────────────────────────────────────────────

/// Partial update.  `None` fields are left untouched.
///
/// Metadata entries are merged key by key; a `null` value deletes the key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub position: Option<Point>,
    pub rotation: Option<f32>,
    pub scale: Option<Scale>,
    pub size: Option<Size>,
    pub style: Option<NodeStyle>,
    pub kind: Option<NodeKind>,
    pub metadata: Option<BTreeMap<String, Value>>,
    pub visible: Option<bool>,
    pub locked: Option<bool>,
    pub z_index: Option<i64>,
}

impl NodePatch {
    pub fn moved_to(x: f32, y: f32) -> Self {
        Self {
            position: Some(Point::new(x, y)),
            ..Self::default()
        }
    }

    pub fn resized(width: f32, height: f32) -> Self {
        Self {
            size: Some(Size::new(width, height)),
            ..Self::default()
        }
    }

    pub fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Whether applying this patch could move or resize the node.
    pub fn touches_geometry(&self) -> bool {
        self.position.is_some()
            || self.rotation.is_some()
            || self.scale.is_some()
            || self.size.is_some()
    }

    /// Produce the patched node, leaving `node` unchanged.
    pub fn apply(&self, node: &Node) -> Result<Node, CanvasError> {
        if let Some(kind) = &self.kind {
            if kind.tag() != node.node_type() {
                return Err(CanvasError::InvalidMutation {
                    id: node.id,
                    reason: format!(
                        "type change from {} to {} is not allowed",
                        node.node_type(),
                        kind.tag()
                    ),
                });
            }
        }
        if let Some(size) = self.size {
            if !(size.width >= 0.0 && size.height >= 0.0) {
                return Err(CanvasError::InvalidMutation {
                    id: node.id,
                    reason: format!("negative size {}x{}", size.width, size.height),
                });
            }
        }

        let mut out = node.clone();
        if let Some(p) = self.position {
            out.transform.position = p;
        }
        if let Some(r) = self.rotation {
            out.transform.rotation = r;
        }
        if let Some(s) = self.scale {
            out.transform.scale = s;
        }
        if let Some(s) = self.size {
            out.size = s;
        }
        if let Some(style) = &self.style {
            out.style = style.clone();
        }
        if let Some(kind) = &self.kind {
            out.kind = kind.clone();
        }
        if let Some(meta) = &self.metadata {
            for (k, v) in meta {
                if v.is_null() {
                    out.metadata.remove(k);
                } else {
                    out.metadata.insert(k.clone(), v.clone());
                }
            }
        }
        if let Some(v) = self.visible {
            out.visible = v;
        }
        if let Some(l) = self.locked {
            out.locked = l;
        }
        if let Some(z) = self.z_index {
            out.z_index = z;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unrotated_bounds() {
        let n = Node::rectangle(10.0, 20.0, 100.0, 50.0);
        assert_eq!(n.bounds(), Bounds::from_rect(10.0, 20.0, 100.0, 50.0));
    }

    #[test]
    fn test_scaled_bounds_grow_about_center() {
        let mut n = Node::rectangle(0.0, 0.0, 100.0, 100.0);
        n.transform.scale = Scale { x: 2.0, y: 1.0 };
        let b = n.bounds();
        assert_eq!(b.min_x, -50.0);
        assert_eq!(b.max_x, 150.0);
        assert_eq!(b.min_y, 0.0);
        assert_eq!(b.max_y, 100.0);
    }

    #[test]
    fn test_rotated_bounds_quarter_turn() {
        let mut n = Node::rectangle(0.0, 0.0, 100.0, 20.0);
        n.transform.rotation = std::f32::consts::FRAC_PI_2;
        let b = n.bounds();
        assert!((b.width() - 20.0).abs() < 1e-3);
        assert!((b.height() - 100.0).abs() < 1e-3);
        assert!((b.center().x - 50.0).abs() < 1e-3);
        assert!((b.center().y - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_patch_moves_and_merges_metadata() {
        let mut n = Node::rectangle(0.0, 0.0, 10.0, 10.0);
        n.metadata.insert("keep".into(), json!(1));
        n.metadata.insert("drop".into(), json!(2));

        let mut meta = BTreeMap::new();
        meta.insert("drop".to_string(), Value::Null);
        meta.insert("add".to_string(), json!("x"));
        let patch = NodePatch {
            position: Some(Point::new(5.0, 6.0)),
            metadata: Some(meta),
            z_index: Some(3),
            ..NodePatch::default()
        };

        let out = patch.apply(&n).unwrap();
        assert_eq!(out.transform.position, Point::new(5.0, 6.0));
        assert_eq!(out.z_index, 3);
        assert_eq!(out.metadata.get("keep"), Some(&json!(1)));
        assert_eq!(out.metadata.get("add"), Some(&json!("x")));
        assert!(!out.metadata.contains_key("drop"));
        // Source untouched
        assert_eq!(n.transform.position, Point::ZERO);
    }

    #[test]
    fn test_patch_rejects_type_change() {
        let n = Node::rectangle(0.0, 0.0, 10.0, 10.0);
        let patch = NodePatch::with_kind(NodeKind::Ellipse);
        match patch.apply(&n) {
            Err(CanvasError::InvalidMutation { id, .. }) => assert_eq!(id, n.id),
            other => panic!("expected InvalidMutation, got {other:?}"),
        }
    }

    #[test]
    fn test_patch_same_type_payload_allowed() {
        let n = Node::sticky_note(0.0, 0.0, "old");
        let patch = NodePatch::with_kind(NodeKind::StickyNote {
            text: "new".into(),
            color: "#fff".into(),
        });
        let out = patch.apply(&n).unwrap();
        assert_eq!(
            out.kind,
            NodeKind::StickyNote { text: "new".into(), color: "#fff".into() }
        );
    }

    #[test]
    fn test_patch_rejects_negative_size() {
        let n = Node::rectangle(0.0, 0.0, 10.0, 10.0);
        assert!(NodePatch::resized(-1.0, 5.0).apply(&n).is_err());
    }

    #[test]
    fn test_node_json_carries_type_tag() {
        let n = Node::sticky_note(1.0, 2.0, "hello");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"]["type"], "sticky_note");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, n);
    }
}
