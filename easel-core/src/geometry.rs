//! World-space geometry shared by every layer of the canvas.
//!
//! All coordinates are `f32` world units.  `Bounds` uses min/max corners
//! with **inclusive** edges: two boxes that share an edge intersect, and a
//! point on the border is contained.

use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────────
// Point / Size / Scale
// ───────────────────────────────────────────────────────────────────

/// 2-D position in world coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    #[inline(always)]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    #[inline]
    pub fn offset(&self, dx: f32, dy: f32) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    #[inline(always)]
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Per-axis scale factor applied around the node center.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub x: f32,
    pub y: f32,
}

impl Default for Scale {
    fn default() -> Self {
        Self { x: 1.0, y: 1.0 }
    }
}

// ───────────────────────────────────────────────────────────────────
// Transform
// ───────────────────────────────────────────────────────────────────

/// Placement of a node: top-left `position` of the unrotated box,
/// `rotation` in radians about the box center, and `scale`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Point,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default)]
    pub scale: Scale,
}

impl Transform {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            position: Point::new(x, y),
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Bounds: Axis-Aligned Bounding Box
// ───────────────────────────────────────────────────────────────────

/// Axis-aligned box stored as min/max corners.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Bounds {
    #[inline(always)]
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Create from origin + size (design-tool convention).
    #[inline(always)]
    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x + width,
            max_y: y + height,
        }
    }

    /// Box centered on `center` with the given half extents.
    #[inline]
    pub fn from_center(center: Point, half_width: f32, half_height: f32) -> Self {
        Self {
            min_x: center.x - half_width,
            min_y: center.y - half_height,
            max_x: center.x + half_width,
            max_y: center.y + half_height,
        }
    }

    /// The 1×1 box used for point queries against the index.
    #[inline]
    pub fn probe(point: Point) -> Self {
        Self::from_rect(point.x, point.y, 1.0, 1.0)
    }

    /// Point-in-box test, edges inclusive.
    #[inline(always)]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Whether `other` lies completely inside `self`.
    #[inline(always)]
    pub fn contains_bounds(&self, other: &Bounds) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Overlap test, edges inclusive.
    #[inline(always)]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    #[inline]
    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) * 0.5,
            (self.min_y + self.max_y) * 0.5,
        )
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Union of an iterator of boxes, `None` when empty.
    pub fn enclosing<'a>(boxes: impl IntoIterator<Item = &'a Bounds>) -> Option<Bounds> {
        boxes
            .into_iter()
            .fold(None, |acc: Option<Bounds>, b| Some(acc.map_or(*b, |a| a.union(b))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_from_rect() {
        let b = Bounds::from_rect(10.0, 20.0, 100.0, 50.0);
        assert_eq!(b.min_x, 10.0);
        assert_eq!(b.min_y, 20.0);
        assert_eq!(b.max_x, 110.0);
        assert_eq!(b.max_y, 70.0);
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 50.0);
        assert_eq!(b.center(), Point::new(60.0, 45.0));
    }

    #[test]
    fn test_bounds_contains_edges() {
        let b = Bounds::from_rect(0.0, 0.0, 10.0, 10.0);
        assert!(b.contains(Point::new(0.0, 0.0)));
        assert!(b.contains(Point::new(10.0, 10.0)));
        assert!(b.contains(Point::new(5.0, 5.0)));
        assert!(!b.contains(Point::new(10.1, 5.0)));
        assert!(!b.contains(Point::new(-0.1, 5.0)));
    }

    #[test]
    fn test_bounds_intersects_touching() {
        let a = Bounds::from_rect(0.0, 0.0, 10.0, 10.0);
        let b = Bounds::from_rect(10.0, 0.0, 10.0, 10.0);
        let c = Bounds::from_rect(11.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_bounds_contains_bounds() {
        let outer = Bounds::from_rect(0.0, 0.0, 100.0, 100.0);
        assert!(outer.contains_bounds(&Bounds::from_rect(10.0, 10.0, 5.0, 5.0)));
        assert!(outer.contains_bounds(&outer));
        assert!(!outer.contains_bounds(&Bounds::from_rect(90.0, 90.0, 20.0, 5.0)));
    }

    #[test]
    fn test_bounds_union_and_enclosing() {
        let a = Bounds::from_rect(0.0, 0.0, 10.0, 10.0);
        let b = Bounds::from_rect(20.0, -5.0, 10.0, 10.0);
        let u = a.union(&b);
        assert_eq!(u, Bounds::new(0.0, -5.0, 30.0, 10.0));

        assert_eq!(Bounds::enclosing([&a, &b]), Some(u));
        assert_eq!(Bounds::enclosing(std::iter::empty()), None);
    }

    #[test]
    fn test_probe_is_one_unit() {
        let p = Bounds::probe(Point::new(3.0, 4.0));
        assert_eq!(p.width(), 1.0);
        assert_eq!(p.height(), 1.0);
        assert!(p.contains(Point::new(3.0, 4.0)));
    }

    #[test]
    fn test_point_distance() {
        assert_eq!(Point::new(0.0, 0.0).distance(&Point::new(3.0, 4.0)), 5.0);
    }
}
