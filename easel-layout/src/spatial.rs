//! Quadtree spatial index for region and point queries.
//!
//! Recursively partitions the world into four quadrants.  An item is pushed
//! into a quadrant only when it lies strictly on one side of **both** split
//! lines; anything touching a split line stays at the parent.  Items are
//! therefore stored exactly once, and queries never need to de-duplicate.
//!
//! ```text
//!  ┌─────────┬─────────┐
//!  │  NW (0) │  NE (1) │      split when a level holds > max_items
//!  │         │         │      and depth < max_depth
//!  ├────── mid_y ──────┤
//!  │  SW (2) │  SE (3) │      straddlers stay at the parent
//!  │       mid_x       │
//!  └─────────┴─────────┘
//! ```
//!
//! `SpatialIndex` wraps the tree with a dirty flag.  Writes only set the
//! flag; the first query afterwards rebuilds the whole tree from the
//! caller's items.  `refresh` needs `&mut self` while queries borrow the
//! tree shared, so a rebuild can never interleave with a read.

use easel_core::{Bounds, Point};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuadTreeConfig {
    /// Items a level may hold before it splits.
    pub max_items: usize,
    /// Deepest level that may still split (root is depth 0).
    pub max_depth: usize,
}

impl Default for QuadTreeConfig {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_depth: 5,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tree
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
struct Entry {
    id: Uuid,
    bounds: Bounds,
}

#[derive(Clone, Debug)]
struct QuadNode {
    bounds: Bounds,
    depth: usize,
    items: Vec<Entry>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl QuadNode {
    fn new(bounds: Bounds, depth: usize) -> Self {
        Self {
            bounds,
            depth,
            items: Vec::new(),
            children: None,
        }
    }

    /// Quadrant strictly containing `b` by the midpoint rule.
    #[inline]
    fn quadrant(&self, b: &Bounds) -> Option<usize> {
        let c = self.bounds.center();
        let left = b.max_x < c.x;
        let right = b.min_x > c.x;
        let top = b.max_y < c.y;
        let bottom = b.min_y > c.y;
        match (left, right, top, bottom) {
            (true, _, true, _) => Some(0),
            (_, true, true, _) => Some(1),
            (true, _, _, true) => Some(2),
            (_, true, _, true) => Some(3),
            _ => None,
        }
    }

    /// Quadrant an item may be pushed into.  Items outside this node's
    /// bounds stay here so that child bounds always enclose child items.
    #[inline]
    fn placement(&self, b: &Bounds) -> Option<usize> {
        if self.bounds.contains_bounds(b) {
            self.quadrant(b)
        } else {
            None
        }
    }

    fn insert(&mut self, entry: Entry, config: &QuadTreeConfig) {
        if self.children.is_none() {
            self.items.push(entry);
            if self.items.len() > config.max_items && self.depth < config.max_depth {
                self.split(config);
            }
            return;
        }
        match self.placement(&entry.bounds) {
            Some(i) => self.push_down(i, entry, config),
            None => self.items.push(entry),
        }
    }

    fn push_down(&mut self, quadrant: usize, entry: Entry, config: &QuadTreeConfig) {
        match self.children.as_mut() {
            Some(children) => children[quadrant].insert(entry, config),
            None => self.items.push(entry),
        }
    }

    fn split(&mut self, config: &QuadTreeConfig) {
        let b = self.bounds;
        let c = b.center();
        let d = self.depth + 1;
        self.children = Some(Box::new([
            QuadNode::new(Bounds::new(b.min_x, b.min_y, c.x, c.y), d),
            QuadNode::new(Bounds::new(c.x, b.min_y, b.max_x, c.y), d),
            QuadNode::new(Bounds::new(b.min_x, c.y, c.x, b.max_y), d),
            QuadNode::new(Bounds::new(c.x, c.y, b.max_x, b.max_y), d),
        ]));

        for entry in std::mem::take(&mut self.items) {
            match self.placement(&entry.bounds) {
                Some(i) => self.push_down(i, entry, config),
                None => self.items.push(entry),
            }
        }
    }

    fn retrieve(&self, query: &Bounds, out: &mut Vec<Entry>) {
        out.extend(self.items.iter().filter(|e| e.bounds.intersects(query)));

        let Some(children) = self.children.as_ref() else {
            return;
        };
        match self.quadrant(query) {
            Some(i) => children[i].retrieve(query, out),
            None => {
                for child in children.iter() {
                    if child.bounds.intersects(query) {
                        child.retrieve(query, out);
                    }
                }
            }
        }
    }

    fn depth(&self) -> usize {
        match self.children.as_ref() {
            Some(children) => children.iter().map(QuadNode::depth).max().unwrap_or(self.depth),
            None => self.depth,
        }
    }
}

/// Region quadtree over `(id, bounds)` pairs.
#[derive(Clone, Debug)]
pub struct QuadTree {
    config: QuadTreeConfig,
    root: QuadNode,
    len: usize,
}

impl QuadTree {
    pub fn new(world: Bounds, config: QuadTreeConfig) -> Self {
        Self {
            config,
            root: QuadNode::new(world, 0),
            len: 0,
        }
    }

    /// Build a tree whose root covers every item.
    pub fn build(items: impl IntoIterator<Item = (Uuid, Bounds)>, config: QuadTreeConfig) -> Self {
        let entries: Vec<Entry> = items
            .into_iter()
            .map(|(id, bounds)| Entry { id, bounds })
            .collect();
        let world = Bounds::enclosing(entries.iter().map(|e| &e.bounds))
            .unwrap_or(Bounds::from_rect(0.0, 0.0, 1.0, 1.0));

        let mut tree = Self::new(world, config);
        for entry in entries {
            tree.root.insert(entry, &tree.config);
            tree.len += 1;
        }
        tree
    }

    pub fn insert(&mut self, id: Uuid, bounds: Bounds) {
        self.root.insert(Entry { id, bounds }, &self.config);
        self.len += 1;
    }

    /// Ids of all items whose bounds intersect `query`.
    pub fn retrieve(&self, query: &Bounds) -> Vec<Uuid> {
        let mut out = Vec::new();
        self.root.retrieve(query, &mut out);
        out.into_iter().map(|e| e.id).collect()
    }

    /// Ids of all items whose bounds contain `point`.
    pub fn hit_test(&self, point: Point) -> Vec<Uuid> {
        let mut out = Vec::new();
        self.root.retrieve(&Bounds::probe(point), &mut out);
        out.into_iter()
            .filter(|e| e.bounds.contains(point))
            .map(|e| e.id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.root = QuadNode::new(self.root.bounds, 0);
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Depth of the deepest level in use.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    pub fn world(&self) -> Bounds {
        self.root.bounds
    }

    pub fn config(&self) -> QuadTreeConfig {
        self.config
    }
}

// ───────────────────────────────────────────────────────────────────
// SpatialIndex: lazy rebuild on dirty
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SpatialIndex {
    config: QuadTreeConfig,
    tree: QuadTree,
    dirty: bool,
    rebuilds: u64,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(QuadTreeConfig::default())
    }
}

impl SpatialIndex {
    pub fn new(config: QuadTreeConfig) -> Self {
        Self {
            config,
            tree: QuadTree::build(std::iter::empty(), config),
            dirty: false,
            rebuilds: 0,
        }
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of full rebuilds performed so far.
    #[inline]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Rebuild from `items` if a write happened since the last rebuild.
    pub fn refresh<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (Uuid, Bounds)>,
    {
        if !self.dirty {
            return;
        }
        self.tree = QuadTree::build(items, self.config);
        self.dirty = false;
        self.rebuilds += 1;
        log::debug!(
            "SpatialIndex: rebuilt {} items, depth {}",
            self.tree.len(),
            self.tree.depth()
        );
    }

    /// Query the current tree.  Callers must `refresh` first.
    pub fn retrieve(&self, query: &Bounds) -> Vec<Uuid> {
        debug_assert!(!self.dirty, "query on a dirty index");
        self.tree.retrieve(query)
    }

    pub fn hit_test(&self, point: Point) -> Vec<Uuid> {
        debug_assert!(!self.dirty, "query on a dirty index");
        self.tree.hit_test(point)
    }

    pub fn tree(&self) -> &QuadTree {
        &self.tree
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    /// Deterministic LCG so failures reproduce.
    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 40) as f32) / ((1u64 << 24) as f32)
        }
    }

    fn random_items(n: usize, world: f32, seed: u64) -> Vec<(Uuid, Bounds)> {
        let mut rng = Lcg(seed);
        (0..n)
            .map(|_| {
                let x = rng.next_f32() * world;
                let y = rng.next_f32() * world;
                let w = 1.0 + rng.next_f32() * 200.0;
                let h = 1.0 + rng.next_f32() * 200.0;
                (uid(), Bounds::from_rect(x, y, w, h))
            })
            .collect()
    }

    // ─────────────── Placement ───────────────

    #[test]
    fn test_empty_tree() {
        let tree = QuadTree::build(std::iter::empty(), QuadTreeConfig::default());
        assert!(tree.is_empty());
        assert!(tree.retrieve(&Bounds::from_rect(0.0, 0.0, 100.0, 100.0)).is_empty());
    }

    #[test]
    fn test_no_split_at_max_items() {
        let mut tree = QuadTree::new(Bounds::from_rect(0.0, 0.0, 1000.0, 1000.0), QuadTreeConfig::default());
        for i in 0..10 {
            tree.insert(uid(), Bounds::from_rect(i as f32 * 10.0, 10.0, 5.0, 5.0));
        }
        assert_eq!(tree.depth(), 0);
        tree.insert(uid(), Bounds::from_rect(900.0, 900.0, 5.0, 5.0));
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.len(), 11);
    }

    #[test]
    fn test_straddler_stays_at_parent() {
        let mut tree = QuadTree::new(Bounds::from_rect(0.0, 0.0, 1000.0, 1000.0), QuadTreeConfig::default());
        let straddler = uid();
        tree.insert(straddler, Bounds::from_rect(490.0, 490.0, 20.0, 20.0));
        for i in 0..20 {
            tree.insert(uid(), Bounds::from_rect(i as f32 * 5.0, 0.0, 2.0, 2.0));
        }
        assert!(tree.root.items.iter().any(|e| e.id == straddler));
        // Query confined to the NW quadrant touching the straddler still finds it.
        let found = tree.retrieve(&Bounds::from_rect(480.0, 480.0, 15.0, 15.0));
        assert!(found.contains(&straddler));
    }

    #[test]
    fn test_item_on_split_line_stays_at_parent() {
        let mut tree = QuadTree::new(Bounds::from_rect(0.0, 0.0, 1000.0, 1000.0), QuadTreeConfig::default());
        let on_line = uid();
        // max_x == mid_x: not strictly left, so not pushed down.
        tree.insert(on_line, Bounds::from_rect(400.0, 100.0, 100.0, 10.0));
        for i in 0..20 {
            tree.insert(uid(), Bounds::from_rect(i as f32 * 5.0, 0.0, 2.0, 2.0));
        }
        assert!(tree.root.items.iter().any(|e| e.id == on_line));
    }

    #[test]
    fn test_depth_capped() {
        let config = QuadTreeConfig { max_items: 1, max_depth: 3 };
        let mut tree = QuadTree::new(Bounds::from_rect(0.0, 0.0, 1024.0, 1024.0), config);
        for i in 0..50 {
            tree.insert(uid(), Bounds::from_rect(i as f32 * 0.1, 0.0, 0.05, 0.05));
        }
        assert!(tree.depth() <= 3);
        assert_eq!(tree.len(), 50);
    }

    // ─────────────── Queries ───────────────

    #[test]
    fn test_retrieve_matches_brute_force() {
        let items = random_items(1000, 20_000.0, 7);
        let tree = QuadTree::build(items.iter().copied(), QuadTreeConfig::default());

        let mut rng = Lcg(99);
        for _ in 0..200 {
            let q = Bounds::from_rect(
                rng.next_f32() * 20_000.0,
                rng.next_f32() * 20_000.0,
                rng.next_f32() * 2_000.0,
                rng.next_f32() * 2_000.0,
            );
            let got: Vec<Uuid> = tree.retrieve(&q);
            let unique: HashSet<Uuid> = got.iter().copied().collect();
            assert_eq!(unique.len(), got.len(), "duplicate ids returned");

            let expected: HashSet<Uuid> = items
                .iter()
                .filter(|(_, b)| b.intersects(&q))
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(unique, expected);
        }
    }

    #[test]
    fn test_hit_test_exact_containment() {
        let a = uid();
        let b = uid();
        let tree = QuadTree::build(
            [
                (a, Bounds::from_rect(0.0, 0.0, 10.0, 10.0)),
                (b, Bounds::from_rect(10.5, 0.0, 10.0, 10.0)),
            ],
            QuadTreeConfig::default(),
        );
        // The 1×1 query box overlaps b, but the point itself is only inside a.
        assert_eq!(tree.hit_test(Point::new(10.0, 5.0)), vec![a]);
        assert!(tree.hit_test(Point::new(50.0, 50.0)).is_empty());
    }

    #[test]
    fn test_query_outside_world() {
        let items = random_items(100, 1000.0, 3);
        let tree = QuadTree::build(items, QuadTreeConfig::default());
        assert!(tree.retrieve(&Bounds::from_rect(-500.0, -500.0, 10.0, 10.0)).is_empty());
    }

    // ─────────────── SpatialIndex ───────────────

    #[test]
    fn test_index_rebuilds_once_per_dirty_window() {
        let items = random_items(50, 1000.0, 11);
        let mut index = SpatialIndex::default();
        index.mark_dirty();
        index.mark_dirty();
        assert!(index.is_dirty());

        index.refresh(items.iter().copied());
        assert_eq!(index.rebuilds(), 1);
        index.refresh(items.iter().copied());
        assert_eq!(index.rebuilds(), 1);
        assert_eq!(index.tree().len(), 50);

        index.mark_dirty();
        index.refresh(items.iter().take(10).copied());
        assert_eq!(index.rebuilds(), 2);
        assert_eq!(index.tree().len(), 10);
    }
}
