//! In-memory spatial store: nodes by id plus a lazily rebuilt quadtree.
//!
//! Every mutation marks the index dirty; the next spatial query rebuilds
//! it.  The store never talks to the network.  Inside a replica it is a
//! projection of the replicated document and is written only through the
//! projection bridge.

use rustc_hash::FxHashMap;
use uuid::Uuid;

use easel_core::{Bounds, CanvasError, Node, NodePatch, Point};

use crate::spatial::{QuadTreeConfig, SpatialIndex};

#[derive(Clone, Debug)]
struct Slot {
    node: Node,
    /// Insertion sequence, breaks z-order ties (later wins).
    seq: u64,
}

pub struct SpatialStore {
    nodes: FxHashMap<Uuid, Slot>,
    next_seq: u64,
    index: SpatialIndex,
}

impl Default for SpatialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialStore {
    pub fn new() -> Self {
        Self::with_config(QuadTreeConfig::default())
    }

    pub fn with_config(config: QuadTreeConfig) -> Self {
        Self {
            nodes: FxHashMap::default(),
            next_seq: 0,
            index: SpatialIndex::new(config),
        }
    }

    // ---------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------

    /// Insert a new node.  Ids are unique per board.
    pub fn add_node(&mut self, node: Node) -> Result<(), CanvasError> {
        if self.nodes.contains_key(&node.id) {
            return Err(CanvasError::DuplicateNode(node.id));
        }
        self.insert_slot(node);
        Ok(())
    }

    /// Apply a patch.  A patch that changes the type tag is rejected and
    /// the stored node is left as it was.
    pub fn update_node(&mut self, id: Uuid, patch: &NodePatch) -> Result<&Node, CanvasError> {
        let slot = self.nodes.get_mut(&id).ok_or(CanvasError::NodeNotFound(id))?;
        slot.node = patch.apply(&slot.node)?;
        self.index.mark_dirty();
        Ok(&slot.node)
    }

    pub fn remove_node(&mut self, id: Uuid) -> Option<Node> {
        let removed = self.nodes.remove(&id).map(|slot| slot.node);
        if removed.is_some() {
            self.index.mark_dirty();
        }
        removed
    }

    /// Insert or replace wholesale, keeping the original z-order slot.
    /// Projection path only.
    pub(crate) fn upsert(&mut self, node: Node) {
        match self.nodes.get_mut(&node.id) {
            Some(slot) => {
                slot.node = node;
                self.index.mark_dirty();
            }
            None => self.insert_slot(node),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.index.mark_dirty();
    }

    fn insert_slot(&mut self, node: Node) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(node.id, Slot { node, seq });
        self.index.mark_dirty();
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    pub fn get_node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id).map(|slot| &slot.node)
    }

    /// All nodes, bottom to top.
    pub fn get_all_nodes(&self) -> Vec<&Node> {
        let mut slots: Vec<&Slot> = self.nodes.values().collect();
        slots.sort_by_key(|s| (s.node.z_index, s.seq));
        slots.into_iter().map(|s| &s.node).collect()
    }

    pub fn get_node_bounds(&self, node: &Node) -> Bounds {
        node.bounds()
    }

    pub fn bounds_of(&self, id: Uuid) -> Option<Bounds> {
        self.get_node(id).map(Node::bounds)
    }

    #[inline]
    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ---------------------------------------------------------------
    // Spatial queries
    // ---------------------------------------------------------------

    /// Nodes whose bounds contain `point`, topmost first.
    pub fn hit_test(&mut self, point: Point) -> Vec<Uuid> {
        self.refresh_index();
        let mut hits: Vec<&Slot> = self
            .index
            .hit_test(point)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .collect();
        hits.sort_by(|a, b| (b.node.z_index, b.seq).cmp(&(a.node.z_index, a.seq)));
        hits.into_iter().map(|s| s.node.id).collect()
    }

    /// Nodes whose bounds intersect `bounds`, in no particular order.
    pub fn get_nodes_in_bounds(&mut self, bounds: &Bounds) -> Vec<&Node> {
        self.refresh_index();
        self.index
            .retrieve(bounds)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|s| &s.node))
            .collect()
    }

    /// Visible nodes intersecting the viewport, bottom to top.
    pub fn get_visible_nodes(&mut self, viewport: &Bounds) -> Vec<&Node> {
        self.refresh_index();
        let mut slots: Vec<&Slot> = self
            .index
            .retrieve(viewport)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .filter(|s| s.node.visible)
            .collect();
        slots.sort_by_key(|s| (s.node.z_index, s.seq));
        slots.into_iter().map(|s| &s.node).collect()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.index.is_dirty()
    }

    pub fn index_rebuilds(&self) -> u64 {
        self.index.rebuilds()
    }

    fn refresh_index(&mut self) {
        let nodes = &self.nodes;
        self.index
            .refresh(nodes.values().map(|s| (s.node.id, s.node.bounds())));
    }
}

// ===================================================================
// Tests
// ===================================================================
