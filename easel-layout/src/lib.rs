//! # easel-layout: spatial projection of a board
//!
//! - [`spatial`]: quadtree index with lazy rebuild
//! - [`store`]: `SpatialStore`, nodes by id with hit-testing and region queries
//! - [`connect`]: anchors, orthogonal routing, the connection tool
//! - [`bridge`]: one-way projection from the replicated document into the store
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Region query, 1K nodes | <50μs |
//! | Hit test, 1K nodes | <10μs |
//! | Full index rebuild, 1K nodes | <1ms |

pub mod bridge;
pub mod connect;
pub mod spatial;
pub mod store;

pub use bridge::{BridgeError, FlushResult, ProjectionBridge, ProjectionOp};
pub use connect::{
    anchors_for, reroute, resolvable_connections, route_orthogonal, route_to_point, AnchorPoint,
    AnchorSet, ConnectError, ConnectionPhase, ConnectionTool, PendingConnection, STUB_LENGTH,
};
pub use spatial::{QuadTree, QuadTreeConfig, SpatialIndex};
pub use store::SpatialStore;
