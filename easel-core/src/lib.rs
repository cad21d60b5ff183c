//! # easel-core: board model and replicated document
//!
//! Everything the canvas agrees on across collaborators lives here:
//!
//! - [`geometry`]: points, sizes, transforms and axis-aligned bounds
//! - [`node`]: canvas nodes, their type tags and partial patches
//! - [`connection`]: directed edges between node anchors
//! - [`record`]: operation-log entries and snapshots
//! - [`collab`]: the Yrs-backed [`ReplicatedDocument`]
//!
//! The document is the single source of truth.  Spatial indexing and
//! connection tooling (in `easel-layout`) are projections of it.

pub mod collab;
pub mod connection;
pub mod error;
pub mod geometry;
pub mod node;
pub mod record;

pub use collab::{CollabError, ReplicatedDocument};
pub use connection::{AnchorRef, AnchorSide, Connection, ConnectionStyle};
pub use error::CanvasError;
pub use geometry::{Bounds, Point, Scale, Size, Transform};
pub use node::{Node, NodeKind, NodePatch, NodeStyle, NodeType};
pub use record::{now_millis, BoardSnapshot, Operation, Timestamp};
