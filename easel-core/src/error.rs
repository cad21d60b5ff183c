use thiserror::Error;
use uuid::Uuid;

/// Local rejections.  Returned synchronously; no state is changed and the
/// caller is not expected to retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CanvasError {
    #[error("Invalid mutation on {id}: {reason}")]
    InvalidMutation { id: Uuid, reason: String },
    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),
    #[error("Node already exists: {0}")]
    DuplicateNode(Uuid),
    #[error("Connection not found: {0}")]
    ConnectionNotFound(Uuid),
}
