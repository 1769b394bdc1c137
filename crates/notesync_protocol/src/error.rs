//! Error types for protocol decoding.

use crate::entity::EntityType;
use crate::operation::Operation;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The JSON document could not be parsed into the expected type.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The change targets one entity but its payload describes another.
    #[error("entity id mismatch: change targets {expected}, payload carries {found}")]
    EntityIdMismatch {
        /// Entity id declared on the change.
        expected: String,
        /// Entity id found in the payload.
        found: String,
    },

    /// A create or update arrived without entity data.
    #[error("{operation} of {entity_type} {entity_id} carries no data")]
    MissingPayload {
        /// Entity type of the change.
        entity_type: EntityType,
        /// Entity id of the change.
        entity_id: String,
        /// Operation of the change.
        operation: Operation,
    },

    /// The entity id is empty.
    #[error("empty entity id for {0}")]
    EmptyEntityId(EntityType),
}
