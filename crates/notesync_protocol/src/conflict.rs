//! Conflicts reported by reconciliation.

use crate::entity::{EntityKey, EntityType};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};

/// Why a mutation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The attachment references bytes the content store does not hold.
    MissingContent,
    /// The entity store refused the write (for example a uniqueness clash
    /// with a concurrent push).
    StoreRejected,
}

/// A mutation that was not applied.
///
/// Conflicts are outcomes, not errors: the rest of the batch is committed
/// and the client keeps the mutation queued for a later retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Skew-corrected timestamp of the rejected mutation.
    pub local_timestamp: i64,
    /// `updatedAt` of the stored entity, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
    /// Operation of the rejected mutation.
    pub operation: Operation,
    /// Reason for the rejection.
    pub reason: ConflictReason,
}

impl Conflict {
    /// Creates a new conflict.
    pub fn new(
        key: EntityKey,
        operation: Operation,
        local_timestamp: i64,
        server_timestamp: Option<i64>,
        reason: ConflictReason,
    ) -> Self {
        Self {
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            local_timestamp,
            server_timestamp,
            operation,
            reason,
        }
    }

    /// Returns the key of the conflicting entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}
