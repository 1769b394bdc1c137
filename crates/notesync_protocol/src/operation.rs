//! Client-declared mutations.

use crate::entity::{EntityKey, EntityPayload, EntityType};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity was created.
    Create,
    /// Entity was modified.
    Update,
    /// Entity was deleted (tombstoned).
    Delete,
}

impl Operation {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation in a push batch.
///
/// `data_json` holds the untagged entity JSON; the type comes from
/// `entity_type`. A delete may omit it, in which case the stored row is
/// tombstoned at `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChange {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Operation.
    pub operation: Operation,
    /// Entity snapshot as JSON text.
    #[serde(default)]
    pub data_json: String,
    /// Local wall-clock time of the mutation on the originating device.
    pub timestamp: i64,
    /// Originating device.
    pub device_id: String,
}

impl PushChange {
    /// Creates a change carrying a full snapshot.
    pub fn new(
        payload: &EntityPayload,
        operation: Operation,
        timestamp: i64,
        device_id: impl Into<String>,
    ) -> ProtocolResult<Self> {
        Ok(Self {
            entity_type: payload.entity_type(),
            entity_id: payload.entity_id().to_string(),
            operation,
            data_json: payload.to_data_json()?,
            timestamp,
            device_id: device_id.into(),
        })
    }

    /// Creates a delete that carries no snapshot.
    pub fn delete(key: EntityKey, timestamp: i64, device_id: impl Into<String>) -> Self {
        Self {
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            operation: Operation::Delete,
            data_json: String::new(),
            timestamp,
            device_id: device_id.into(),
        }
    }

    /// Returns the key of the targeted entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Decodes and validates the snapshot.
    ///
    /// Returns `None` only for a delete without data.
    pub fn payload(&self) -> ProtocolResult<Option<EntityPayload>> {
        let raw = self.data_json.trim();
        if raw.is_empty() || raw == "null" {
            return match self.operation {
                Operation::Delete => Ok(None),
                operation => Err(ProtocolError::MissingPayload {
                    entity_type: self.entity_type,
                    entity_id: self.entity_id.clone(),
                    operation,
                }),
            };
        }

        let payload = EntityPayload::from_data(self.entity_type, raw)?;
        if payload.entity_id() != self.entity_id {
            return Err(ProtocolError::EntityIdMismatch {
                expected: self.entity_id.clone(),
                found: payload.entity_id().to_string(),
            });
        }
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Note;

    fn note_payload(uuid: &str) -> EntityPayload {
        EntityPayload::Note(Note {
            uuid: uuid.into(),
            path: format!("{uuid}.md"),
            content: "body".into(),
            ..Default::default()
        })
    }

    #[test]
    fn operation_names() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(
            serde_json::to_string(&Operation::Delete).unwrap(),
            "\"delete\""
        );
    }

    #[test]
    fn change_wire_shape() {
        let change = PushChange::new(&note_payload("n1"), Operation::Create, 42, "dev-a").unwrap();
        let value = serde_json::to_value(&change).unwrap();

        assert_eq!(value["entityType"], "note");
        assert_eq!(value["entityId"], "n1");
        assert_eq!(value["operation"], "create");
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["deviceId"], "dev-a");
        assert!(value["dataJson"].is_string());
    }

    #[test]
    fn payload_round_trip() {
        let payload = note_payload("n1");
        let change = PushChange::new(&payload, Operation::Update, 1, "dev").unwrap();
        assert_eq!(change.payload().unwrap(), Some(payload));
    }

    #[test]
    fn payload_id_must_match() {
        let mut change = PushChange::new(&note_payload("n1"), Operation::Update, 1, "dev").unwrap();
        change.entity_id = "n2".into();

        let err = change.payload().unwrap_err();
        assert!(matches!(err, ProtocolError::EntityIdMismatch { .. }));
    }

    #[test]
    fn bare_delete_has_no_payload() {
        let change = PushChange::delete(EntityKey::new(EntityType::Note, "n1"), 7, "dev");
        assert_eq!(change.payload().unwrap(), None);

        let mut null_delete = change.clone();
        null_delete.data_json = "null".into();
        assert_eq!(null_delete.payload().unwrap(), None);
    }

    #[test]
    fn update_without_data_is_rejected() {
        let mut change = PushChange::delete(EntityKey::new(EntityType::Note, "n1"), 7, "dev");
        change.operation = Operation::Update;

        let err = change.payload().unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPayload { .. }));
    }
}
