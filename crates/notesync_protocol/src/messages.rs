//! HTTP request and response bodies.

use crate::conflict::Conflict;
use crate::entity::{Attachment, CalendarEvent, EntityKey, EntityPayload, Folder, Note};
use crate::operation::{Operation, PushChange};
use serde::{Deserialize, Serialize};

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Mutations in local commit order.
    pub changes: Vec<PushChange>,
    /// Pushing device.
    pub device_id: String,
    /// Device wall-clock time at send; used for skew correction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<i64>,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(
        changes: Vec<PushChange>,
        device_id: impl Into<String>,
        client_timestamp: Option<i64>,
    ) -> Self {
        Self {
            changes,
            device_id: device_id.into(),
            client_timestamp,
        }
    }
}

/// Response to a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// True when the batch was committed.
    pub success: bool,
    /// Entities whose mutation was accepted and logged.
    #[serde(default)]
    pub applied: Vec<EntityKey>,
    /// Entities whose stored state already matched the mutation.
    #[serde(default)]
    pub unchanged: Vec<EntityKey>,
    /// Mutations that were not applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    /// Latest sync log timestamp after the commit.
    pub timestamp: i64,
}

impl PushResponse {
    /// Creates a response for a committed batch.
    pub fn committed(
        applied: Vec<EntityKey>,
        unchanged: Vec<EntityKey>,
        conflicts: Vec<Conflict>,
        timestamp: i64,
    ) -> Self {
        Self {
            success: true,
            applied,
            unchanged,
            conflicts,
            timestamp,
        }
    }

    /// Returns true if the server holds the pushed state for `key`.
    pub fn settled(&self, key: &EntityKey) -> bool {
        self.applied.contains(key) || self.unchanged.contains(key)
    }
}

/// Query of `GET /sync/changes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
    /// Exclusive lower bound on log timestamps.
    #[serde(default)]
    pub since: i64,
    /// Requesting device; its own entries are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One sync log entry as seen by a pulling device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// Log entry id.
    pub id: u64,
    /// Device that made the change.
    pub device_id: String,
    /// Entity id.
    pub entity_id: String,
    /// Operation.
    pub operation: Operation,
    /// Entity state after the change.
    pub snapshot: EntityPayload,
    /// Server log timestamp.
    pub timestamp: i64,
}

/// Response of `GET /sync/changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    /// Changes in log order.
    pub changes: Vec<RemoteChange>,
    /// Watermark for the next request.
    pub timestamp: i64,
    /// True when another page is available.
    #[serde(default)]
    pub has_more: bool,
    /// True when `since` predates the retained log; the client must do a
    /// full pull.
    #[serde(default)]
    pub resync_required: bool,
}

/// Body of `POST /sync/pull`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Watermark of the previous pull; 0 for a fresh device.
    #[serde(default)]
    pub last_sync_timestamp: i64,
}

/// Response of `POST /sync/pull`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Changed notes.
    #[serde(default)]
    pub notes: Vec<Note>,
    /// Changed folders.
    #[serde(default)]
    pub folders: Vec<Folder>,
    /// Changed calendar events.
    #[serde(default)]
    pub events: Vec<CalendarEvent>,
    /// Changed attachment metadata.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Watermark for the next request.
    pub timestamp: i64,
}

impl PullResponse {
    /// Groups entity snapshots by type.
    pub fn from_entities(entities: impl IntoIterator<Item = EntityPayload>, timestamp: i64) -> Self {
        let mut response = Self {
            timestamp,
            ..Default::default()
        };
        for entity in entities {
            match entity {
                EntityPayload::Note(n) => response.notes.push(n),
                EntityPayload::Folder(f) => response.folders.push(f),
                EntityPayload::CalendarEvent(e) => response.events.push(e),
                EntityPayload::Attachment(a) => response.attachments.push(a),
            }
        }
        response
    }

    /// Returns the number of entities in the response.
    pub fn len(&self) -> usize {
        self.notes.len() + self.folders.len() + self.events.len() + self.attachments.len()
    }

    /// Returns true if the response holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the response, folders first so children find their parent.
    pub fn into_entities(self) -> Vec<EntityPayload> {
        let mut entities = Vec::with_capacity(self.len());
        entities.extend(self.folders.into_iter().map(EntityPayload::Folder));
        entities.extend(self.notes.into_iter().map(EntityPayload::Note));
        entities.extend(self.events.into_iter().map(EntityPayload::CalendarEvent));
        entities.extend(self.attachments.into_iter().map(EntityPayload::Attachment));
        entities
    }
}

/// Query of `POST /attachments/upload`; the body is the raw file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    /// Attachment id; generated by the server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Owning note.
    pub note_uuid: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Uploading device.
    pub device_id: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}
