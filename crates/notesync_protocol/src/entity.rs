//! Synchronized entity types.
//!
//! Every entity carries the same three sync timestamps (`createdAt`,
//! `updatedAt`, `deletedAt`) in milliseconds since epoch. A non-null
//! `deletedAt` marks a tombstone: the row is kept so the deletion can reach
//! other devices.

use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::content_hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A markdown note.
    Note,
    /// A folder, identified by its path.
    Folder,
    /// A calendar event.
    CalendarEvent,
    /// Attachment metadata; bytes live in the content store.
    Attachment,
}

impl EntityType {
    /// All entity types.
    pub const ALL: [EntityType; 4] = [
        EntityType::Note,
        EntityType::Folder,
        EntityType::CalendarEvent,
        EntityType::Attachment,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Note => "note",
            EntityType::Folder => "folder",
            EntityType::CalendarEvent => "calendar_event",
            EntityType::Attachment => "attachment",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an entity within one user's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id (uuid, path or attachment id depending on the type).
    pub entity_id: String,
}

impl EntityKey {
    /// Creates a new key.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A note.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    /// Stable note id.
    pub uuid: String,
    /// Owning user; assigned by the server.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Vault-relative path, unique per user.
    pub path: String,
    /// Containing folder path.
    pub folder: Option<String>,
    /// Markdown body.
    pub content: String,
    /// SHA-256 of `content`.
    pub content_hash: String,
    /// Sort position within the folder.
    pub order_index: i64,
    /// Icon name.
    pub icon: Option<String>,
    /// Icon color.
    pub icon_color: Option<String>,
    /// Whether the note is pinned as a favorite.
    pub is_favorite: bool,
    /// Creation time.
    pub created_at: i64,
    /// Last accepted modification time.
    pub updated_at: i64,
    /// Deletion time for tombstones.
    pub deleted_at: Option<i64>,
}

impl Note {
    /// Recomputes `content_hash` from `content`.
    pub fn rehash(&mut self) {
        self.content_hash = content_hash(&self.content);
    }
}

/// A folder. The path is its identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Folder {
    /// Vault-relative path.
    pub path: String,
    /// Owning user; assigned by the server.
    pub user_id: String,
    /// Icon name.
    pub icon: Option<String>,
    /// Folder color.
    pub color: Option<String>,
    /// Icon color.
    pub icon_color: Option<String>,
    /// Sort position.
    pub order_index: i64,
    /// Whether the folder is locked behind a password.
    pub is_locked: bool,
    /// Hash of the lock password.
    pub password_hash: Option<String>,
    /// Whether the folder is pinned as a favorite.
    pub is_favorite: bool,
    /// Creation time.
    pub created_at: i64,
    /// Last accepted modification time.
    pub updated_at: i64,
    /// Deletion time for tombstones.
    pub deleted_at: Option<i64>,
}

/// A calendar event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendarEvent {
    /// Stable event id.
    pub uuid: String,
    /// Owning user; assigned by the server.
    pub user_id: String,
    /// Linked note.
    pub note_uuid: Option<String>,
    /// Title.
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Start time.
    pub start_time: i64,
    /// End time.
    pub end_time: i64,
    /// Whether the event spans whole days.
    pub all_day: bool,
    /// Location.
    pub location: Option<String>,
    /// Display color.
    pub color: Option<String>,
    /// Reminder lead time in minutes.
    pub reminder_minutes: Option<i64>,
    /// RFC 5545 recurrence rule.
    pub recurrence_rule: Option<String>,
    /// End of recurrence.
    pub recurrence_end: Option<i64>,
    /// Event status (`confirmed`, `tentative`, ...).
    pub status: String,
    /// Creation time.
    pub created_at: i64,
    /// Last accepted modification time.
    pub updated_at: i64,
    /// Deletion time for tombstones.
    pub deleted_at: Option<i64>,
}

/// Attachment metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
    /// Attachment id.
    pub id: String,
    /// Owning user; assigned by the server.
    pub user_id: String,
    /// Note the attachment belongs to.
    pub note_uuid: String,
    /// Original file name.
    pub file_name: String,
    /// SHA-256 of the file bytes.
    pub file_hash: String,
    /// File size in bytes.
    pub file_size: u64,
    /// MIME type.
    pub mime_type: Option<String>,
    /// Content store key of the bytes; shared between rows with equal hashes.
    pub storage_key: String,
    /// Creation time.
    pub created_at: i64,
    /// Last accepted modification time.
    pub updated_at: i64,
    /// Deletion time for tombstones.
    pub deleted_at: Option<i64>,
}

/// A strongly typed entity snapshot, tagged by entity type.
///
/// Serialized as `{"entityType": "...", "data": {...}}`, which is also the
/// shape stored in the sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    /// A note.
    Note(Note),
    /// A folder.
    Folder(Folder),
    /// A calendar event.
    CalendarEvent(CalendarEvent),
    /// Attachment metadata.
    Attachment(Attachment),
}

macro_rules! each_entity {
    ($payload:expr, $entity:ident => $body:expr) => {
        match $payload {
            EntityPayload::Note($entity) => $body,
            EntityPayload::Folder($entity) => $body,
            EntityPayload::CalendarEvent($entity) => $body,
            EntityPayload::Attachment($entity) => $body,
        }
    };
}

impl EntityPayload {
    /// Decodes the untagged entity JSON of the given type.
    pub fn from_data(entity_type: EntityType, json: &str) -> ProtocolResult<Self> {
        let payload = match entity_type {
            EntityType::Note => EntityPayload::Note(serde_json::from_str(json)?),
            EntityType::Folder => EntityPayload::Folder(serde_json::from_str(json)?),
            EntityType::CalendarEvent => {
                EntityPayload::CalendarEvent(serde_json::from_str(json)?)
            }
            EntityType::Attachment => EntityPayload::Attachment(serde_json::from_str(json)?),
        };
        if payload.entity_id().is_empty() {
            return Err(ProtocolError::EmptyEntityId(entity_type));
        }
        Ok(payload)
    }

    /// Encodes the entity without the type tag.
    pub fn to_data_json(&self) -> ProtocolResult<String> {
        Ok(each_entity!(self, e => serde_json::to_string(e))?)
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Note(_) => EntityType::Note,
            EntityPayload::Folder(_) => EntityType::Folder,
            EntityPayload::CalendarEvent(_) => EntityType::CalendarEvent,
            EntityPayload::Attachment(_) => EntityType::Attachment,
        }
    }

    /// Returns the entity id.
    pub fn entity_id(&self) -> &str {
        match self {
            EntityPayload::Note(n) => &n.uuid,
            EntityPayload::Folder(f) => &f.path,
            EntityPayload::CalendarEvent(e) => &e.uuid,
            EntityPayload::Attachment(a) => &a.id,
        }
    }

    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.entity_id())
    }

    /// Returns the path of path-addressed entities.
    pub fn path(&self) -> Option<&str> {
        match self {
            EntityPayload::Note(n) => Some(&n.path),
            EntityPayload::Folder(f) => Some(&f.path),
            _ => None,
        }
    }

    /// Returns the hash that identifies the entity's content, if it has one.
    pub fn content_hash(&self) -> Option<&str> {
        match self {
            EntityPayload::Note(n) => Some(&n.content_hash),
            EntityPayload::Attachment(a) => Some(&a.file_hash),
            _ => None,
        }
    }

    /// Returns the owning user.
    pub fn user_id(&self) -> &str {
        each_entity!(self, e => &e.user_id)
    }

    /// Sets the owning user.
    pub fn set_user_id(&mut self, user_id: &str) {
        each_entity!(self, e => e.user_id = user_id.to_string())
    }

    /// Returns the creation time.
    pub fn created_at(&self) -> i64 {
        each_entity!(self, e => e.created_at)
    }

    /// Sets the creation time.
    pub fn set_created_at(&mut self, ts: i64) {
        each_entity!(self, e => e.created_at = ts)
    }

    /// Returns the last modification time.
    pub fn updated_at(&self) -> i64 {
        each_entity!(self, e => e.updated_at)
    }

    /// Sets the last modification time.
    pub fn set_updated_at(&mut self, ts: i64) {
        each_entity!(self, e => e.updated_at = ts)
    }

    /// Returns the deletion time.
    pub fn deleted_at(&self) -> Option<i64> {
        each_entity!(self, e => e.deleted_at)
    }

    /// Sets the deletion time.
    pub fn set_deleted_at(&mut self, ts: Option<i64>) {
        each_entity!(self, e => e.deleted_at = ts)
    }

    /// Returns true if the entity is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Shifts the sync timestamps by `offset` milliseconds.
    ///
    /// Only `createdAt`, `updatedAt` and `deletedAt` move; user data such as
    /// event start times is left alone.
    pub fn shift_timestamps(&mut self, offset: i64) {
        if offset == 0 {
            return;
        }
        each_entity!(self, e => {
            e.created_at = e.created_at.saturating_add(offset);
            e.updated_at = e.updated_at.saturating_add(offset);
            e.deleted_at = e.deleted_at.map(|ts| ts.saturating_add(offset));
        })
    }

    /// Returns a copy holding only the tracked metadata.
    ///
    /// Timestamps, ownership, content and content hashes are blanked, so two
    /// views compare equal exactly when no tracked metadata field differs.
    pub fn metadata_view(&self) -> EntityPayload {
        let mut view = self.clone();
        each_entity!(&mut view, e => {
            e.user_id.clear();
            e.created_at = 0;
            e.updated_at = 0;
            e.deleted_at = None;
        });
        match &mut view {
            EntityPayload::Note(n) => {
                n.content.clear();
                n.content_hash.clear();
            }
            EntityPayload::Attachment(a) => {
                a.file_hash.clear();
                a.storage_key.clear();
            }
            _ => {}
        }
        view
    }
}

macro_rules! impl_from_entity {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for EntityPayload {
                fn from(entity: $variant) -> Self {
                    EntityPayload::$variant(entity)
                }
            }
        )*
    };
}

impl_from_entity!(Note, Folder, CalendarEvent, Attachment);
