//! Local entity store used by the sync client.

use crate::error::SyncResult;
use notesync_protocol::{EntityKey, EntityPayload};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Device-side storage the client reads from and applies pulled state to.
///
/// Implementations back onto whatever the application persists notes in.
/// The sync watermark must be stored alongside the entities so both survive
/// restarts together.
pub trait LocalStore: Send + Sync {
    /// Reads the local copy of an entity.
    fn get(&self, key: &EntityKey) -> SyncResult<Option<EntityPayload>>;

    /// Writes an entity, replacing any local copy.
    fn put(&self, entity: EntityPayload) -> SyncResult<()>;

    /// Returns the timestamp of the last completed pull, 0 if never synced.
    fn watermark(&self) -> SyncResult<i64>;

    /// Records the timestamp of a completed pull.
    fn set_watermark(&self, timestamp: i64) -> SyncResult<()>;

    /// Reads cached attachment bytes.
    fn attachment_bytes(&self, attachment_id: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Caches attachment bytes.
    fn store_attachment_bytes(&self, attachment_id: &str, bytes: Vec<u8>) -> SyncResult<()>;
}

/// In-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<EntityKey, EntityPayload>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    watermark: RwLock<i64>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored entity, tombstones included, in key order.
    pub fn entities(&self) -> Vec<EntityPayload> {
        self.entities.read().values().cloned().collect()
    }

    /// Returns the stored entities that are not tombstoned.
    pub fn live_entities(&self) -> Vec<EntityPayload> {
        self.entities
            .read()
            .values()
            .filter(|e| !e.is_tombstone())
            .cloned()
            .collect()
    }

    /// Returns true if attachment bytes are cached.
    pub fn has_attachment_bytes(&self, attachment_id: &str) -> bool {
        self.blobs.read().contains_key(attachment_id)
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &EntityKey) -> SyncResult<Option<EntityPayload>> {
        Ok(self.entities.read().get(key).cloned())
    }

    fn put(&self, entity: EntityPayload) -> SyncResult<()> {
        self.entities.write().insert(entity.key(), entity);
        Ok(())
    }

    fn watermark(&self) -> SyncResult<i64> {
        Ok(*self.watermark.read())
    }

    fn set_watermark(&self, timestamp: i64) -> SyncResult<()> {
        *self.watermark.write() = timestamp;
        Ok(())
    }

    fn attachment_bytes(&self, attachment_id: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(attachment_id).cloned())
    }

    fn store_attachment_bytes(&self, attachment_id: &str, bytes: Vec<u8>) -> SyncResult<()> {
        self.blobs.write().insert(attachment_id.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_protocol::{EntityType, Note};

    fn note(uuid: &str, deleted: bool) -> EntityPayload {
        EntityPayload::Note(Note {
            uuid: uuid.into(),
            path: format!("{uuid}.md"),
            deleted_at: deleted.then_some(5),
            ..Note::default()
        })
    }

    #[test]
    fn put_replaces_by_key() {
        let store = MemoryLocalStore::new();
        store.put(note("a", false)).unwrap();
        store.put(note("a", true)).unwrap();
        store.put(note("b", false)).unwrap();

        assert_eq!(store.entities().len(), 2);
        assert_eq!(store.live_entities(), vec![note("b", false)]);
        let key = EntityKey::new(EntityType::Note, "a");
        assert!(store.get(&key).unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn watermark_starts_at_zero() {
        let store = MemoryLocalStore::new();
        assert_eq!(store.watermark().unwrap(), 0);
        store.set_watermark(42).unwrap();
        assert_eq!(store.watermark().unwrap(), 42);
    }

    #[test]
    fn attachment_cache() {
        let store = MemoryLocalStore::new();
        assert!(store.attachment_bytes("x").unwrap().is_none());
        store.store_attachment_bytes("x", vec![1, 2]).unwrap();
        assert!(store.has_attachment_bytes("x"));
        assert_eq!(store.attachment_bytes("x").unwrap(), Some(vec![1, 2]));
    }
}
