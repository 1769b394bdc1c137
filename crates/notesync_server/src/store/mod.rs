//! Entity and sync log persistence.
//!
//! The reconciliation engine talks to storage through [`EntityStore`], which
//! hands out one [`StoreTxn`] per push. A transaction serializes writes for
//! the whole store, so sync log timestamps can be allocated without races.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`] - everything in process memory
//! - [`SqliteStore`] - a single SQLite database file

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::ServerResult;
use notesync_protocol::{EntityKey, EntityPayload, EntityType, Operation, RemoteChange};

/// One row of a user's sync log.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogEntry {
    /// Store-wide sequence number.
    pub id: u64,
    /// Owning user.
    pub user_id: String,
    /// Device the change came from.
    pub device_id: String,
    /// Operation applied.
    pub operation: Operation,
    /// Entity state after the change.
    pub snapshot: EntityPayload,
    /// Server time of the change, strictly increasing per user.
    pub timestamp: i64,
}

impl SyncLogEntry {
    /// Returns the key of the changed entity.
    pub fn key(&self) -> EntityKey {
        self.snapshot.key()
    }

    /// Converts the entry into its wire form.
    pub fn to_remote(&self) -> RemoteChange {
        RemoteChange {
            id: self.id,
            device_id: self.device_id.clone(),
            entity_id: self.snapshot.entity_id().to_string(),
            operation: self.operation,
            snapshot: self.snapshot.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A page of the changes feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogPage {
    /// Entries in timestamp order.
    pub entries: Vec<SyncLogEntry>,
    /// True if entries beyond this page remain.
    pub has_more: bool,
    /// Value the caller should pass as `since` next time.
    pub watermark: i64,
}

impl LogPage {
    /// Builds a page from up to `limit + 1` entries read after `since`.
    ///
    /// `latest` is the newest log timestamp of the user, including entries
    /// that were filtered out.
    pub(crate) fn assemble(
        mut entries: Vec<SyncLogEntry>,
        limit: usize,
        since: i64,
        latest: Option<i64>,
    ) -> Self {
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let watermark = match entries.last() {
            Some(last) if has_more => last.timestamp,
            _ => latest.unwrap_or(since).max(since),
        };
        Self {
            entries,
            has_more,
            watermark,
        }
    }
}

/// Storage of entities and the sync log.
///
/// # Invariants
///
/// - Entities are keyed by `(user, entity type, entity id)`
/// - A user's log timestamps are strictly increasing
/// - Writes only become visible through [`StoreTxn::commit`]
pub trait EntityStore: Send + Sync {
    /// Starts a write transaction for `user_id`.
    ///
    /// `now` is the server time used to stamp new log entries.
    fn begin(&self, user_id: &str, now: i64) -> ServerResult<Box<dyn StoreTxn + '_>>;

    /// Reads one entity.
    fn get(&self, user_id: &str, key: &EntityKey) -> ServerResult<Option<EntityPayload>>;

    /// Returns entities with `updatedAt >= since` or `deletedAt >= since`.
    fn changed_since(&self, user_id: &str, since: i64) -> ServerResult<Vec<EntityPayload>>;

    /// Reads log entries after `since`, skipping those of `exclude_device`.
    fn log_page(
        &self,
        user_id: &str,
        since: i64,
        exclude_device: Option<&str>,
        limit: usize,
    ) -> ServerResult<LogPage>;

    /// Returns the newest log timestamp of `user_id`.
    fn latest_log_timestamp(&self, user_id: &str) -> ServerResult<Option<i64>>;

    /// Returns the boundary below which log entries have been pruned.
    fn log_floor(&self) -> ServerResult<i64>;

    /// Deletes log entries older than `before` and raises the floor.
    ///
    /// Returns the number of entries removed.
    fn prune_log(&self, before: i64) -> ServerResult<usize>;

    /// Lists every entity of every user.
    fn all_entities(&self) -> ServerResult<Vec<(String, EntityPayload)>>;

    /// Lists log entries after `since`, optionally for one user.
    fn log_entries(
        &self,
        user_id: Option<&str>,
        since: i64,
        limit: usize,
    ) -> ServerResult<Vec<SyncLogEntry>>;
}

/// A write transaction over one user's data.
///
/// Dropping a transaction without committing discards its writes.
pub trait StoreTxn {
    /// Reads an entity, including writes made in this transaction.
    fn get(&mut self, key: &EntityKey) -> ServerResult<Option<EntityPayload>>;

    /// Finds the live entity of `entity_type` stored at `path`.
    fn find_by_path(
        &mut self,
        entity_type: EntityType,
        path: &str,
    ) -> ServerResult<Option<EntityPayload>>;

    /// Finds the storage key of a live attachment with `file_hash`.
    fn find_storage_key(&mut self, file_hash: &str) -> ServerResult<Option<String>>;

    /// Counts live attachments of any user referencing `storage_key`,
    /// including writes made in this transaction.
    ///
    /// No other transaction can bind `storage_key` until this one ends, so
    /// a count of zero stays true while the bytes are deleted.
    fn live_references(&mut self, storage_key: &str) -> ServerResult<usize>;

    /// Inserts or replaces an entity.
    fn put(&mut self, entity: &EntityPayload) -> ServerResult<()>;

    /// Appends a log entry and returns its timestamp.
    fn append_log(
        &mut self,
        device_id: &str,
        operation: Operation,
        snapshot: &EntityPayload,
    ) -> ServerResult<i64>;

    /// Marks a point that [`StoreTxn::rollback_to_savepoint`] returns to.
    fn savepoint(&mut self) -> ServerResult<()>;

    /// Keeps the writes made since the savepoint.
    fn release_savepoint(&mut self) -> ServerResult<()>;

    /// Discards the writes made since the savepoint.
    fn rollback_to_savepoint(&mut self) -> ServerResult<()>;

    /// Makes all writes durable and visible.
    fn commit(self: Box<Self>) -> ServerResult<()>;
}

/// Next log timestamp after `last`, never behind `now`.
pub(crate) fn next_log_timestamp(now: i64, last: Option<i64>) -> i64 {
    match last {
        Some(last) => now.max(last.saturating_add(1)),
        None => now,
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every store must share.

    use super::*;
    use notesync_protocol::{Attachment, Folder, Note};

    pub fn note(uuid: &str, path: &str, updated_at: i64) -> EntityPayload {
        let mut note = Note {
            uuid: uuid.into(),
            user_id: "alice".into(),
            name: path.into(),
            path: path.into(),
            content: format!("body of {uuid}"),
            created_at: updated_at,
            updated_at,
            ..Default::default()
        };
        note.rehash();
        EntityPayload::Note(note)
    }

    pub fn attachment(id: &str, storage_key: &str, deleted: bool) -> EntityPayload {
        EntityPayload::Attachment(Attachment {
            id: id.into(),
            user_id: "alice".into(),
            note_uuid: "n1".into(),
            file_name: "a.png".into(),
            file_hash: storage_key.into(),
            file_size: 3,
            storage_key: storage_key.into(),
            created_at: 1,
            updated_at: 1,
            deleted_at: deleted.then_some(2),
            ..Default::default()
        })
    }

    fn references(store: &dyn EntityStore, storage_key: &str) -> usize {
        let mut txn = store.begin("alice", 0).unwrap();
        txn.live_references(storage_key).unwrap()
    }

    pub fn writes_visible_after_commit(store: &dyn EntityStore) {
        let key = EntityKey::new(EntityType::Note, "n1");
        {
            let mut txn = store.begin("alice", 100).unwrap();
            txn.put(&note("n1", "a.md", 10)).unwrap();
            assert!(txn.get(&key).unwrap().is_some());
            txn.commit().unwrap();
        }
        assert_eq!(store.get("alice", &key).unwrap(), Some(note("n1", "a.md", 10)));
        assert!(store.get("bob", &key).unwrap().is_none());
    }

    pub fn drop_discards_writes(store: &dyn EntityStore) {
        {
            let mut txn = store.begin("alice", 100).unwrap();
            txn.put(&note("n1", "a.md", 10)).unwrap();
            txn.append_log("dev", Operation::Create, &note("n1", "a.md", 10))
                .unwrap();
        }
        let key = EntityKey::new(EntityType::Note, "n1");
        assert!(store.get("alice", &key).unwrap().is_none());
        assert_eq!(store.latest_log_timestamp("alice").unwrap(), None);
    }

    pub fn log_timestamps_strictly_increase(store: &dyn EntityStore) {
        let mut stamps = Vec::new();
        for _ in 0..2 {
            let mut txn = store.begin("alice", 500).unwrap();
            for i in 0..3 {
                let entity = note(&format!("n{i}"), &format!("{i}.md"), 1);
                txn.put(&entity).unwrap();
                stamps.push(txn.append_log("dev", Operation::Update, &entity).unwrap());
            }
            txn.commit().unwrap();
        }
        assert_eq!(stamps, vec![500, 501, 502, 503, 504, 505]);

        // Another user's log is independent.
        let mut txn = store.begin("bob", 500).unwrap();
        let ts = txn
            .append_log("dev", Operation::Create, &note("x", "x.md", 1))
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(ts, 500);
        assert_eq!(store.latest_log_timestamp("alice").unwrap(), Some(505));
    }

    pub fn savepoint_rollback(store: &dyn EntityStore) {
        let mut txn = store.begin("alice", 100).unwrap();
        txn.put(&note("keep", "keep.md", 1)).unwrap();
        txn.append_log("dev", Operation::Create, &note("keep", "keep.md", 1))
            .unwrap();

        txn.savepoint().unwrap();
        txn.put(&note("drop", "drop.md", 1)).unwrap();
        txn.append_log("dev", Operation::Create, &note("drop", "drop.md", 1))
            .unwrap();
        txn.rollback_to_savepoint().unwrap();

        txn.savepoint().unwrap();
        txn.put(&note("also", "also.md", 1)).unwrap();
        let ts = txn
            .append_log("dev", Operation::Create, &note("also", "also.md", 1))
            .unwrap();
        txn.release_savepoint().unwrap();
        txn.commit().unwrap();

        assert_eq!(ts, 101);
        let ids: Vec<String> = store
            .changed_since("alice", 0)
            .unwrap()
            .iter()
            .map(|e| e.entity_id().to_string())
            .collect();
        assert!(ids.contains(&"keep".to_string()));
        assert!(ids.contains(&"also".to_string()));
        assert!(!ids.contains(&"drop".to_string()));
        assert_eq!(store.log_entries(Some("alice"), 0, 10).unwrap().len(), 2);
    }

    pub fn find_by_path_and_storage_key(store: &dyn EntityStore) {
        let mut txn = store.begin("alice", 100).unwrap();
        txn.put(&note("n1", "inbox/todo.md", 1)).unwrap();
        txn.put(&EntityPayload::Folder(Folder {
            path: "inbox".into(),
            ..Default::default()
        }))
        .unwrap();
        txn.put(&attachment("a1", "k-live", false)).unwrap();
        txn.put(&attachment("a2", "k-dead", true)).unwrap();

        let mut gone = note("n0", "inbox/todo.md", 1);
        gone.set_deleted_at(Some(5));
        txn.put(&gone).unwrap();

        let found = txn.find_by_path(EntityType::Note, "inbox/todo.md").unwrap();
        assert_eq!(found.map(|e| e.entity_id().to_string()), Some("n1".into()));
        assert!(txn
            .find_by_path(EntityType::Note, "inbox")
            .unwrap()
            .is_none());
        assert!(txn
            .find_by_path(EntityType::Folder, "inbox")
            .unwrap()
            .is_some());

        assert_eq!(txn.find_storage_key("k-live").unwrap(), Some("k-live".into()));
        assert_eq!(txn.find_storage_key("k-dead").unwrap(), None);
        assert_eq!(txn.live_references("k-live").unwrap(), 1);
        txn.commit().unwrap();

        assert_eq!(references(store, "k-live"), 1);
        assert_eq!(references(store, "k-dead"), 0);
    }

    pub fn live_references_span_users(store: &dyn EntityStore) {
        for user in ["alice", "bob"] {
            let mut txn = store.begin(user, 1).unwrap();
            let mut a = attachment("a1", "shared", false);
            a.set_user_id(user);
            txn.put(&a).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(references(store, "shared"), 2);

        let mut txn = store.begin("alice", 2).unwrap();
        txn.put(&attachment("a1", "shared", true)).unwrap();
        // The pending tombstone already counts; bob's row still does too.
        assert_eq!(txn.live_references("shared").unwrap(), 1);
        txn.commit().unwrap();
        assert_eq!(references(store, "shared"), 1);

        let mut txn = store.begin("bob", 3).unwrap();
        let mut gone = attachment("a1", "shared", true);
        gone.set_user_id("bob");
        txn.put(&gone).unwrap();
        assert_eq!(txn.live_references("shared").unwrap(), 0);
    }

    pub fn changed_since_includes_tombstones(store: &dyn EntityStore) {
        let mut txn = store.begin("alice", 1).unwrap();
        txn.put(&note("old", "old.md", 10)).unwrap();
        txn.put(&note("new", "new.md", 50)).unwrap();
        let mut gone = note("gone", "gone.md", 10);
        gone.set_deleted_at(Some(60));
        txn.put(&gone).unwrap();
        txn.commit().unwrap();

        let mut ids: Vec<String> = store
            .changed_since("alice", 40)
            .unwrap()
            .iter()
            .map(|e| e.entity_id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["gone".to_string(), "new".to_string()]);
        assert_eq!(store.changed_since("alice", 0).unwrap().len(), 3);
    }

    pub fn log_paging(store: &dyn EntityStore) {
        let mut txn = store.begin("alice", 1_000).unwrap();
        for (i, device) in ["a", "b", "a", "b", "b"].iter().enumerate() {
            let entity = note(&format!("n{i}"), &format!("{i}.md"), 1);
            txn.append_log(device, Operation::Create, &entity).unwrap();
        }
        txn.commit().unwrap();

        let page = store.log_page("alice", 0, Some("a"), 2).unwrap();
        let stamps: Vec<i64> = page.entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![1_001, 1_003]);
        assert!(page.has_more);
        assert_eq!(page.watermark, 1_003);

        let page = store.log_page("alice", page.watermark, Some("a"), 2).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(!page.has_more);
        assert_eq!(page.watermark, 1_004);

        // Only own entries left: nothing returned, watermark still advances.
        let page = store.log_page("alice", 1_001, Some("b"), 10).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.watermark, 1_004);

        let page = store.log_page("alice", 5_000, None, 10).unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.watermark, 5_000);
    }

    pub fn prune_raises_floor(store: &dyn EntityStore) {
        let mut txn = store.begin("alice", 100).unwrap();
        for i in 0..4 {
            let entity = note(&format!("n{i}"), &format!("{i}.md"), 1);
            txn.append_log("dev", Operation::Create, &entity).unwrap();
        }
        txn.commit().unwrap();
        assert_eq!(store.log_floor().unwrap(), 0);

        assert_eq!(store.prune_log(102).unwrap(), 2);
        assert_eq!(store.log_floor().unwrap(), 102);
        let remaining: Vec<i64> = store
            .log_entries(None, 0, 100)
            .unwrap()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(remaining, vec![102, 103]);

        // The floor never moves backwards.
        assert_eq!(store.prune_log(50).unwrap(), 0);
        assert_eq!(store.log_floor().unwrap(), 102);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_timestamp() {
        assert_eq!(next_log_timestamp(100, None), 100);
        assert_eq!(next_log_timestamp(100, Some(50)), 100);
        assert_eq!(next_log_timestamp(100, Some(100)), 101);
        assert_eq!(next_log_timestamp(100, Some(200)), 201);
    }

    #[test]
    fn page_watermark() {
        let page = LogPage::assemble(Vec::new(), 10, 7, None);
        assert_eq!(page.watermark, 7);
        assert!(!page.has_more);

        let page = LogPage::assemble(Vec::new(), 10, 7, Some(30));
        assert_eq!(page.watermark, 30);
    }
}
