//! In-memory entity store.

use super::{next_log_timestamp, EntityStore, LogPage, StoreTxn, SyncLogEntry};
use crate::error::ServerResult;
use notesync_protocol::{EntityKey, EntityPayload, EntityType, Operation};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct UserState {
    entities: BTreeMap<EntityKey, EntityPayload>,
    log: Vec<SyncLogEntry>,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserState>,
    last_log_id: u64,
    floor: i64,
}

/// An entity store kept in process memory.
///
/// Data is lost when the process exits. A transaction holds the store lock
/// from `begin` until it is committed or dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryStore {
    fn begin(&self, user_id: &str, now: i64) -> ServerResult<Box<dyn StoreTxn + '_>> {
        Ok(Box::new(MemoryTxn {
            state: self.state.lock(),
            user_id: user_id.to_string(),
            now,
            pending: BTreeMap::new(),
            new_log: Vec::new(),
            savepoint: None,
        }))
    }

    fn get(&self, user_id: &str, key: &EntityKey) -> ServerResult<Option<EntityPayload>> {
        let state = self.state.lock();
        Ok(state
            .users
            .get(user_id)
            .and_then(|user| user.entities.get(key))
            .cloned())
    }

    fn changed_since(&self, user_id: &str, since: i64) -> ServerResult<Vec<EntityPayload>> {
        let state = self.state.lock();
        let Some(user) = state.users.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(user
            .entities
            .values()
            .filter(|e| e.updated_at() >= since || e.deleted_at().is_some_and(|d| d >= since))
            .cloned()
            .collect())
    }

    fn log_page(
        &self,
        user_id: &str,
        since: i64,
        exclude_device: Option<&str>,
        limit: usize,
    ) -> ServerResult<LogPage> {
        let state = self.state.lock();
        let Some(user) = state.users.get(user_id) else {
            return Ok(LogPage::assemble(Vec::new(), limit, since, None));
        };
        let entries = user
            .log
            .iter()
            .filter(|e| e.timestamp > since)
            .filter(|e| exclude_device != Some(e.device_id.as_str()))
            .take(limit.saturating_add(1))
            .cloned()
            .collect();
        let latest = user.log.last().map(|e| e.timestamp);
        Ok(LogPage::assemble(entries, limit, since, latest))
    }

    fn latest_log_timestamp(&self, user_id: &str) -> ServerResult<Option<i64>> {
        let state = self.state.lock();
        Ok(state
            .users
            .get(user_id)
            .and_then(|user| user.log.last())
            .map(|e| e.timestamp))
    }

    fn log_floor(&self) -> ServerResult<i64> {
        Ok(self.state.lock().floor)
    }

    fn prune_log(&self, before: i64) -> ServerResult<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;
        for user in state.users.values_mut() {
            let len = user.log.len();
            user.log.retain(|e| e.timestamp >= before);
            removed += len - user.log.len();
        }
        state.floor = state.floor.max(before);
        Ok(removed)
    }

    fn all_entities(&self) -> ServerResult<Vec<(String, EntityPayload)>> {
        let state = self.state.lock();
        let mut out: Vec<(String, EntityPayload)> = state
            .users
            .iter()
            .flat_map(|(user_id, user)| {
                user.entities
                    .values()
                    .map(move |e| (user_id.clone(), e.clone()))
            })
            .collect();
        out.sort_by(|a, b| (&a.0, a.1.key()).cmp(&(&b.0, b.1.key())));
        Ok(out)
    }

    fn log_entries(
        &self,
        user_id: Option<&str>,
        since: i64,
        limit: usize,
    ) -> ServerResult<Vec<SyncLogEntry>> {
        let state = self.state.lock();
        let mut out: Vec<SyncLogEntry> = state
            .users
            .iter()
            .filter(|(id, _)| user_id.map_or(true, |wanted| wanted == id.as_str()))
            .flat_map(|(_, user)| user.log.iter())
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.id);
        out.truncate(limit);
        Ok(out)
    }
}

fn is_live_reference(entity: &EntityPayload, storage_key: &str) -> bool {
    matches!(entity, EntityPayload::Attachment(a) if a.deleted_at.is_none() && a.storage_key == storage_key)
}

struct MemoryTxn<'a> {
    state: MutexGuard<'a, MemoryState>,
    user_id: String,
    now: i64,
    pending: BTreeMap<EntityKey, EntityPayload>,
    new_log: Vec<SyncLogEntry>,
    savepoint: Option<(BTreeMap<EntityKey, EntityPayload>, usize)>,
}

impl MemoryTxn<'_> {
    fn committed(&self) -> Option<&UserState> {
        self.state.users.get(&self.user_id)
    }

    /// Entities as this transaction sees them.
    fn visible(&self) -> impl Iterator<Item = &EntityPayload> + '_ {
        self.committed()
            .into_iter()
            .flat_map(|user| user.entities.iter())
            .filter(|(key, _)| !self.pending.contains_key(*key))
            .map(|(_, entity)| entity)
            .chain(self.pending.values())
    }

    fn last_log_timestamp(&self) -> Option<i64> {
        self.new_log
            .last()
            .or_else(|| self.committed().and_then(|user| user.log.last()))
            .map(|e| e.timestamp)
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn get(&mut self, key: &EntityKey) -> ServerResult<Option<EntityPayload>> {
        if let Some(entity) = self.pending.get(key) {
            return Ok(Some(entity.clone()));
        }
        Ok(self
            .committed()
            .and_then(|user| user.entities.get(key))
            .cloned())
    }

    fn find_by_path(
        &mut self,
        entity_type: EntityType,
        path: &str,
    ) -> ServerResult<Option<EntityPayload>> {
        Ok(self
            .visible()
            .find(|e| e.entity_type() == entity_type && !e.is_tombstone() && e.path() == Some(path))
            .cloned())
    }

    fn find_storage_key(&mut self, file_hash: &str) -> ServerResult<Option<String>> {
        Ok(self.visible().find_map(|e| match e {
            EntityPayload::Attachment(a)
                if a.deleted_at.is_none() && a.file_hash == file_hash && !a.storage_key.is_empty() =>
            {
                Some(a.storage_key.clone())
            }
            _ => None,
        }))
    }

    fn live_references(&mut self, storage_key: &str) -> ServerResult<usize> {
        let others = self
            .state
            .users
            .iter()
            .filter(|(user_id, _)| **user_id != self.user_id)
            .flat_map(|(_, user)| user.entities.values())
            .filter(|e| is_live_reference(e, storage_key))
            .count();
        let own = self
            .visible()
            .filter(|e| is_live_reference(e, storage_key))
            .count();
        Ok(others + own)
    }

    fn put(&mut self, entity: &EntityPayload) -> ServerResult<()> {
        self.pending.insert(entity.key(), entity.clone());
        Ok(())
    }

    fn append_log(
        &mut self,
        device_id: &str,
        operation: Operation,
        snapshot: &EntityPayload,
    ) -> ServerResult<i64> {
        let timestamp = next_log_timestamp(self.now, self.last_log_timestamp());
        let id = self.state.last_log_id + self.new_log.len() as u64 + 1;
        self.new_log.push(SyncLogEntry {
            id,
            user_id: self.user_id.clone(),
            device_id: device_id.to_string(),
            operation,
            snapshot: snapshot.clone(),
            timestamp,
        });
        Ok(timestamp)
    }

    fn savepoint(&mut self) -> ServerResult<()> {
        self.savepoint = Some((self.pending.clone(), self.new_log.len()));
        Ok(())
    }

    fn release_savepoint(&mut self) -> ServerResult<()> {
        self.savepoint = None;
        Ok(())
    }

    fn rollback_to_savepoint(&mut self) -> ServerResult<()> {
        if let Some((pending, log_len)) = self.savepoint.take() {
            self.pending = pending;
            self.new_log.truncate(log_len);
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> ServerResult<()> {
        let MemoryTxn {
            mut state,
            user_id,
            pending,
            new_log,
            ..
        } = *self;
        state.last_log_id += new_log.len() as u64;
        let user = state.users.entry(user_id).or_default();
        user.entities.extend(pending);
        user.log.extend(new_log);
        Ok(())
    }
}
