//! Push reconciliation and change feeds.
//!
//! A push is applied in one store transaction. Each change is decoded, moved
//! onto the server clock, compared with the stored entity and either written
//! with a log entry, dropped as unchanged, or reported as a conflict. A
//! failing change is rolled back to its savepoint without touching the rest
//! of the batch.
//!
//! ## Upsert rule
//!
//! An incoming entity replaces the stored one when, checked in this order:
//!
//! 1. the content hash differs
//! 2. the deletion state differs
//! 3. any other tracked field differs
//! 4. its `updatedAt` is newer
//!
//! Otherwise the change is reported as unchanged. An accepted change always
//! moves `updatedAt` past the stored value.

use crate::auth::AuthenticatedDevice;
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::notify::NotificationHub;
use crate::store::{EntityStore, StoreTxn, SyncLogEntry};
use notesync_protocol::{
    Attachment, ChangesQuery, ChangesResponse, Conflict, ConflictReason, EntityKey,
    EntityPayload, EntityType, Operation, PullRequest, PullResponse, PushChange, PushRequest,
    PushResponse,
};
use notesync_storage::ContentStore;
use std::sync::Arc;

/// Device id recorded for changes the server makes on its own.
pub const SERVER_DEVICE_ID: &str = "server";

/// Request size limits of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum number of changes in one push.
    pub max_push_batch: usize,
    /// Changes page size when the client gives none.
    pub default_page_size: u32,
    /// Upper bound on the changes page size.
    pub max_page_size: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_push_batch: 500,
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

impl From<&ServerConfig> for EngineLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_push_batch: config.max_push_batch,
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        }
    }
}

/// Why an incoming entity was accepted or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Note content or attachment bytes differ.
    ContentChanged,
    /// One side is deleted and the other is not, or deletion times differ.
    DeletionChanged,
    /// A tracked field other than content differs.
    MetadataChanged,
    /// Same data with a newer `updatedAt`.
    Newer,
    /// Nothing to apply.
    Unchanged,
}

impl Verdict {
    /// Returns true if the incoming entity should be written.
    pub fn accepts(&self) -> bool {
        !matches!(self, Verdict::Unchanged)
    }
}

/// Decides whether `incoming` replaces `stored`.
pub fn upsert_verdict(stored: &EntityPayload, incoming: &EntityPayload) -> Verdict {
    if stored.content_hash() != incoming.content_hash() {
        Verdict::ContentChanged
    } else if stored.deleted_at() != incoming.deleted_at() {
        Verdict::DeletionChanged
    } else if stored.metadata_view() != incoming.metadata_view() {
        Verdict::MetadataChanged
    } else if incoming.updated_at() > stored.updated_at() {
        Verdict::Newer
    } else {
        Verdict::Unchanged
    }
}

enum Outcome {
    Applied { released_key: Option<String> },
    Unchanged,
    Conflict(Conflict),
}

struct Mutation<'a> {
    user_id: &'a str,
    device_id: &'a str,
    offset: i64,
    now: i64,
}

/// The server side of synchronization.
///
/// All methods are blocking and are meant to run on a blocking thread.
pub struct ReconcileEngine {
    store: Arc<dyn EntityStore>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    hub: Arc<NotificationHub>,
    limits: EngineLimits,
}

impl ReconcileEngine {
    /// Creates an engine with default limits.
    pub fn new(
        store: Arc<dyn EntityStore>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            store,
            content,
            clock,
            hub,
            limits: EngineLimits::default(),
        }
    }

    /// Sets the request limits.
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the entity store.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Returns the attachment content store.
    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Returns the notification hub.
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the request limits.
    pub fn limits(&self) -> EngineLimits {
        self.limits
    }

    /// Applies a batch of changes from one device.
    ///
    /// # Errors
    ///
    /// Rejects the whole batch with [`ServerError::InvalidRequest`] or
    /// [`ServerError::Protocol`] if any change is malformed, and with
    /// [`ServerError::NotAuthorized`] if the token does not cover the
    /// device. Store failures other than constraint violations abort the
    /// batch without writing anything.
    pub fn push(
        &self,
        auth: &AuthenticatedDevice,
        request: PushRequest,
    ) -> ServerResult<PushResponse> {
        let PushRequest {
            changes,
            device_id,
            client_timestamp,
        } = request;
        auth.authorize_device(&device_id)?;
        let payloads = self.validate(&changes, &device_id)?;

        let now = self.clock.now_millis();
        let offset = client_timestamp.map_or(0, |client| now.saturating_sub(client));
        let user_id = auth.user_id.as_str();
        let mutation = Mutation {
            user_id,
            device_id: &device_id,
            offset,
            now,
        };

        let mut applied = Vec::new();
        let mut unchanged = Vec::new();
        let mut conflicts = Vec::new();
        let mut released = Vec::new();

        let mut txn = self.store.begin(user_id, now)?;
        for (change, payload) in changes.iter().zip(payloads) {
            let key = change.key();
            txn.savepoint()?;
            match self.apply(txn.as_mut(), &mutation, change, payload) {
                Ok(Outcome::Applied { released_key }) => {
                    txn.release_savepoint()?;
                    released.extend(released_key);
                    applied.push(key);
                }
                Ok(Outcome::Unchanged) => {
                    txn.release_savepoint()?;
                    unchanged.push(key);
                }
                Ok(Outcome::Conflict(conflict)) => {
                    txn.rollback_to_savepoint()?;
                    tracing::debug!(user = %user_id, entity = %key, reason = ?conflict.reason, "change conflicted");
                    conflicts.push(conflict);
                }
                Err(ServerError::Constraint(reason)) => {
                    txn.rollback_to_savepoint()?;
                    tracing::warn!(user = %user_id, entity = %key, %reason, "store rejected change");
                    conflicts.push(Conflict::new(
                        key,
                        change.operation,
                        change.timestamp.saturating_add(offset),
                        None,
                        ConflictReason::StoreRejected,
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        txn.commit()?;

        let timestamp = self.store.latest_log_timestamp(user_id)?.unwrap_or(now);
        self.release_content(user_id, now, released);
        if !applied.is_empty() {
            self.hub.notify(user_id, &device_id, timestamp);
        }

        tracing::info!(
            user = %user_id,
            device = %device_id,
            offset,
            applied = applied.len(),
            unchanged = unchanged.len(),
            conflicts = conflicts.len(),
            "push committed"
        );
        Ok(PushResponse::committed(applied, unchanged, conflicts, timestamp))
    }

    fn validate(
        &self,
        changes: &[PushChange],
        device_id: &str,
    ) -> ServerResult<Vec<Option<EntityPayload>>> {
        if changes.len() > self.limits.max_push_batch {
            return Err(ServerError::InvalidRequest(format!(
                "batch of {} changes exceeds the limit of {}",
                changes.len(),
                self.limits.max_push_batch
            )));
        }
        changes
            .iter()
            .map(|change| {
                if change.device_id != device_id {
                    return Err(ServerError::InvalidRequest(format!(
                        "change for {} comes from device {} inside a batch of {}",
                        change.key(),
                        change.device_id,
                        device_id
                    )));
                }
                Ok(change.payload()?)
            })
            .collect()
    }

    fn apply(
        &self,
        txn: &mut dyn StoreTxn,
        mutation: &Mutation<'_>,
        change: &PushChange,
        payload: Option<EntityPayload>,
    ) -> ServerResult<Outcome> {
        let key = change.key();
        let stored = txn.get(&key)?;
        let declared = change.timestamp.saturating_add(mutation.offset);

        let mut incoming = match payload {
            Some(mut entity) => {
                if entity.updated_at() == 0 {
                    entity.set_updated_at(change.timestamp);
                }
                if entity.created_at() == 0 {
                    entity.set_created_at(change.timestamp);
                }
                if change.operation == Operation::Delete && entity.deleted_at().is_none() {
                    entity.set_deleted_at(Some(change.timestamp));
                }
                entity.shift_timestamps(mutation.offset);
                entity
            }
            None => match &stored {
                Some(current) if !current.is_tombstone() => {
                    let mut tombstone = current.clone();
                    tombstone.set_deleted_at(Some(declared));
                    tombstone.set_updated_at(declared);
                    tombstone
                }
                _ => return Ok(Outcome::Unchanged),
            },
        };

        incoming.set_user_id(mutation.user_id);
        if let EntityPayload::Note(note) = &mut incoming {
            note.rehash();
        }
        if let Some(current) = &stored {
            incoming.set_created_at(current.created_at());
        }

        if let EntityPayload::Attachment(attachment) = &mut incoming {
            if !self.bind_storage(txn, attachment, stored.as_ref())? {
                return Ok(Outcome::Conflict(Conflict::new(
                    key,
                    change.operation,
                    attachment.updated_at,
                    stored.as_ref().map(EntityPayload::updated_at),
                    ConflictReason::MissingContent,
                )));
            }
        }

        if let Some(current) = &stored {
            let verdict = upsert_verdict(current, &incoming);
            if !verdict.accepts() {
                return Ok(Outcome::Unchanged);
            }
            tracing::debug!(entity = %key, ?verdict, "accepting change");
            let bumped = incoming
                .updated_at()
                .max(current.updated_at().saturating_add(1));
            incoming.set_updated_at(bumped);
        }

        if !incoming.is_tombstone() {
            if let Some(path) = incoming.path() {
                if let Some(occupant) = txn.find_by_path(incoming.entity_type(), path)? {
                    if occupant.entity_id() != incoming.entity_id() {
                        self.evict(txn, occupant, mutation.now)?;
                    }
                }
            }
        }

        let operation = if incoming.is_tombstone() {
            Operation::Delete
        } else if stored.is_none() {
            Operation::Create
        } else {
            Operation::Update
        };
        let released_key = match (&stored, &incoming) {
            (Some(EntityPayload::Attachment(old)), EntityPayload::Attachment(new))
                if old.deleted_at.is_none()
                    && !old.storage_key.is_empty()
                    && (new.deleted_at.is_some() || new.storage_key != old.storage_key) =>
            {
                Some(old.storage_key.clone())
            }
            _ => None,
        };

        txn.put(&incoming)?;
        txn.append_log(mutation.device_id, operation, &incoming)?;
        Ok(Outcome::Applied { released_key })
    }

    /// Points `attachment` at bytes the server holds.
    ///
    /// Returns false if no bytes with the attachment's hash are available
    /// to this user.
    fn bind_storage(
        &self,
        txn: &mut dyn StoreTxn,
        attachment: &mut Attachment,
        stored: Option<&EntityPayload>,
    ) -> ServerResult<bool> {
        let previous = match stored {
            Some(EntityPayload::Attachment(previous)) => Some(previous),
            _ => None,
        };
        if attachment.deleted_at.is_some() {
            attachment.storage_key = previous.map(|p| p.storage_key.clone()).unwrap_or_default();
            return Ok(true);
        }
        if let Some(previous) = previous {
            if previous.file_hash == attachment.file_hash
                && !previous.storage_key.is_empty()
                && self.content.contains(&previous.storage_key)?
            {
                attachment.storage_key = previous.storage_key.clone();
                return Ok(true);
            }
        }
        match txn.find_storage_key(&attachment.file_hash)? {
            Some(key) => {
                attachment.storage_key = key;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves a note off a path claimed by another note.
    fn evict(&self, txn: &mut dyn StoreTxn, mut occupant: EntityPayload, now: i64) -> ServerResult<()> {
        let EntityPayload::Note(note) = &mut occupant else {
            return Ok(());
        };
        let base = format!("{}.conflict-{now}", note.path);
        let mut target = base.clone();
        let mut attempt = 1;
        while txn.find_by_path(EntityType::Note, &target)?.is_some() {
            target = format!("{base}-{attempt}");
            attempt += 1;
        }
        tracing::info!(note = %note.uuid, from = %note.path, to = %target, "moving note off contested path");
        note.path = target;
        note.updated_at = now.max(note.updated_at.saturating_add(1));

        txn.put(&occupant)?;
        txn.append_log(SERVER_DEVICE_ID, Operation::Update, &occupant)?;
        Ok(())
    }

    /// Deletes content objects no live attachment references any more.
    ///
    /// Runs inside a write transaction: a concurrent upload or push binding
    /// the same bytes either commits first and keeps them, or starts after
    /// the delete and writes them again.
    pub(crate) fn release_content(&self, user_id: &str, now: i64, mut keys: Vec<String>) {
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.release_unreferenced(user_id, now, &keys) {
            tracing::warn!(user = %user_id, error = %e, "failed to release attachment content");
        }
    }

    fn release_unreferenced(&self, user_id: &str, now: i64, keys: &[String]) -> ServerResult<()> {
        let mut txn = self.store.begin(user_id, now)?;
        for key in keys {
            if txn.live_references(key)? > 0 {
                continue;
            }
            match self.content.delete(key) {
                Ok(removed) => tracing::debug!(key = %key, removed, "released attachment content"),
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to delete attachment content"),
            }
        }
        txn.commit()
    }

    /// Returns sync log entries after `query.since` from other devices.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] if `query.device_id` is not
    /// covered by the token.
    pub fn changes(
        &self,
        auth: &AuthenticatedDevice,
        query: &ChangesQuery,
    ) -> ServerResult<ChangesResponse> {
        if let Some(device_id) = query.device_id.as_deref() {
            auth.authorize_device(device_id)?;
        }
        let exclude = query.device_id.as_deref().or(auth.device_id.as_deref());
        let limit = query
            .limit
            .unwrap_or(self.limits.default_page_size)
            .clamp(1, self.limits.max_page_size.max(1)) as usize;

        let page = self
            .store
            .log_page(&auth.user_id, query.since, exclude, limit)?;

        // Read after the page so a concurrent prune is never missed.
        let floor = self.store.log_floor()?;
        if query.since.saturating_add(1) < floor {
            tracing::debug!(user = %auth.user_id, since = query.since, floor, "changes feed needs resync");
            return Ok(ChangesResponse {
                changes: Vec::new(),
                timestamp: query.since,
                has_more: false,
                resync_required: true,
            });
        }

        Ok(ChangesResponse {
            changes: page.entries.iter().map(SyncLogEntry::to_remote).collect(),
            timestamp: page.watermark,
            has_more: page.has_more,
            resync_required: false,
        })
    }

    /// Returns every entity changed at or after `lastSyncTimestamp`.
    ///
    /// A pull from 0 returns the live entities only.
    pub fn pull(
        &self,
        auth: &AuthenticatedDevice,
        request: PullRequest,
    ) -> ServerResult<PullResponse> {
        let since = request.last_sync_timestamp.max(0);
        // Taken before the entities so nothing committed in between is skipped.
        let timestamp = self
            .store
            .latest_log_timestamp(&auth.user_id)?
            .unwrap_or_else(|| self.clock.now_millis().saturating_sub(1));

        let entities: Vec<EntityPayload> = self
            .store
            .changed_since(&auth.user_id, since)?
            .into_iter()
            .filter(|entity| since > 0 || !entity.is_tombstone())
            .collect();

        tracing::debug!(user = %auth.user_id, since, entities = entities.len(), "pull served");
        Ok(PullResponse::from_entities(entities, timestamp))
    }

    /// Reads one entity of the user.
    pub fn entity(
        &self,
        auth: &AuthenticatedDevice,
        key: &EntityKey,
    ) -> ServerResult<Option<EntityPayload>> {
        self.store.get(&auth.user_id, key)
    }
}
