//! The sync client: local edits in, server state out.
//!
//! A cycle pushes the change queue in batches, then pulls. The pull reads
//! the changes feed from the stored watermark, or falls back to a full
//! `/sync/pull` on a fresh device or when the server reports that its log
//! was compacted past the watermark.
//!
//! Pulled entities are written to the [`LocalStore`] and never enqueued.
//! While a local change to the same entity is still queued the pulled copy
//! is skipped; the server's version arrives again once the local change has
//! been pushed.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::queue::{ChangeQueue, QueuedChange, Settlement};
use crate::transport::SyncTransport;
use notesync_protocol::{
    Attachment, ChangesQuery, Conflict, EntityKey, EntityPayload, EntityType, Operation,
    PullRequest, PushRequest, PushResponse, UploadQuery,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the client is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No cycle is running.
    Idle,
    /// Pushing queued changes.
    Pushing,
    /// Pulling remote changes.
    Pulling,
}

impl ClientState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, ClientState::Idle)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of queued changes the server acknowledged.
    pub changes_pushed: u64,
    /// Total number of remote entities applied locally.
    pub changes_pulled: u64,
    /// Total number of conflicts reported by the server.
    pub conflicts_encountered: u64,
    /// Number of full resyncs after a compacted log.
    pub full_resyncs: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Number of queued changes acknowledged.
    pub pushed: usize,
    /// Conflicts reported for this cycle's pushes; the changes stay queued.
    pub conflicts: Vec<Conflict>,
    /// Number of remote entities applied.
    pub pulled: usize,
    /// Whether the pull had to start over from scratch.
    pub resynced: bool,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

type ClockFn = dyn Fn() -> i64 + Send + Sync;

/// Synchronizes a [`LocalStore`] with the server through a [`SyncTransport`].
pub struct SyncClient<T: SyncTransport, L: LocalStore> {
    config: SyncConfig,
    transport: Arc<T>,
    local: Arc<L>,
    queue: ChangeQueue,
    state: RwLock<ClientState>,
    stats: RwLock<SyncStats>,
    cycle: tokio::sync::Mutex<()>,
    clock: Box<ClockFn>,
}

impl<T: SyncTransport, L: LocalStore> fmt::Debug for SyncClient<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("device_id", &self.config.device_id)
            .field("state", &self.state())
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: SyncTransport, L: LocalStore> SyncClient<T, L> {
    /// Creates a new sync client with an empty queue.
    pub fn new(config: SyncConfig, transport: T, local: L) -> Self {
        let queue = ChangeQueue::new(config.device_id.clone());
        Self {
            config,
            transport: Arc::new(transport),
            local: Arc::new(local),
            queue,
            state: RwLock::new(ClientState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle: tokio::sync::Mutex::new(()),
            clock: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replaces the change queue, e.g. with one restored from disk.
    pub fn with_queue(mut self, queue: ChangeQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Replaces the wall clock used to stamp local edits.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the local store.
    pub fn local(&self) -> &L {
        &self.local
    }

    /// Returns the change queue.
    pub fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    /// Gets the current state.
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Gets the current statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.write() = state;
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Records a local edit: stamps it, stores it and queues it for push.
    ///
    /// Returns the entity as stored.
    pub fn save(&self, entity: impl Into<EntityPayload>) -> SyncResult<EntityPayload> {
        let mut entity = entity.into();
        let now = self.now();
        let existing = self.local.get(&entity.key())?;

        let operation = match &existing {
            Some(stored) if !stored.is_tombstone() => Operation::Update,
            _ => Operation::Create,
        };
        if entity.created_at() == 0 {
            let created = existing.as_ref().map_or(now, EntityPayload::created_at);
            entity.set_created_at(created);
        }
        entity.set_updated_at(now);
        if let EntityPayload::Note(note) = &mut entity {
            note.rehash();
        }

        self.local.put(entity.clone())?;
        let seq = self.queue.enqueue(&entity, operation, now)?;
        tracing::debug!(entity = %entity.key(), %operation, seq, "queued local edit");
        Ok(entity)
    }

    /// Records a local delete.
    ///
    /// An entity held locally becomes a tombstone and its snapshot is pushed;
    /// an unknown entity is deleted by key alone.
    pub fn delete(&self, key: EntityKey) -> SyncResult<()> {
        let now = self.now();
        let seq = match self.local.get(&key)? {
            Some(mut entity) => {
                entity.set_deleted_at(Some(now));
                entity.set_updated_at(now);
                self.local.put(entity.clone())?;
                self.queue.enqueue(&entity, Operation::Delete, now)?
            }
            None => self.queue.enqueue_delete(key.clone(), now),
        };
        tracing::debug!(entity = %key, seq, "queued local delete");
        Ok(())
    }

    /// Runs one sync cycle: push the queue, then pull.
    ///
    /// Cycles never overlap; a second caller waits for the running cycle.
    pub async fn sync(&self) -> SyncResult<SyncCycleResult> {
        let _cycle = self.cycle.lock().await;
        let start = Instant::now();
        let mut result = SyncCycleResult::default();

        self.set_state(ClientState::Pushing);
        if let Err(e) = self.push_pending(&mut result).await {
            return Err(self.fail(e));
        }

        self.set_state(ClientState::Pulling);
        if let Err(e) = self.pull_changes(&mut result).await {
            return Err(self.fail(e));
        }

        self.set_state(ClientState::Idle);
        result.duration = start.elapsed();
        self.record(&result);
        tracing::info!(
            pushed = result.pushed,
            pulled = result.pulled,
            conflicts = result.conflicts.len(),
            elapsed_ms = result.duration.as_millis() as u64,
            "sync cycle complete"
        );
        Ok(result)
    }

    /// Pulls without pushing; used when the server hints at new changes.
    pub async fn pull(&self) -> SyncResult<SyncCycleResult> {
        let _cycle = self.cycle.lock().await;
        let start = Instant::now();
        let mut result = SyncCycleResult::default();

        self.set_state(ClientState::Pulling);
        if let Err(e) = self.pull_changes(&mut result).await {
            return Err(self.fail(e));
        }

        self.set_state(ClientState::Idle);
        result.duration = start.elapsed();
        self.record(&result);
        tracing::debug!(pulled = result.pulled, "pull complete");
        Ok(result)
    }

    fn fail(&self, error: SyncError) -> SyncError {
        self.set_state(ClientState::Idle);
        self.stats.write().last_error = Some(error.to_string());
        tracing::warn!(error = %error, retryable = error.is_retryable(), "sync failed");
        error
    }

    fn record(&self, result: &SyncCycleResult) {
        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.changes_pushed += result.pushed as u64;
        stats.changes_pulled += result.pulled as u64;
        stats.conflicts_encountered += result.conflicts.len() as u64;
        if result.resynced {
            stats.full_resyncs += 1;
        }
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
    }

    async fn push_pending(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        let limit = self.config.push_batch_size;
        let mut sent = HashSet::new();
        loop {
            let batch = InFlight::take(&self.queue, limit, &sent);
            if batch.entries.is_empty() {
                return Ok(());
            }

            let request = PushRequest::new(
                batch.entries.iter().map(|e| e.change.clone()).collect(),
                self.config.device_id.as_str(),
                Some(self.now()),
            );
            sent.extend(batch.entries.iter().map(|e| e.seq));
            let response = self.transport.push(&request).await?;
            if !response.success {
                return Err(SyncError::Rejected("push was not committed".into()));
            }

            let settlement = batch.settle(&response);
            result.pushed += settlement.acknowledged;
            for conflict in &response.conflicts {
                tracing::warn!(
                    entity = %conflict.key(),
                    reason = ?conflict.reason,
                    "push conflict; change stays queued"
                );
            }
            result.conflicts.extend(response.conflicts);

            // Retained entries wait for the next cycle.
            if request.changes.len() < limit {
                return Ok(());
            }
        }
    }

    async fn pull_changes(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        let mut since = self.local.watermark()?;
        if since == 0 {
            return self.full_pull(result).await;
        }

        loop {
            let query = ChangesQuery {
                since,
                device_id: Some(self.config.device_id.clone()),
                limit: Some(self.config.changes_page_size),
            };
            let page = self.transport.changes(&query).await?;
            if page.resync_required {
                tracing::info!(since, "change log compacted past watermark; resyncing");
                result.resynced = true;
                return self.full_pull(result).await;
            }

            for change in page.changes {
                if self.apply_remote(change.snapshot)? {
                    result.pulled += 1;
                }
            }

            let next = page.timestamp.max(since);
            self.local.set_watermark(next)?;
            if !page.has_more || next == since {
                return Ok(());
            }
            since = next;
        }
    }

    async fn full_pull(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        let response = self.transport.pull(&PullRequest::default()).await?;
        let timestamp = response.timestamp;
        for entity in response.into_entities() {
            if self.apply_remote(entity)? {
                result.pulled += 1;
            }
        }
        self.local.set_watermark(timestamp)?;
        Ok(())
    }

    fn apply_remote(&self, entity: EntityPayload) -> SyncResult<bool> {
        let key = entity.key();
        if self.queue.contains_key(&key) {
            tracing::debug!(entity = %key, "local change pending; remote copy skipped");
            return Ok(false);
        }
        self.local.put(entity)?;
        Ok(true)
    }

    /// Returns attachment bytes, downloading them on first use.
    ///
    /// Downloaded bytes are checked against the locally known `fileHash`.
    pub async fn fetch_attachment(&self, attachment_id: &str) -> SyncResult<Vec<u8>> {
        if let Some(bytes) = self.local.attachment_bytes(attachment_id)? {
            return Ok(bytes);
        }

        let bytes = self.transport.download(attachment_id).await?;
        let key = EntityKey::new(EntityType::Attachment, attachment_id);
        if let Some(EntityPayload::Attachment(meta)) = self.local.get(&key)? {
            let actual = notesync_protocol::sha256_hex(&bytes);
            if actual != meta.file_hash {
                return Err(SyncError::Protocol(format!(
                    "attachment {attachment_id} hash mismatch: expected {}, got {actual}",
                    meta.file_hash
                )));
            }
        }
        self.local.store_attachment_bytes(attachment_id, bytes.clone())?;
        tracing::debug!(attachment = attachment_id, size = bytes.len(), "attachment fetched");
        Ok(bytes)
    }

    /// Uploads a file for a note and records its metadata locally.
    pub async fn upload_attachment(
        &self,
        note_uuid: &str,
        file_name: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> SyncResult<Attachment> {
        let query = UploadQuery {
            id: None,
            note_uuid: note_uuid.to_string(),
            file_name: file_name.to_string(),
            mime_type: mime_type.map(str::to_string),
            device_id: self.config.device_id.clone(),
        };
        let attachment = self.transport.upload(&query, bytes.clone()).await?;
        self.local.store_attachment_bytes(&attachment.id, bytes)?;
        self.local.put(attachment.clone().into())?;
        tracing::info!(attachment = %attachment.id, note = note_uuid, "attachment uploaded");
        Ok(attachment)
    }
}

/// A batch marked in flight; returned to pending unless settled.
///
/// Dropping the batch on an error or a cancelled cycle releases it.
struct InFlight<'a> {
    queue: &'a ChangeQueue,
    entries: Vec<QueuedChange>,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn take(queue: &'a ChangeQueue, limit: usize, skip: &HashSet<u64>) -> Self {
        Self {
            queue,
            entries: queue.take_batch_skipping(limit, skip),
            settled: false,
        }
    }

    fn settle(mut self, response: &PushResponse) -> Settlement {
        self.settled = true;
        self.queue.settle(&self.entries, response)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled && !self.entries.is_empty() {
            self.queue.release(&self.entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryLocalStore;
    use crate::transport::MockTransport;
    use notesync_protocol::{ChangesResponse, ConflictReason, Note, PullResponse, RemoteChange};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn config() -> SyncConfig {
        SyncConfig::new("http://sync.test", "tok", "dev-a").with_push_batch_size(2)
    }

    fn client() -> SyncClient<MockTransport, MemoryLocalStore> {
        let ticks = Arc::new(AtomicI64::new(1_000));
        SyncClient::new(config(), MockTransport::new(), MemoryLocalStore::new())
            .with_clock(move || ticks.fetch_add(1, Ordering::SeqCst))
    }

    fn note(uuid: &str, content: &str) -> Note {
        Note {
            uuid: uuid.into(),
            name: format!("{uuid}.md"),
            path: format!("{uuid}.md"),
            content: content.into(),
            ..Note::default()
        }
    }

    fn remote(uuid: &str, content: &str, ts: i64) -> RemoteChange {
        let mut note = note(uuid, content);
        note.updated_at = ts;
        note.rehash();
        RemoteChange {
            id: ts as u64,
            device_id: "dev-b".into(),
            entity_id: uuid.into(),
            operation: Operation::Update,
            snapshot: note.into(),
            timestamp: ts,
        }
    }

    fn key(uuid: &str) -> EntityKey {
        EntityKey::new(EntityType::Note, uuid)
    }

    #[test]
    fn client_initial_state() {
        let client = client();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(!client.state().is_active());
        assert_eq!(client.stats().cycles_completed, 0);
        assert!(client.queue().is_empty());
    }

    #[test]
    fn save_stamps_and_queues() {
        let client = client();
        let stored = client.save(note("n1", "hello")).unwrap();

        assert_eq!(stored.created_at(), stored.updated_at());
        assert!(stored.content_hash().is_some_and(|h| !h.is_empty()));
        assert_eq!(client.local().get(&key("n1")).unwrap(), Some(stored));

        let entries = client.queue().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change.operation, Operation::Create);
    }

    #[test]
    fn delete_of_a_known_entity_pushes_a_tombstone() {
        let client = client();
        client.save(note("n1", "hello")).unwrap();
        client.delete(key("n1")).unwrap();

        assert!(client.local().get(&key("n1")).unwrap().unwrap().is_tombstone());
        let entries = client.queue().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change.operation, Operation::Delete);
        assert!(!entries[0].change.data_json.is_empty());
    }

    #[tokio::test]
    async fn sync_pushes_in_batches_then_pulls() {
        let client = client();
        for uuid in ["a", "b", "c"] {
            client.save(note(uuid, uuid)).unwrap();
        }

        let result = client.sync().await.unwrap();
        assert_eq!(result.pushed, 3);
        assert!(client.queue().is_empty());

        let pushes = client.transport().pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].changes.len(), 2);
        assert!(pushes.iter().all(|p| p.client_timestamp.is_some()));
        // Fresh device: full pull, not the changes feed.
        assert_eq!(client.transport().pulls().len(), 1);
        assert!(client.transport().changes_queries().is_empty());
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(client.stats().changes_pushed, 3);
    }

    #[tokio::test]
    async fn network_failure_keeps_the_queue() {
        let client = client();
        client.save(note("n1", "hello")).unwrap();
        client.transport().set_connected(false);

        let err = client.sync().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.queue().len(), 1);
        assert!(!client.queue().entries()[0].is_in_flight());
        assert!(client.stats().last_error.is_some());

        client.transport().set_connected(true);
        let result = client.sync().await.unwrap();
        assert_eq!(result.pushed, 1);
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn conflicted_changes_stay_queued() {
        let client = client();
        client.save(note("n1", "one")).unwrap();
        client.save(note("n2", "two")).unwrap();
        let conflict = Conflict::new(
            key("n2"),
            Operation::Create,
            5,
            None,
            ConflictReason::StoreRejected,
        );
        client
            .transport()
            .queue_push(Ok(PushResponse::committed(vec![key("n1")], vec![], vec![conflict], 9)));

        let result = client.sync().await.unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert!(client.queue().contains_key(&key("n2")));
        assert_eq!(client.transport().pushes().len(), 1);
    }

    #[tokio::test]
    async fn refused_changes_do_not_block_the_rest_of_the_queue() {
        let client = client();
        for uuid in ["stuck1", "stuck2", "fine"] {
            client.save(note(uuid, uuid)).unwrap();
        }
        let refusal = || {
            let conflicts = ["stuck1", "stuck2"]
                .into_iter()
                .map(|uuid| {
                    Conflict::new(key(uuid), Operation::Create, 5, None, ConflictReason::MissingContent)
                })
                .collect();
            Ok(PushResponse::committed(vec![], vec![], conflicts, 9))
        };

        client.transport().queue_push(refusal());
        let result = client.sync().await.unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(result.conflicts.len(), 2);
        let pushes = client.transport().pushes();
        assert_eq!(pushes.len(), 2);
        let second: Vec<&str> = pushes[1].changes.iter().map(|c| c.entity_id.as_str()).collect();
        assert_eq!(second, vec!["fine"]);
        assert!(!client.queue().contains_key(&key("fine")));
        assert_eq!(client.queue().len(), 2);

        // Next cycle retries the refused pair once and stops.
        client.transport().queue_push(refusal());
        let result = client.sync().await.unwrap();
        assert_eq!(result.pushed, 0);
        assert_eq!(client.transport().pushes().len(), 3);
        assert_eq!(client.queue().len(), 2);
    }

    #[tokio::test]
    async fn pull_pages_through_the_changes_feed() {
        let client = client();
        client.local().set_watermark(10).unwrap();
        client.transport().queue_changes(Ok(ChangesResponse {
            changes: vec![remote("a", "x", 11), remote("b", "y", 12)],
            timestamp: 12,
            has_more: true,
            resync_required: false,
        }));
        client.transport().queue_changes(Ok(ChangesResponse {
            changes: vec![remote("c", "z", 13)],
            timestamp: 13,
            has_more: false,
            resync_required: false,
        }));

        let result = client.pull().await.unwrap();
        assert_eq!(result.pulled, 3);
        assert_eq!(client.local().watermark().unwrap(), 13);

        let queries = client.transport().changes_queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].since, 10);
        assert_eq!(queries[1].since, 12);
        assert_eq!(queries[0].device_id.as_deref(), Some("dev-a"));
        assert!(client.queue().is_empty(), "pulled entities must not be enqueued");
    }

    #[tokio::test]
    async fn compacted_log_triggers_a_full_resync() {
        let client = client();
        client.local().set_watermark(10).unwrap();
        client.transport().queue_changes(Ok(ChangesResponse {
            changes: vec![],
            timestamp: 50,
            has_more: false,
            resync_required: true,
        }));
        let mut n = note("a", "fresh");
        n.updated_at = 40;
        client
            .transport()
            .queue_pull(Ok(PullResponse::from_entities([n.into()], 50)));

        let result = client.pull().await.unwrap();
        assert!(result.resynced);
        assert_eq!(result.pulled, 1);
        assert_eq!(client.local().watermark().unwrap(), 50);
        assert_eq!(client.transport().pulls()[0].last_sync_timestamp, 0);
        assert_eq!(client.stats().full_resyncs, 1);
    }

    #[tokio::test]
    async fn pending_local_edit_is_not_overwritten_by_a_pull() {
        let client = client();
        client.local().set_watermark(10).unwrap();
        client.save(note("a", "mine")).unwrap();
        client.transport().queue_changes(Ok(ChangesResponse {
            changes: vec![remote("a", "theirs", 11)],
            timestamp: 11,
            has_more: false,
            resync_required: false,
        }));

        let result = client.pull().await.unwrap();
        assert_eq!(result.pulled, 0);
        match client.local().get(&key("a")).unwrap() {
            Some(EntityPayload::Note(n)) => assert_eq!(n.content, "mine"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.local().watermark().unwrap(), 11);
    }

    #[tokio::test]
    async fn attachments_download_once() {
        let client = client();
        client.transport().put_attachment("att-1", b"bytes".to_vec());

        assert_eq!(client.fetch_attachment("att-1").await.unwrap(), b"bytes");
        assert_eq!(client.fetch_attachment("att-1").await.unwrap(), b"bytes");
        assert_eq!(client.transport().downloads(), vec!["att-1".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_attachment_bytes_are_rejected() {
        let client = client();
        let meta = Attachment {
            id: "att-1".into(),
            note_uuid: "n1".into(),
            file_hash: notesync_protocol::sha256_hex(b"expected"),
            ..Attachment::default()
        };
        client.local().put(meta.into()).unwrap();
        client.transport().put_attachment("att-1", b"tampered".to_vec());

        let err = client.fetch_attachment("att-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(client.local().attachment_bytes("att-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_records_metadata_and_bytes() {
        let client = client();
        let attachment = client
            .upload_attachment("n1", "a.png", Some("image/png"), b"png".to_vec())
            .await
            .unwrap();

        assert_eq!(attachment.note_uuid, "n1");
        assert!(client.local().has_attachment_bytes(&attachment.id));
        let key = EntityKey::new(EntityType::Attachment, attachment.id.clone());
        assert!(client.local().get(&key).unwrap().is_some());
    }
}
