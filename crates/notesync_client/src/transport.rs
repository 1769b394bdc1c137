//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use notesync_protocol::{
    Attachment, ChangesQuery, ChangesResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, UploadQuery,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles HTTP communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes a batch of changes.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Reads a page of the changes feed.
    async fn changes(&self, query: &ChangesQuery) -> SyncResult<ChangesResponse>;

    /// Pulls every entity changed since a watermark.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Uploads attachment bytes.
    async fn upload(&self, query: &UploadQuery, bytes: Vec<u8>) -> SyncResult<Attachment>;

    /// Downloads attachment bytes.
    async fn download(&self, attachment_id: &str) -> SyncResult<Vec<u8>>;
}

/// A scripted transport for testing.
///
/// Responses queued with the `queue_*` methods are returned in order; when
/// none are queued a push is fully applied and reads return nothing new.
/// Every request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    push_responses: Mutex<VecDeque<SyncResult<PushResponse>>>,
    changes_responses: Mutex<VecDeque<SyncResult<ChangesResponse>>>,
    pull_responses: Mutex<VecDeque<SyncResult<PullResponse>>>,
    attachments: Mutex<HashMap<String, Vec<u8>>>,
    pushes: Mutex<Vec<PushRequest>>,
    changes_queries: Mutex<Vec<ChangesQuery>>,
    pulls: Mutex<Vec<PullRequest>>,
    downloads: Mutex<Vec<String>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            push_responses: Mutex::new(VecDeque::new()),
            changes_responses: Mutex::new(VecDeque::new()),
            pull_responses: Mutex::new(VecDeque::new()),
            attachments: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            changes_queries: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// Queues the result of the next push.
    pub fn queue_push(&self, result: SyncResult<PushResponse>) {
        self.push_responses.lock().push_back(result);
    }

    /// Queues the result of the next changes request.
    pub fn queue_changes(&self, result: SyncResult<ChangesResponse>) {
        self.changes_responses.lock().push_back(result);
    }

    /// Queues the result of the next pull.
    pub fn queue_pull(&self, result: SyncResult<PullResponse>) {
        self.pull_responses.lock().push_back(result);
    }

    /// Makes attachment bytes available for download.
    pub fn put_attachment(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.attachments.lock().insert(id.into(), bytes);
    }

    /// Sets the connected state; a disconnected mock fails every call.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the recorded pushes.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Returns the recorded changes queries.
    pub fn changes_queries(&self) -> Vec<ChangesQuery> {
        self.changes_queries.lock().clone()
    }

    /// Returns the recorded pulls.
    pub fn pulls(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Returns the ids of recorded downloads.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("connection refused"))
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.check_connected()?;
        self.pushes.lock().push(request.clone());
        let scripted = self.push_responses.lock().pop_front();
        scripted.unwrap_or_else(|| {
            let applied = request.changes.iter().map(|c| c.key()).collect();
            let timestamp = request.changes.iter().map(|c| c.timestamp).max().unwrap_or(0);
            Ok(PushResponse::committed(applied, vec![], vec![], timestamp))
        })
    }

    async fn changes(&self, query: &ChangesQuery) -> SyncResult<ChangesResponse> {
        self.check_connected()?;
        self.changes_queries.lock().push(query.clone());
        let scripted = self.changes_responses.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ChangesResponse {
                changes: vec![],
                timestamp: query.since,
                has_more: false,
                resync_required: false,
            })
        })
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.check_connected()?;
        self.pulls.lock().push(*request);
        let scripted = self.pull_responses.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(PullResponse::from_entities([], request.last_sync_timestamp)))
    }

    async fn upload(&self, query: &UploadQuery, bytes: Vec<u8>) -> SyncResult<Attachment> {
        self.check_connected()?;
        let id = query.id.clone().unwrap_or_else(|| "mock-attachment".to_string());
        let attachment = Attachment {
            id: id.clone(),
            note_uuid: query.note_uuid.clone(),
            file_name: query.file_name.clone(),
            file_hash: notesync_protocol::sha256_hex(&bytes),
            file_size: bytes.len() as u64,
            mime_type: query.mime_type.clone(),
            storage_key: notesync_protocol::sha256_hex(&bytes),
            ..Attachment::default()
        };
        self.attachments.lock().insert(id, bytes);
        Ok(attachment)
    }

    async fn download(&self, attachment_id: &str) -> SyncResult<Vec<u8>> {
        self.check_connected()?;
        self.downloads.lock().push(attachment_id.to_string());
        self.attachments
            .lock()
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("attachment {attachment_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_protocol::{EntityKey, EntityType, PushChange};

    #[tokio::test]
    async fn disconnected_mock_fails_retryably() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let err = transport.pull(&PullRequest::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.pulls().is_empty());
    }

    #[tokio::test]
    async fn unscripted_push_applies_everything() {
        let transport = MockTransport::new();
        let key = EntityKey::new(EntityType::Note, "n1");
        let request = PushRequest::new(vec![PushChange::delete(key.clone(), 7, "dev")], "dev", None);

        let response = transport.push(&request).await.unwrap();
        assert_eq!(response.applied, vec![key]);
        assert_eq!(response.timestamp, 7);
        assert_eq!(transport.pushes(), vec![request]);
    }

    #[tokio::test]
    async fn scripted_responses_come_first() {
        let transport = MockTransport::new();
        transport.queue_push(Err(SyncError::from_status(500, "boom")));
        let request = PushRequest::new(vec![], "dev", None);
        assert!(transport.push(&request).await.is_err());
        assert!(transport.push(&request).await.is_ok());
    }
}
