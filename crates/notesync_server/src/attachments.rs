//! Attachment upload and download.
//!
//! Bytes live in the content store under their SHA-256. An upload writes the
//! bytes first and the metadata row second; if the row cannot be committed,
//! bytes written by this upload are removed again.

use crate::auth::AuthenticatedDevice;
use crate::error::{ServerError, ServerResult};
use crate::reconcile::ReconcileEngine;
use notesync_protocol::{
    Attachment, EntityKey, EntityPayload, EntityType, Operation, UploadQuery,
};
use notesync_storage::{content_key, StorageError};

impl ReconcileEngine {
    /// Stores uploaded bytes and their attachment row.
    ///
    /// Re-uploading bytes the user already holds reuses the stored object.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRequest`] if the note or file name is
    /// missing, and store errors if the bytes or row cannot be written.
    pub fn upload_attachment(
        &self,
        auth: &AuthenticatedDevice,
        query: &UploadQuery,
        bytes: &[u8],
    ) -> ServerResult<Attachment> {
        auth.authorize_device(&query.device_id)?;
        if query.note_uuid.trim().is_empty() {
            return Err(ServerError::InvalidRequest("noteUuid is required".into()));
        }
        if query.file_name.trim().is_empty() {
            return Err(ServerError::InvalidRequest("fileName is required".into()));
        }

        let id = match query.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let user_id = auth.user_id.as_str();
        let now = self.clock().now_millis();
        let file_hash = content_key(bytes);

        let mut txn = self.store().begin(user_id, now)?;
        let previous = match txn.get(&EntityKey::new(EntityType::Attachment, id.clone()))? {
            Some(EntityPayload::Attachment(previous)) => Some(previous),
            _ => None,
        };

        let mut reusable = txn.find_storage_key(&file_hash)?;
        if let Some(key) = &reusable {
            if !self.content().contains(key)? {
                reusable = None;
            }
        }
        let (storage_key, fresh) = match reusable {
            Some(key) => (key, false),
            None => {
                let existed = self.content().contains(&file_hash)?;
                (self.content().put(bytes)?, !existed)
            }
        };

        let attachment = Attachment {
            id,
            user_id: user_id.to_string(),
            note_uuid: query.note_uuid.clone(),
            file_name: query.file_name.clone(),
            file_hash,
            file_size: bytes.len() as u64,
            mime_type: query.mime_type.clone().filter(|m| !m.trim().is_empty()),
            storage_key: storage_key.clone(),
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: previous
                .as_ref()
                .map_or(now, |p| now.max(p.updated_at.saturating_add(1))),
            deleted_at: None,
        };
        let operation = if previous.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        let payload = EntityPayload::Attachment(attachment.clone());

        let written = txn
            .put(&payload)
            .and_then(|()| txn.append_log(&query.device_id, operation, &payload));
        let committed = match written {
            Ok(_) => txn.commit(),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            if fresh {
                if let Err(e) = self.content().delete(&storage_key) {
                    tracing::warn!(key = %storage_key, error = %e, "failed to remove uploaded bytes");
                }
            }
            return Err(err);
        }

        let released = previous
            .into_iter()
            .filter(|p| p.deleted_at.is_none() && !p.storage_key.is_empty())
            .map(|p| p.storage_key)
            .filter(|key| *key != storage_key)
            .collect();
        self.release_content(user_id, now, released);

        let timestamp = self.store().latest_log_timestamp(user_id)?.unwrap_or(now);
        self.hub().notify(user_id, &query.device_id, timestamp);
        tracing::info!(
            user = %user_id,
            device = %query.device_id,
            attachment = %attachment.id,
            size = attachment.file_size,
            deduplicated = !fresh,
            "attachment uploaded"
        );
        Ok(attachment)
    }

    /// Reads a live attachment and its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] if the attachment does not exist,
    /// is deleted, or its bytes are gone.
    pub fn download_attachment(
        &self,
        auth: &AuthenticatedDevice,
        id: &str,
    ) -> ServerResult<(Attachment, Vec<u8>)> {
        let key = EntityKey::new(EntityType::Attachment, id);
        let attachment = match self.store().get(&auth.user_id, &key)? {
            Some(EntityPayload::Attachment(a)) if a.deleted_at.is_none() => a,
            _ => return Err(ServerError::NotFound(format!("attachment {id}"))),
        };
        let bytes = self
            .content()
            .get(&attachment.storage_key)
            .map_err(|err| match err {
                StorageError::NotFound(_) | StorageError::InvalidKey(_) => {
                    ServerError::NotFound(format!("content of attachment {id}"))
                }
                other => other.into(),
            })?;
        Ok((attachment, bytes))
    }
}
