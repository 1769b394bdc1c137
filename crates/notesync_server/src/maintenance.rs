//! Log compaction and consistency checks.

use crate::error::ServerResult;
use crate::reconcile::ReconcileEngine;
use notesync_protocol::{content_hash, EntityPayload};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

/// Problems found by [`ReconcileEngine::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    /// Number of entities inspected.
    pub entities: usize,
    /// Notes whose stored hash does not match their content, as `user/id`.
    pub hash_mismatches: Vec<String>,
    /// Live attachments whose bytes are missing, as `user/id`.
    pub missing_content: Vec<String>,
    /// Content objects no attachment row references.
    pub orphaned_objects: Vec<String>,
}

impl VerifyReport {
    /// Returns true if no problems were found.
    pub fn is_clean(&self) -> bool {
        self.hash_mismatches.is_empty()
            && self.missing_content.is_empty()
            && self.orphaned_objects.is_empty()
    }
}

impl ReconcileEngine {
    /// Deletes sync log entries older than `retention`.
    ///
    /// Devices whose watermark falls below the pruned range are told to
    /// resync on their next changes request.
    pub fn compact_log(&self, retention: Duration) -> ServerResult<usize> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let before = self.clock().now_millis().saturating_sub(retention_ms);
        let removed = self.store().prune_log(before)?;
        tracing::info!(removed, before, "sync log compacted");
        Ok(removed)
    }

    /// Checks stored entities against their content.
    pub fn verify(&self) -> ServerResult<VerifyReport> {
        let entities = self.store().all_entities()?;
        let mut report = VerifyReport {
            entities: entities.len(),
            ..VerifyReport::default()
        };
        let mut referenced = HashSet::new();

        for (user_id, entity) in &entities {
            match entity {
                EntityPayload::Note(note) if note.content_hash != content_hash(&note.content) => {
                    report.hash_mismatches.push(format!("{user_id}/{}", note.uuid));
                }
                EntityPayload::Attachment(a) => {
                    if !a.storage_key.is_empty() {
                        referenced.insert(a.storage_key.clone());
                    }
                    if a.deleted_at.is_none()
                        && (a.storage_key.is_empty() || !self.content().contains(&a.storage_key)?)
                    {
                        report.missing_content.push(format!("{user_id}/{}", a.id));
                    }
                }
                _ => {}
            }
        }

        report.orphaned_objects = self
            .content()
            .keys()?
            .into_iter()
            .filter(|key| !referenced.contains(key))
            .collect();

        if report.is_clean() {
            tracing::info!(entities = report.entities, "store verified");
        } else {
            tracing::warn!(
                hash_mismatches = report.hash_mismatches.len(),
                missing_content = report.missing_content.len(),
                orphaned_objects = report.orphaned_objects.len(),
                "store verification found problems"
            );
        }
        Ok(report)
    }
}
