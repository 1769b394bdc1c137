//! Local change queue.
//!
//! Every local edit becomes a [`QueuedChange`] with a queue sequence number.
//! A push takes a batch and marks it in flight; the response then settles
//! the batch by sequence number. Entries the server applied (or already
//! held) leave the queue, everything else returns to pending.
//!
//! A newer edit of an entity replaces its pending entry in place. An entry
//! that is in flight is never replaced, so an edit made while a push is
//! running gets its own entry and survives the acknowledgement of the
//! older one.

use crate::error::SyncResult;
use notesync_protocol::{EntityKey, EntityPayload, Operation, PushChange, PushResponse};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
    /// Queue sequence number.
    pub seq: u64,
    /// The mutation as it will be pushed.
    pub change: PushChange,
    #[serde(skip)]
    in_flight: bool,
}

impl QueuedChange {
    /// Returns the key of the changed entity.
    pub fn key(&self) -> EntityKey {
        self.change.key()
    }

    /// Returns true while the entry is part of an unanswered push.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Outcome of settling a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Entries removed from the queue.
    pub acknowledged: usize,
    /// Entries kept for a later push.
    pub retained: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<QueuedChange>,
    next_seq: u64,
}

impl QueueState {
    fn allocate(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Pending local mutations of one device.
#[derive(Debug)]
pub struct ChangeQueue {
    device_id: String,
    state: Mutex<QueueState>,
}

impl ChangeQueue {
    /// Creates an empty queue for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Recreates a queue from persisted entries.
    pub fn restore(device_id: impl Into<String>, mut entries: Vec<QueuedChange>) -> Self {
        entries.iter_mut().for_each(|e| e.in_flight = false);
        let next_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        Self {
            device_id: device_id.into(),
            state: Mutex::new(QueueState { entries, next_seq }),
        }
    }

    /// Returns the device the queue belongs to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queues a mutation carrying `entity` at local time `timestamp`.
    pub fn enqueue(
        &self,
        entity: &EntityPayload,
        operation: Operation,
        timestamp: i64,
    ) -> SyncResult<u64> {
        let change = PushChange::new(entity, operation, timestamp, self.device_id.as_str())?;
        Ok(self.insert(change))
    }

    /// Queues a delete of `key` without a snapshot.
    pub fn enqueue_delete(&self, key: EntityKey, timestamp: i64) -> u64 {
        self.insert(PushChange::delete(key, timestamp, self.device_id.as_str()))
    }

    fn insert(&self, mut change: PushChange) -> u64 {
        let mut state = self.state.lock();
        let seq = state.allocate();
        let key = change.key();

        if let Some(existing) = state
            .entries
            .iter_mut()
            .find(|e| !e.in_flight && e.key() == key)
        {
            if existing.change.operation == Operation::Create && change.operation == Operation::Update {
                change.operation = Operation::Create;
            }
            existing.seq = seq;
            existing.change = change;
            tracing::trace!(entity = %key, seq, "coalesced queued change");
            return seq;
        }

        state.entries.push(QueuedChange {
            seq,
            change,
            in_flight: false,
        });
        seq
    }

    /// Takes up to `limit` pending entries in queue order and marks them in
    /// flight.
    pub fn take_batch(&self, limit: usize) -> Vec<QueuedChange> {
        self.take_batch_skipping(limit, &HashSet::new())
    }

    /// Like [`ChangeQueue::take_batch`], but passes over the entries whose
    /// sequence number is in `skip`.
    ///
    /// A push cycle skips what it already sent, so entries the server keeps
    /// refusing cannot hold back the ones queued behind them.
    pub fn take_batch_skipping(&self, limit: usize, skip: &HashSet<u64>) -> Vec<QueuedChange> {
        let mut state = self.state.lock();
        let busy: HashSet<EntityKey> = state
            .entries
            .iter()
            .filter(|e| e.in_flight)
            .map(QueuedChange::key)
            .collect();

        let mut taken = HashSet::new();
        let mut batch = Vec::new();
        for entry in state.entries.iter_mut() {
            if batch.len() >= limit {
                break;
            }
            if skip.contains(&entry.seq) {
                continue;
            }
            let key = entry.key();
            if entry.in_flight || busy.contains(&key) || !taken.insert(key) {
                continue;
            }
            entry.in_flight = true;
            batch.push(entry.clone());
        }
        batch
    }

    /// Settles a pushed batch against the server's response.
    pub fn settle(&self, batch: &[QueuedChange], response: &PushResponse) -> Settlement {
        let seqs: HashSet<u64> = batch.iter().map(|e| e.seq).collect();
        let mut settlement = Settlement::default();
        let mut state = self.state.lock();
        state.entries.retain_mut(|entry| {
            if !entry.in_flight || !seqs.contains(&entry.seq) {
                return true;
            }
            if response.settled(&entry.key()) {
                settlement.acknowledged += 1;
                false
            } else {
                entry.in_flight = false;
                settlement.retained += 1;
                true
            }
        });
        settlement
    }

    /// Returns a failed batch to pending.
    pub fn release(&self, batch: &[QueuedChange]) {
        let seqs: HashSet<u64> = batch.iter().map(|e| e.seq).collect();
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut().filter(|e| seqs.contains(&e.seq)) {
            entry.in_flight = false;
        }
    }

    /// Returns true if a change to `key` is waiting to be pushed.
    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.state.lock().entries.iter().any(|e| &e.key() == key)
    }

    /// Returns the number of queued entries, in flight or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the queue for persistence.
    pub fn entries(&self) -> Vec<QueuedChange> {
        self.state.lock().entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_protocol::{Conflict, ConflictReason, EntityType, Note};
    use proptest::prelude::*;

    fn note(uuid: &str, content: &str, updated_at: i64) -> EntityPayload {
        let mut note = Note {
            uuid: uuid.into(),
            path: format!("{uuid}.md"),
            content: content.into(),
            updated_at,
            ..Note::default()
        };
        note.rehash();
        EntityPayload::Note(note)
    }

    fn key(uuid: &str) -> EntityKey {
        EntityKey::new(EntityType::Note, uuid)
    }

    fn applied(keys: &[&str]) -> PushResponse {
        PushResponse::committed(keys.iter().map(|k| key(k)).collect(), vec![], vec![], 1)
    }

    #[test]
    fn pending_edits_coalesce() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "a", 1), Operation::Create, 1).unwrap();
        queue.enqueue(&note("n2", "x", 2), Operation::Create, 2).unwrap();
        queue.enqueue(&note("n1", "ab", 3), Operation::Update, 3).unwrap();

        let entries = queue.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key(), key("n1"));
        assert_eq!(entries[0].change.operation, Operation::Create);
        assert!(entries[0].change.data_json.contains("\"ab\""));
        assert_eq!(entries[0].change.device_id, "dev-a");
    }

    #[test]
    fn edit_during_push_survives_acknowledgement() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "v1", 1), Operation::Update, 1).unwrap();

        let batch = queue.take_batch(10);
        assert_eq!(batch.len(), 1);
        queue.enqueue(&note("n1", "v2", 2), Operation::Update, 2).unwrap();
        assert_eq!(queue.len(), 2);

        let settlement = queue.settle(&batch, &applied(&["n1"]));
        assert_eq!(settlement.acknowledged, 1);

        let rest = queue.entries();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].change.data_json.contains("v2"));
        assert!(!rest[0].is_in_flight());
    }

    #[test]
    fn conflicted_entries_stay_queued() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "a", 1), Operation::Update, 1).unwrap();
        queue.enqueue(&note("n2", "b", 1), Operation::Update, 1).unwrap();
        let batch = queue.take_batch(10);

        let response = PushResponse::committed(
            vec![key("n1")],
            vec![],
            vec![Conflict::new(key("n2"), Operation::Update, 1, None, ConflictReason::StoreRejected)],
            5,
        );
        let settlement = queue.settle(&batch, &response);
        assert_eq!(settlement, Settlement { acknowledged: 1, retained: 1 });
        assert!(queue.contains_key(&key("n2")));
        assert!(!queue.contains_key(&key("n1")));
        assert_eq!(queue.take_batch(10).len(), 1);
    }

    #[test]
    fn unchanged_counts_as_settled() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "a", 1), Operation::Update, 1).unwrap();
        let batch = queue.take_batch(10);
        let response = PushResponse::committed(vec![], vec![key("n1")], vec![], 5);
        assert_eq!(queue.settle(&batch, &response).acknowledged, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn released_batch_is_retried() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "a", 1), Operation::Update, 1).unwrap();
        let batch = queue.take_batch(10);
        assert!(queue.take_batch(10).is_empty());
        queue.release(&batch);
        assert_eq!(queue.take_batch(10), batch);
    }

    #[test]
    fn batch_respects_limit_and_order() {
        let queue = ChangeQueue::new("dev-a");
        for i in 0..5 {
            queue.enqueue(&note(&format!("n{i}"), "x", i), Operation::Create, i).unwrap();
        }
        let first = queue.take_batch(2);
        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        let second = queue.take_batch(10);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn skipped_entries_let_later_ones_through() {
        let queue = ChangeQueue::new("dev-a");
        for i in 0..3 {
            queue.enqueue(&note(&format!("n{i}"), "x", i), Operation::Create, i).unwrap();
        }
        let refused = queue.take_batch(2);
        queue.release(&refused);

        let skip: HashSet<u64> = refused.iter().map(|e| e.seq).collect();
        let next = queue.take_batch_skipping(2, &skip);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key(), key("n2"));
        assert!(queue.take_batch_skipping(2, &skip).is_empty());
        assert_eq!(queue.take_batch(10), refused);
    }

    #[test]
    fn restore_resumes_sequence() {
        let queue = ChangeQueue::new("dev-a");
        queue.enqueue(&note("n1", "a", 1), Operation::Update, 1).unwrap();
        queue.enqueue_delete(key("n2"), 2);
        let _in_flight = queue.take_batch(1);

        let json = serde_json::to_string(&queue.entries()).unwrap();
        let restored = ChangeQueue::restore("dev-a", serde_json::from_str(&json).unwrap());
        assert_eq!(restored.len(), 2);
        assert!(restored.entries().iter().all(|e| !e.is_in_flight()));
        assert_eq!(restored.enqueue_delete(key("n3"), 3), 3);
    }

    proptest! {
        #[test]
        fn no_edit_is_lost(
            edits in prop::collection::vec((0u8..6, "[a-z]{0,8}"), 1..40),
            split in 0usize..40,
        ) {
            let queue = ChangeQueue::new("dev-a");
            let split = split.min(edits.len());

            for (i, (id, content)) in edits[..split].iter().enumerate() {
                let uuid = format!("n{id}");
                queue.enqueue(&note(&uuid, content, i as i64), Operation::Update, i as i64).unwrap();
            }
            let batch = queue.take_batch(usize::MAX);
            let mut after = std::collections::HashMap::new();
            for (i, (id, content)) in edits[split..].iter().enumerate() {
                let uuid = format!("n{id}");
                queue.enqueue(&note(&uuid, content, (split + i) as i64), Operation::Update, (split + i) as i64).unwrap();
                after.insert(uuid, content.clone());
            }

            let keys: Vec<EntityKey> = batch.iter().map(QueuedChange::key).collect();
            queue.settle(&batch, &PushResponse::committed(keys, vec![], vec![], 1));

            // Exactly the edits made after the batch was taken remain, one per entity.
            let remaining = queue.entries();
            prop_assert_eq!(remaining.len(), after.len());
            for entry in remaining {
                let payload = entry.change.payload().unwrap().unwrap();
                let EntityPayload::Note(n) = payload else { unreachable!() };
                prop_assert_eq!(Some(&n.content), after.get(&n.uuid));
            }
        }
    }
}
