//! Property-based test generators using proptest.
//!
//! Generated entities always satisfy the wire invariants: notes carry the
//! hash of their content, and timestamps stay in a range where skew
//! arithmetic cannot overflow.

use notesync_protocol::{EntityPayload, Folder, Note, Operation, PushChange};
use proptest::prelude::*;

/// Strategy for plausible epoch-millisecond timestamps (2020 to 2035).
pub fn timestamp_strategy() -> impl Strategy<Value = i64> {
    1_577_836_800_000i64..2_051_222_400_000i64
}

/// Strategy for clock offsets of up to one day either way.
pub fn skew_strategy() -> impl Strategy<Value = i64> {
    -86_400_000i64..86_400_000i64
}

/// Strategy for vault-relative note paths.
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("([a-z]{1,8}/){0,2}[a-z0-9]{1,12}\\.md")
        .expect("Invalid regex")
}

/// Strategy for note bodies.
pub fn content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[ -~\n]{0,200}").expect("Invalid regex")
}

/// Strategy for notes with a correct content hash.
pub fn note_strategy() -> impl Strategy<Value = Note> {
    (
        "[a-f0-9]{8}",
        path_strategy(),
        content_strategy(),
        any::<bool>(),
        timestamp_strategy(),
    )
        .prop_map(|(uuid, path, content, is_favorite, updated_at)| {
            let mut note = crate::fixtures::note(&uuid, &path, &content, updated_at);
            note.is_favorite = is_favorite;
            note
        })
}

/// Strategy for folders.
pub fn folder_strategy() -> impl Strategy<Value = Folder> {
    (
        prop::string::string_regex("[a-z]{1,8}(/[a-z]{1,8}){0,2}").expect("Invalid regex"),
        any::<bool>(),
        timestamp_strategy(),
    )
        .prop_map(|(path, is_favorite, updated_at)| Folder {
            is_favorite,
            ..crate::fixtures::folder(&path, updated_at)
        })
}

/// Strategy for note and folder payloads, sometimes tombstoned.
pub fn entity_payload_strategy() -> impl Strategy<Value = EntityPayload> {
    let live = prop_oneof![
        3 => note_strategy().prop_map(EntityPayload::Note),
        1 => folder_strategy().prop_map(EntityPayload::Folder),
    ];
    (live, prop::bool::weighted(0.2)).prop_map(|(mut payload, deleted)| {
        if deleted {
            let at = payload.updated_at();
            payload.set_deleted_at(Some(at));
        }
        payload
    })
}

/// Strategy for a push change of a generated entity from `device`.
pub fn push_change_strategy(device: &'static str) -> impl Strategy<Value = PushChange> {
    entity_payload_strategy().prop_map(move |payload| {
        let operation = if payload.is_tombstone() {
            Operation::Delete
        } else {
            Operation::Update
        };
        let timestamp = payload.updated_at();
        PushChange::new(&payload, operation, timestamp, device)
            .expect("generated entities always encode")
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
