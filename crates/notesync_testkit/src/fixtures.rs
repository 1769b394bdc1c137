//! Tokens, entities and push changes for tests.

use jsonwebtoken::{encode, EncodingKey, Header};
use notesync_protocol::{
    sha256_hex, Attachment, CalendarEvent, EntityPayload, Folder, Note, Operation, PushChange,
};
use notesync_server::Claims;

/// Secret every test server verifies tokens with.
pub const TEST_SECRET: &[u8] = b"notesync-test-secret-do-not-deploy";

/// Fixed instant used by clock-driven tests: 2023-11-14T22:13:20Z.
pub const EPOCH: i64 = 1_700_000_000_000;

/// Mints a token for `user`, optionally bound to `device`, valid for an hour.
pub fn mint_token(user: &str, device: Option<&str>) -> String {
    let now = chrono::Utc::now().timestamp();
    sign(Claims {
        sub: user.to_string(),
        device_id: device.map(str::to_string),
        exp: u64::try_from(now + 3600).unwrap_or(u64::MAX),
        iat: u64::try_from(now).ok(),
    })
}

/// Mints a token for `user` that expired an hour ago.
pub fn expired_token(user: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    sign(Claims {
        sub: user.to_string(),
        device_id: None,
        exp: u64::try_from(now - 3600).unwrap_or(0),
        iat: None,
    })
}

/// Signs arbitrary claims with [`TEST_SECRET`].
pub fn sign(claims: Claims) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET),
    )
    .expect("test claims always encode")
}

/// A note with a correct content hash.
pub fn note(uuid: &str, path: &str, content: &str, updated_at: i64) -> Note {
    let mut note = Note {
        uuid: uuid.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        content: content.to_string(),
        created_at: updated_at,
        updated_at,
        ..Note::default()
    };
    note.rehash();
    note
}

/// A folder at `path`.
pub fn folder(path: &str, updated_at: i64) -> Folder {
    Folder {
        path: path.to_string(),
        created_at: updated_at,
        updated_at,
        ..Folder::default()
    }
}

/// A one-hour calendar event.
pub fn event(uuid: &str, title: &str, updated_at: i64) -> CalendarEvent {
    CalendarEvent {
        uuid: uuid.to_string(),
        title: title.to_string(),
        start_time: updated_at,
        end_time: updated_at + 3_600_000,
        status: "confirmed".to_string(),
        created_at: updated_at,
        updated_at,
        ..CalendarEvent::default()
    }
}

/// Attachment metadata describing `bytes`.
///
/// The storage key is left empty; the server fills it in.
pub fn attachment(id: &str, note_uuid: &str, bytes: &[u8], updated_at: i64) -> Attachment {
    Attachment {
        id: id.to_string(),
        note_uuid: note_uuid.to_string(),
        file_name: format!("{id}.bin"),
        file_hash: sha256_hex(bytes),
        file_size: bytes.len() as u64,
        created_at: updated_at,
        updated_at,
        ..Attachment::default()
    }
}

/// A change pushing `entity` as it is.
///
/// Tombstones become deletes, everything else an update.
pub fn upsert(entity: impl Into<EntityPayload>, timestamp: i64, device: &str) -> PushChange {
    let entity = entity.into();
    let operation = if entity.is_tombstone() {
        Operation::Delete
    } else {
        Operation::Update
    };
    PushChange::new(&entity, operation, timestamp, device).expect("test entities always encode")
}
