//! SQLite entity store.
//!
//! Entities are stored as JSON documents next to the columns the engine
//! queries on. The sync log keeps one JSON snapshot per change.
//!
//! ## Tables
//!
//! - `entities` - one row per `(user, type, id)`
//! - `sync_log` - append-only change log
//! - `meta` - scalar settings such as the log floor

use super::{next_log_timestamp, EntityStore, LogPage, StoreTxn, SyncLogEntry};
use crate::error::{ServerError, ServerResult};
use notesync_protocol::{EntityKey, EntityPayload, EntityType, Operation};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS entities (
        user_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        path TEXT,
        file_hash TEXT,
        storage_key TEXT,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER,
        data TEXT NOT NULL,
        PRIMARY KEY (user_id, entity_type, entity_id)
    );

    -- At most one live entity per path
    CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_path
        ON entities(user_id, entity_type, path)
        WHERE path IS NOT NULL AND deleted_at IS NULL;

    CREATE INDEX IF NOT EXISTS idx_entities_updated_at ON entities(user_id, updated_at);
    CREATE INDEX IF NOT EXISTS idx_entities_file_hash ON entities(user_id, file_hash);
    CREATE INDEX IF NOT EXISTS idx_entities_storage_key ON entities(storage_key);

    CREATE TABLE IF NOT EXISTS sync_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_log_user_ts ON sync_log(user_id, timestamp);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
"#;

const LOG_COLUMNS: &str = "id, user_id, device_id, operation, snapshot, timestamp";

/// An entity store backed by a SQLite database.
///
/// All access goes through one connection. A transaction holds it from
/// `begin` until commit or drop and runs as `BEGIN IMMEDIATE`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: &Path) -> ServerResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> ServerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ServerResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl EntityStore for SqliteStore {
    fn begin(&self, user_id: &str, now: i64) -> ServerResult<Box<dyn StoreTxn + '_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let mut txn = SqliteTxn {
            conn,
            user_id: user_id.to_string(),
            now,
            last_ts: None,
            saved_ts: None,
            finished: false,
        };
        txn.last_ts = latest_timestamp(&txn.conn, user_id)?;
        Ok(Box::new(txn))
    }

    fn get(&self, user_id: &str, key: &EntityKey) -> ServerResult<Option<EntityPayload>> {
        get_entity(&self.conn.lock(), user_id, key)
    }

    fn changed_since(&self, user_id: &str, since: i64) -> ServerResult<Vec<EntityPayload>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM entities
             WHERE user_id = ?1 AND (updated_at >= ?2 OR deleted_at >= ?2)
             ORDER BY entity_type, updated_at",
        )?;
        let rows = stmt.query_map(params![user_id, since], |row| row.get::<_, String>(0))?;
        rows.map(|data| decode_entity(&data?)).collect()
    }

    fn log_page(
        &self,
        user_id: &str,
        since: i64,
        exclude_device: Option<&str>,
        limit: usize,
    ) -> ServerResult<LogPage> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM sync_log
             WHERE user_id = ?1 AND timestamp > ?2 AND (?3 IS NULL OR device_id <> ?3)
             ORDER BY timestamp LIMIT ?4"
        ))?;
        let fetch = limit.saturating_add(1).min(i64::MAX as usize) as i64;
        let rows = stmt.query_map(params![user_id, since, exclude_device, fetch], LogRow::read)?;
        let entries = rows
            .map(|row| row?.into_entry())
            .collect::<ServerResult<Vec<_>>>()?;
        let latest = latest_timestamp(&conn, user_id)?;
        Ok(LogPage::assemble(entries, limit, since, latest))
    }

    fn latest_log_timestamp(&self, user_id: &str) -> ServerResult<Option<i64>> {
        latest_timestamp(&self.conn.lock(), user_id)
    }

    fn log_floor(&self) -> ServerResult<i64> {
        let conn = self.conn.lock();
        let floor = conn
            .query_row("SELECT value FROM meta WHERE key = 'log_floor'", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(floor.unwrap_or(0))
    }

    fn prune_log(&self, before: i64) -> ServerResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM sync_log WHERE timestamp < ?1", params![before])?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('log_floor', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![before],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn all_entities(&self) -> ServerResult<Vec<(String, EntityPayload)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, data FROM entities ORDER BY user_id, entity_type, entity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.map(|row| {
            let (user_id, data) = row?;
            Ok((user_id, decode_entity(&data)?))
        })
        .collect()
    }

    fn log_entries(
        &self,
        user_id: Option<&str>,
        since: i64,
        limit: usize,
    ) -> ServerResult<Vec<SyncLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM sync_log
             WHERE (?1 IS NULL OR user_id = ?1) AND timestamp > ?2
             ORDER BY id LIMIT ?3"
        ))?;
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = stmt.query_map(params![user_id, since, limit], LogRow::read)?;
        rows.map(|row| row?.into_entry()).collect()
    }
}

struct LogRow {
    id: i64,
    user_id: String,
    device_id: String,
    operation: String,
    snapshot: String,
    timestamp: i64,
}

impl LogRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            operation: row.get(3)?,
            snapshot: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_entry(self) -> ServerResult<SyncLogEntry> {
        let operation = Operation::parse(&self.operation).ok_or_else(|| {
            ServerError::Database(format!("unknown operation in sync log: {}", self.operation))
        })?;
        Ok(SyncLogEntry {
            id: self.id as u64,
            user_id: self.user_id,
            device_id: self.device_id,
            operation,
            snapshot: decode_entity(&self.snapshot)?,
            timestamp: self.timestamp,
        })
    }
}

fn decode_entity(data: &str) -> ServerResult<EntityPayload> {
    Ok(serde_json::from_str(data)?)
}

fn latest_timestamp(conn: &Connection, user_id: &str) -> ServerResult<Option<i64>> {
    Ok(conn.query_row(
        "SELECT MAX(timestamp) FROM sync_log WHERE user_id = ?1",
        params![user_id],
        |row| row.get::<_, Option<i64>>(0),
    )?)
}

fn get_entity(
    conn: &Connection,
    user_id: &str,
    key: &EntityKey,
) -> ServerResult<Option<EntityPayload>> {
    let data = conn
        .query_row(
            "SELECT data FROM entities WHERE user_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
            params![user_id, key.entity_type.as_str(), key.entity_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    data.as_deref().map(decode_entity).transpose()
}

struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    user_id: String,
    now: i64,
    last_ts: Option<i64>,
    saved_ts: Option<Option<i64>>,
    finished: bool,
}

impl StoreTxn for SqliteTxn<'_> {
    fn get(&mut self, key: &EntityKey) -> ServerResult<Option<EntityPayload>> {
        get_entity(&self.conn, &self.user_id, key)
    }

    fn find_by_path(
        &mut self,
        entity_type: EntityType,
        path: &str,
    ) -> ServerResult<Option<EntityPayload>> {
        let data = self
            .conn
            .query_row(
                "SELECT data FROM entities
                 WHERE user_id = ?1 AND entity_type = ?2 AND path = ?3 AND deleted_at IS NULL",
                params![self.user_id, entity_type.as_str(), path],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        data.as_deref().map(decode_entity).transpose()
    }

    fn find_storage_key(&mut self, file_hash: &str) -> ServerResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT storage_key FROM entities
                 WHERE user_id = ?1 AND entity_type = 'attachment' AND file_hash = ?2
                   AND deleted_at IS NULL AND storage_key <> ''
                 LIMIT 1",
                params![self.user_id, file_hash],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn live_references(&mut self, storage_key: &str) -> ServerResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities
             WHERE entity_type = 'attachment' AND storage_key = ?1 AND deleted_at IS NULL",
            params![storage_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn put(&mut self, entity: &EntityPayload) -> ServerResult<()> {
        let (file_hash, storage_key) = match entity {
            EntityPayload::Attachment(a) => (Some(a.file_hash.as_str()), Some(a.storage_key.as_str())),
            _ => (None, None),
        };
        let data = serde_json::to_string(entity)
            .map_err(|e| ServerError::Internal(format!("entity is not serializable: {e}")))?;
        self.conn.execute(
            "INSERT INTO entities
                 (user_id, entity_type, entity_id, path, file_hash, storage_key,
                  updated_at, deleted_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                 path = excluded.path,
                 file_hash = excluded.file_hash,
                 storage_key = excluded.storage_key,
                 updated_at = excluded.updated_at,
                 deleted_at = excluded.deleted_at,
                 data = excluded.data",
            params![
                self.user_id,
                entity.entity_type().as_str(),
                entity.entity_id(),
                entity.path(),
                file_hash,
                storage_key,
                entity.updated_at(),
                entity.deleted_at(),
                data,
            ],
        )?;
        Ok(())
    }

    fn append_log(
        &mut self,
        device_id: &str,
        operation: Operation,
        snapshot: &EntityPayload,
    ) -> ServerResult<i64> {
        let timestamp = next_log_timestamp(self.now, self.last_ts);
        let data = serde_json::to_string(snapshot)
            .map_err(|e| ServerError::Internal(format!("entity is not serializable: {e}")))?;
        self.conn.execute(
            "INSERT INTO sync_log
                 (user_id, device_id, entity_type, entity_id, operation, snapshot, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.user_id,
                device_id,
                snapshot.entity_type().as_str(),
                snapshot.entity_id(),
                operation.as_str(),
                data,
                timestamp,
            ],
        )?;
        self.last_ts = Some(timestamp);
        Ok(timestamp)
    }

    fn savepoint(&mut self) -> ServerResult<()> {
        self.conn.execute_batch("SAVEPOINT mutation")?;
        self.saved_ts = Some(self.last_ts);
        Ok(())
    }

    fn release_savepoint(&mut self) -> ServerResult<()> {
        self.conn.execute_batch("RELEASE SAVEPOINT mutation")?;
        self.saved_ts = None;
        Ok(())
    }

    fn rollback_to_savepoint(&mut self) -> ServerResult<()> {
        self.conn
            .execute_batch("ROLLBACK TO SAVEPOINT mutation; RELEASE SAVEPOINT mutation")?;
        if let Some(ts) = self.saved_ts.take() {
            self.last_ts = ts;
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> ServerResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, user = %self.user_id, "rollback failed");
            }
        }
    }
}
