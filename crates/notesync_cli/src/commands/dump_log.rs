//! Dump log command implementation.

use notesync_server::SyncLogEntry;
use serde::Serialize;
use std::path::Path;

/// Sync log entry representation for output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecordInfo {
    /// Store-wide sequence number.
    pub id: u64,
    /// Server time of the change.
    pub timestamp: i64,
    /// Owning user.
    pub user_id: String,
    /// Device the change came from.
    pub device_id: String,
    /// Operation applied.
    pub operation: String,
    /// Entity type.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
    /// Path of notes and folders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Whether the snapshot is a tombstone.
    pub deleted: bool,
}

impl From<&SyncLogEntry> for LogRecordInfo {
    fn from(entry: &SyncLogEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            user_id: entry.user_id.clone(),
            device_id: entry.device_id.clone(),
            operation: entry.operation.to_string(),
            entity_type: entry.snapshot.entity_type().to_string(),
            entity_id: entry.snapshot.entity_id().to_string(),
            path: entry.snapshot.path().map(str::to_string),
            deleted: entry.snapshot.is_tombstone(),
        }
    }
}

/// Runs the dump-log command.
pub fn run(
    database: &Path,
    user: Option<&str>,
    since: i64,
    limit: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = super::open_offline(database, None)?;
    let entries = server.engine().store().log_entries(user, since, limit)?;
    let records: Vec<LogRecordInfo> = entries.iter().map(LogRecordInfo::from).collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn print_text_output(records: &[LogRecordInfo]) {
    println!("Sync log ({} entries)", records.len());
    println!("================");
    println!();

    for record in records {
        print!(
            "[{:08}] {} {:6} {:<10} {}",
            record.id,
            format_timestamp(record.timestamp),
            record.operation,
            record.entity_type,
            record.entity_id
        );
        if let Some(ref path) = record.path {
            print!(" path={path}");
        }
        if record.deleted {
            print!(" (deleted)");
        }
        println!(" user={} device={}", record.user_id, record.device_id);
    }
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| millis.to_string())
}
