//! CLI command implementations.

pub mod compact;
pub mod dump_log;
pub mod serve;
pub mod verify;

use notesync_server::{ServerConfig, SyncServer};
use std::path::{Path, PathBuf};

/// Opens the stores under `database` and `content_dir` without serving.
///
/// Maintenance commands never verify tokens, so the secret stays empty.
pub fn open_offline(
    database: &Path,
    content_dir: Option<&PathBuf>,
) -> Result<SyncServer, Box<dyn std::error::Error>> {
    if !database.exists() {
        return Err(format!("database not found: {}", database.display()).into());
    }
    let mut config = ServerConfig::new(Vec::new()).with_database_path(database);
    if let Some(dir) = content_dir {
        config = config.with_content_dir(dir);
    }
    Ok(SyncServer::new(config)?)
}
