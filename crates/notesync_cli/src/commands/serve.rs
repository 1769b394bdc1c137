//! Serve command implementation.

use notesync_server::{ServerConfig, SyncServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line overrides of the environment configuration.
#[derive(Debug, Default)]
pub struct ServeOptions {
    /// Address to bind to.
    pub bind: Option<SocketAddr>,
    /// SQLite database file.
    pub database: Option<PathBuf>,
    /// Attachment directory.
    pub content_dir: Option<PathBuf>,
    /// Sync log retention in days.
    pub log_retention_days: Option<u64>,
    /// WebSocket ping interval in seconds.
    pub ping_interval_secs: Option<u64>,
}

impl ServeOptions {
    /// Applies the overrides on top of `config`.
    pub fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = self.bind {
            config = config.with_bind_addr(bind);
        }
        if let Some(database) = self.database {
            config = config.with_database_path(database);
        }
        if let Some(dir) = self.content_dir {
            config = config.with_content_dir(dir);
        }
        if let Some(days) = self.log_retention_days {
            config.log_retention = (days > 0).then(|| Duration::from_secs(days * 24 * 60 * 60));
        }
        if let Some(secs) = self.ping_interval_secs.filter(|s| *s > 0) {
            config = config.with_ping_interval(Duration::from_secs(secs));
        }
        config
    }
}

/// Runs the server until ctrl-c.
pub async fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.apply(ServerConfig::from_env()?);
    if config.database_path.is_none() {
        tracing::warn!("no database path configured; entities are kept in memory");
    }
    tracing::info!(?config, "starting notesync server");

    SyncServer::new(config)?.serve().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_environment_values() {
        let base = ServerConfig::new(b"0123456789abcdef".to_vec())
            .with_log_retention(Duration::from_secs(60));
        let options = ServeOptions {
            bind: Some("0.0.0.0:9000".parse().unwrap()),
            database: Some(PathBuf::from("/var/lib/notesync/db.sqlite")),
            log_retention_days: Some(0),
            ping_interval_secs: Some(15),
            ..ServeOptions::default()
        };

        let config = options.apply(base);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/notesync/db.sqlite"))
        );
        assert!(config.content_dir.is_none());
        assert_eq!(config.log_retention, None);
        assert_eq!(config.ping_interval, Duration::from_secs(15));
    }

    #[test]
    fn empty_overrides_keep_the_config() {
        let base = ServerConfig::new(b"0123456789abcdef".to_vec());
        let config = ServeOptions::default().apply(base.clone());
        assert_eq!(config.bind_addr, base.bind_addr);
        assert_eq!(config.ping_interval, base.ping_interval);
    }
}
