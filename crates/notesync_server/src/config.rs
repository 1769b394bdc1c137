//! Server configuration.

use crate::error::{ServerError, ServerResult};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the sync server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: Vec<u8>,
    /// SQLite database file. `None` keeps entities in memory.
    pub database_path: Option<PathBuf>,
    /// Attachment directory. `None` keeps attachment bytes in memory.
    pub content_dir: Option<PathBuf>,
    /// Maximum number of changes accepted in one push.
    pub max_push_batch: usize,
    /// Page size of the changes feed when the client gives none.
    pub default_page_size: u32,
    /// Upper bound on the changes feed page size.
    pub max_page_size: u32,
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// Maximum request body size, which bounds attachment uploads.
    pub max_upload_bytes: usize,
    /// How long sync log entries are kept. `None` keeps them forever.
    pub log_retention: Option<Duration>,
    /// How often the log is compacted when a retention is set.
    pub compaction_interval: Duration,
}

impl ServerConfig {
    /// Creates a configuration with defaults and the given token secret.
    pub fn new(jwt_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            jwt_secret: jwt_secret.into(),
            database_path: None,
            content_dir: None,
            max_push_batch: 500,
            default_page_size: 100,
            max_page_size: 1000,
            ping_interval: Duration::from_secs(30),
            max_upload_bytes: 25 * 1024 * 1024,
            log_retention: None,
            compaction_interval: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Persists entities in a SQLite database at `path`.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Persists attachment bytes under `dir`.
    pub fn with_content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.content_dir = Some(dir.into());
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the default and maximum changes page sizes.
    pub fn with_page_sizes(mut self, default: u32, max: u32) -> Self {
        self.default_page_size = default;
        self.max_page_size = max;
        self
    }

    /// Sets the WebSocket ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the maximum upload size.
    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Keeps sync log entries for `retention`.
    pub fn with_log_retention(mut self, retention: Duration) -> Self {
        self.log_retention = Some(retention);
        self
    }

    /// Reads the configuration from `NOTESYNC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the secret is missing or a value
    /// does not parse.
    pub fn from_env() -> ServerResult<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let secret = trimmed(&lookup, "NOTESYNC_JWT_SECRET")
            .ok_or_else(|| ServerError::Config("NOTESYNC_JWT_SECRET is required".into()))?;
        if secret.len() < 16 {
            return Err(ServerError::Config(
                "NOTESYNC_JWT_SECRET must be at least 16 bytes".into(),
            ));
        }

        let mut config = Self::new(secret.into_bytes());

        let bind = trimmed(&lookup, "NOTESYNC_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        config.bind_addr = bind
            .parse()
            .map_err(|_| ServerError::Config(format!("NOTESYNC_BIND_ADDR is invalid: {bind}")))?;

        config.database_path = trimmed(&lookup, "NOTESYNC_DATABASE_PATH").map(PathBuf::from);
        config.content_dir = trimmed(&lookup, "NOTESYNC_CONTENT_DIR").map(PathBuf::from);

        if let Some(secs) = parse_number(&lookup, "NOTESYNC_PING_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ServerError::Config(
                    "NOTESYNC_PING_INTERVAL_SECS must be positive".into(),
                ));
            }
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_number(&lookup, "NOTESYNC_MAX_PUSH_BATCH")? {
            if size == 0 {
                return Err(ServerError::Config(
                    "NOTESYNC_MAX_PUSH_BATCH must be positive".into(),
                ));
            }
            config.max_push_batch = size as usize;
        }
        if let Some(days) = parse_number(&lookup, "NOTESYNC_LOG_RETENTION_DAYS")? {
            config.log_retention = (days > 0).then(|| DAY * days as u32);
        }

        Ok(config)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"[REDACTED]")
            .field("database_path", &self.database_path)
            .field("content_dir", &self.content_dir)
            .field("max_push_batch", &self.max_push_batch)
            .field("default_page_size", &self.default_page_size)
            .field("max_page_size", &self.max_page_size)
            .field("ping_interval", &self.ping_interval)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("log_retention", &self.log_retention)
            .field("compaction_interval", &self.compaction_interval)
            .finish()
    }
}

fn trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> ServerResult<Option<u64>> {
    trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ServerError::Config(format!("{name} must be an integer")))
        })
        .transpose()
}
