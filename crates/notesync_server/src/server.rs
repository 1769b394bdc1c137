//! Server runtime.

use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::notify::NotificationHub;
use crate::reconcile::{EngineLimits, ReconcileEngine};
use crate::routes::{app_router, AppState};
use crate::store::{EntityStore, MemoryStore, SqliteStore};
use axum::Router;
use notesync_storage::{ContentStore, FsContentStore, MemoryContentStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// The sync server.
///
/// Owns the engine, the notification hub and the HTTP router.
///
/// # Example
///
/// ```no_run
/// use notesync_server::{ServerConfig, SyncServer};
///
/// # async fn run() -> notesync_server::ServerResult<()> {
/// let config = ServerConfig::new(b"a-secret-of-at-least-16-bytes".to_vec());
/// let server = SyncServer::new(config)?;
/// server.serve().await
/// # }
/// ```
pub struct SyncServer {
    state: AppState,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.state.config)
            .field("connections", &self.state.hub.connection_count())
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Creates a server with the stores named in `config`.
    ///
    /// Without a database path entities are kept in memory; without a
    /// content directory attachment bytes are too.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let store: Arc<dyn EntityStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let content: Arc<dyn ContentStore> = match &config.content_dir {
            Some(dir) => Arc::new(FsContentStore::open(dir)?),
            None => Arc::new(MemoryContentStore::new()),
        };
        Ok(Self::with_parts(config, store, content, Arc::new(SystemClock)))
    }

    /// Creates a server from explicit parts.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn EntityStore>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let engine = ReconcileEngine::new(store, content, clock, hub)
            .with_limits(EngineLimits::from(&config));
        Self {
            state: AppState::new(Arc::new(engine), Arc::new(config)),
        }
    }

    /// Returns the router serving this server's endpoints.
    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.state.engine
    }

    /// Returns the notification hub.
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.state.hub
    }

    /// Returns the handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Binds the configured address and serves until Ctrl-C.
    pub async fn serve(self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve_on(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await
    }

    /// Serves on `listener` until `shutdown` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let compaction = self.state.config.log_retention.map(|retention| {
            tokio::spawn(compact_periodically(
                Arc::clone(&self.state.engine),
                retention,
                self.state.config.compaction_interval,
            ))
        });

        tracing::info!(%addr, "sync server listening");
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(task) = compaction {
            task.abort();
        }
        result.map_err(ServerError::Io)?;
        tracing::info!(%addr, "sync server stopped");
        Ok(())
    }
}

async fn compact_periodically(engine: Arc<ReconcileEngine>, retention: Duration, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let engine = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || engine.compact_log(retention)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "log compaction failed"),
            Err(e) => tracing::warn!(error = %e, "log compaction task failed"),
        }
    }
}
