//! An in-process sync server for integration tests.
//!
//! [`TestServer`] binds a loopback port, serves the full router and stops
//! when dropped. Its clock is a [`ManualClock`] so tests decide what "now"
//! is on the server side.

use crate::fixtures::TEST_SECRET;
use notesync_server::{
    EntityStore, ManualClock, MemoryStore, NotificationHub, ReconcileEngine, ServerConfig,
    SqliteStore, SyncServer,
};
use notesync_storage::{ContentStore, FsContentStore, MemoryContentStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Server configuration for tests: the test secret and an ephemeral port.
pub fn test_config() -> ServerConfig {
    ServerConfig::new(TEST_SECRET).with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// A running server on a loopback port.
pub struct TestServer {
    addr: SocketAddr,
    clock: Arc<ManualClock>,
    engine: Arc<ReconcileEngine>,
    hub: Arc<NotificationHub>,
    content: Arc<dyn ContentStore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    _dir: Option<TempDir>,
}

impl TestServer {
    /// Starts a server with in-memory stores.
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    /// Starts a server with in-memory stores and the given configuration.
    pub async fn start_with(config: ServerConfig) -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let content: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
        Self::launch(config, store, content, None).await
    }

    /// Starts a server backed by SQLite and a content directory in a
    /// temporary directory.
    pub async fn start_persistent() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store: Arc<dyn EntityStore> = Arc::new(
            SqliteStore::open(&dir.path().join("notesync.db")).expect("Failed to open database"),
        );
        let content: Arc<dyn ContentStore> = Arc::new(
            FsContentStore::open(&dir.path().join("content"))
                .expect("Failed to open content directory"),
        );
        Self::launch(test_config(), store, content, Some(dir)).await
    }

    async fn launch(
        config: ServerConfig,
        store: Arc<dyn EntityStore>,
        content: Arc<dyn ContentStore>,
        dir: Option<TempDir>,
    ) -> Self {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("listener has an address");
        let clock = Arc::new(ManualClock::new(chrono::Utc::now().timestamp_millis()));

        let server = SyncServer::with_parts(config, store, Arc::clone(&content), clock.clone());
        let engine = Arc::clone(server.engine());
        let hub = Arc::clone(server.hub());

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let stopped = async {
                let _ = signal.await;
            };
            if let Err(e) = server.serve_on(listener, stopped).await {
                eprintln!("test server failed: {e}");
            }
        });

        Self {
            addr,
            clock,
            engine,
            hub,
            content,
            shutdown: Some(shutdown),
            task: Some(task),
            _dir: dir,
        }
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns `http://host:port`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Returns the notification socket URL for a token and device.
    pub fn ws_url(&self, token: &str, device_id: &str) -> String {
        format!("ws://{}/ws?token={token}&deviceId={device_id}", self.addr)
    }

    /// Returns the server clock.
    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Returns the engine behind the server.
    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    /// Returns the notification hub.
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Returns the attachment content store.
    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Waits until `devices` sockets of `user` are registered.
    pub async fn wait_for_sockets(&self, user: &str, devices: usize) {
        let connected = eventually(Duration::from_secs(5), || {
            self.hub.devices(user).len() >= devices
        })
        .await;
        assert!(connected, "expected {devices} connected devices for {user}");
    }

    /// Stops the server and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
