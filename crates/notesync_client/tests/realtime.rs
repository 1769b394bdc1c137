//! Notification-driven sync against a live server.

use notesync_client::{
    ConnectionStatus, HttpTransport, LocalStore, MemoryLocalStore, NotifyListener, RetryConfig,
    SyncClient, SyncConfig, SyncRunner,
};
use notesync_protocol::{EntityKey, EntityType, Note};
use notesync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

type Device = SyncClient<HttpTransport, MemoryLocalStore>;

fn config(server: &TestServer, user: &str, device: &str) -> SyncConfig {
    SyncConfig::new(server.base_url(), mint_token(user, Some(device)), device)
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_secs(3600))
        .with_reconnect_delay(Duration::from_millis(50))
        .with_retry(RetryConfig::no_retry())
}

fn device(config: SyncConfig) -> Arc<Device> {
    let transport = HttpTransport::new(&config).expect("transport");
    Arc::new(SyncClient::new(config, transport, MemoryLocalStore::new()))
}

async fn wait_for_status(listener: &NotifyListener, wanted: ConnectionStatus) {
    let mut status = listener.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == wanted))
        .await
        .expect("listener status reached")
        .expect("listener alive");
}

#[tokio::test]
async fn notify_hint_triggers_a_pull() {
    let server = TestServer::start().await;
    let laptop = device(config(&server, "alice", "laptop"));
    let phone = device(config(&server, "alice", "phone"));

    let runner = SyncRunner::spawn_with_notifications(phone.clone());
    let mut status = runner.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.completed >= 1))
        .await
        .expect("initial cycle")
        .expect("runner alive");
    server.wait_for_sockets("alice", 1).await;

    laptop
        .save(Note {
            uuid: "n1".into(),
            name: "todo.md".into(),
            path: "todo.md".into(),
            content: "from the laptop".into(),
            ..Note::default()
        })
        .unwrap();
    laptop.sync().await.unwrap();

    // Polling is an hour away; only the hint can deliver this.
    let key = EntityKey::new(EntityType::Note, "n1");
    let arrived = eventually(Duration::from_secs(5), || {
        phone.local().get(&key).ok().flatten().is_some()
    })
    .await;
    assert!(arrived, "notify hint did not lead to a pull");

    runner.shutdown().await;
}

#[tokio::test]
async fn pushing_device_gets_no_hint() {
    let server = TestServer::start().await;
    let config = config(&server, "alice", "laptop");
    let laptop = device(config.clone());
    let (listener, mut hints) = NotifyListener::spawn(&config);
    wait_for_status(&listener, ConnectionStatus::Connected).await;
    server.wait_for_sockets("alice", 1).await;

    laptop
        .save(Note {
            uuid: "n1".into(),
            path: "a.md".into(),
            ..Note::default()
        })
        .unwrap();
    laptop.sync().await.unwrap();

    let hint = tokio::time::timeout(Duration::from_millis(300), hints.recv()).await;
    assert!(hint.is_err(), "own push produced a hint: {hint:?}");
    listener.shutdown().await;
}

#[tokio::test]
async fn heartbeats_keep_the_socket_alive() {
    let server = TestServer::start().await;
    let config = config(&server, "alice", "laptop")
        .with_heartbeat(Duration::from_millis(50), Duration::from_millis(200));
    let (listener, _hints) = NotifyListener::spawn(&config);
    wait_for_status(&listener, ConnectionStatus::Connected).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(listener.status(), ConnectionStatus::Connected);
    assert_eq!(server.hub().connection_count(), 1);
    listener.shutdown().await;
}

#[tokio::test]
async fn refused_credentials_stop_the_listener() {
    let server = TestServer::start().await;
    let config = SyncConfig::new(server.base_url(), "garbage", "laptop");
    let (listener, mut hints) = NotifyListener::spawn(&config);

    wait_for_status(&listener, ConnectionStatus::Rejected).await;
    assert!(hints.recv().await.is_none());
    assert_eq!(server.hub().connection_count(), 0);
}

#[tokio::test]
async fn listener_reconnects_after_the_server_drops_the_socket() {
    let server = TestServer::start().await;
    let config = config(&server, "alice", "laptop");
    let (listener, _hints) = NotifyListener::spawn(&config);
    wait_for_status(&listener, ConnectionStatus::Connected).await;
    server.wait_for_sockets("alice", 1).await;

    assert_eq!(server.hub().disconnect("alice"), 1);
    let mut status = listener.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        status
            .wait_for(|s| *s != ConnectionStatus::Connected)
            .await
            .expect("listener alive");
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .expect("listener alive");
    })
    .await
    .expect("listener reconnected");
    listener.shutdown().await;
}
