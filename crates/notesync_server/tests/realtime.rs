//! Notification channel tests over real sockets.

use futures_util::{SinkExt, StreamExt};
use notesync_protocol::{ClientMessage, PushRequest, ServerMessage};
use notesync_server::AuthenticatedDevice;
use notesync_testkit::prelude::*;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(server: &TestServer, user: &str, device: &str) -> Socket {
    let token = mint_token(user, Some(device));
    let (socket, _) = connect_async(server.ws_url(&token, device))
        .await
        .expect("websocket connects");
    socket
}

/// Reads the next application message, skipping control frames.
async fn next_message(socket: &mut Socket, wait: Duration) -> Option<ServerMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(ServerMessage::parse(&text).expect("server message"));
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

fn push_note(server: &TestServer, user: &str, device: &str, uuid: &str) -> i64 {
    let now = server.clock().advance(1);
    let auth = AuthenticatedDevice {
        user_id: user.to_string(),
        device_id: Some(device.to_string()),
    };
    let request = PushRequest::new(
        vec![upsert(note(uuid, &format!("{uuid}.md"), "body", now), now, device)],
        device,
        Some(now),
    );
    server.engine().push(&auth, request).expect("push").timestamp
}

#[tokio::test]
async fn connection_starts_with_a_heartbeat() {
    let server = TestServer::start().await;
    let mut socket = connect(&server, "alice", "dev-a").await;

    match next_message(&mut socket, Duration::from_secs(2)).await {
        Some(ServerMessage::Heartbeat(beat)) => assert!(beat.timestamp > 0),
        other => panic!("expected heartbeat, got {other:?}"),
    }
    server.wait_for_sockets("alice", 1).await;
}

#[tokio::test]
async fn push_notifies_the_users_other_devices_only() {
    let server = TestServer::start().await;
    let mut a = connect(&server, "alice", "dev-a").await;
    let mut b = connect(&server, "alice", "dev-b").await;
    let mut bob = connect(&server, "bob", "dev-c").await;
    for socket in [&mut a, &mut b, &mut bob] {
        assert!(matches!(
            next_message(socket, Duration::from_secs(2)).await,
            Some(ServerMessage::Heartbeat(_))
        ));
    }
    server.wait_for_sockets("alice", 2).await;
    server.wait_for_sockets("bob", 1).await;

    let timestamp = push_note(&server, "alice", "dev-a", "n1");

    assert_eq!(
        next_message(&mut b, Duration::from_secs(2)).await,
        Some(ServerMessage::notify(timestamp, "dev-a"))
    );
    assert_eq!(next_message(&mut a, Duration::from_millis(200)).await, None);
    assert_eq!(next_message(&mut bob, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn notify_frames_never_carry_entity_data() {
    let server = TestServer::start().await;
    let mut b = connect(&server, "alice", "dev-b").await;
    let _ = next_message(&mut b, Duration::from_secs(2)).await;
    server.wait_for_sockets("alice", 1).await;

    push_note(&server, "alice", "dev-a", "secret-note");

    let frame = loop {
        match tokio::time::timeout(Duration::from_secs(2), b.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => break text,
            Ok(Some(Ok(_))) => continue,
            other => panic!("no notify frame: {other:?}"),
        }
    };
    assert!(frame.contains("sync:notify"));
    for leaked in ["entityType", "dataJson", "secret-note", "body"] {
        assert!(!frame.contains(leaked), "{leaked} leaked into {frame}");
    }
}

#[tokio::test]
async fn client_heartbeat_gets_a_pong() {
    let server = TestServer::start().await;
    let mut socket = connect(&server, "alice", "dev-a").await;
    let _ = next_message(&mut socket, Duration::from_secs(2)).await;

    socket
        .send(Message::Text(ClientMessage::Heartbeat.to_json().unwrap()))
        .await
        .unwrap();
    match next_message(&mut socket, Duration::from_secs(2)).await {
        Some(ServerMessage::Pong(beat)) => assert_eq!(beat.timestamp, server.clock().advance(0)),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_with_bad_credentials_is_refused() {
    let server = TestServer::start().await;

    let err = connect_async(server.ws_url("garbage", "dev-a")).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }

    let token = mint_token("alice", Some("dev-a"));
    let err = connect_async(server.ws_url(&token, "dev-b")).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert_eq!(server.hub().connection_count(), 0);
}

#[tokio::test]
async fn silent_sockets_are_closed() {
    let config = test_config().with_ping_interval(Duration::from_millis(100));
    let server = TestServer::start_with(config).await;
    let mut socket = connect(&server, "alice", "dev-a").await;
    let _ = next_message(&mut socket, Duration::from_secs(2)).await;
    server.wait_for_sockets("alice", 1).await;

    // Not polling the stream means pings go unanswered.
    tokio::time::sleep(Duration::from_millis(350)).await;

    let closed = eventually(Duration::from_secs(2), || server.hub().connection_count() == 0).await;
    assert!(closed, "unresponsive socket stayed registered");
    drop(socket);
}

#[tokio::test]
async fn responsive_sockets_stay_open() {
    let config = test_config().with_ping_interval(Duration::from_millis(100));
    let server = TestServer::start_with(config).await;
    let mut socket = connect(&server, "alice", "dev-a").await;
    let _ = next_message(&mut socket, Duration::from_secs(2)).await;

    // Polling answers pings automatically.
    assert_eq!(next_message(&mut socket, Duration::from_millis(450)).await, None);
    assert_eq!(server.hub().connection_count(), 1);
}
