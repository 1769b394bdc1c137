//! WebSocket notification channel.
//!
//! The socket only ever carries hints. A device connects with
//! `GET /ws?token=...&deviceId=...`; the credentials are checked before the
//! upgrade so a rejected device never gets a socket. Once connected the
//! server sends one `heartbeat`, forwards `sync:notify` hints from the
//! [`NotificationHub`](crate::notify::NotificationHub), answers client
//! heartbeats with `pong`, and pings on a fixed interval. A socket that lets
//! a whole interval pass without sending anything after a ping is closed.

use crate::auth::{extract_bearer_token, AuthenticatedDevice};
use crate::error::{ServerError, ServerResult};
use crate::routes::AppState;
use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use notesync_protocol::{ClientMessage, Heartbeat, ServerMessage};
use serde::Deserialize;
use tokio::time::{interval_at, Instant};

/// Query parameters of the handshake.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    /// Bearer token; the `Authorization` header is used when absent.
    pub token: Option<String>,
    /// Connecting device.
    pub device_id: Option<String>,
}

/// Handles `GET /ws`.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (auth, device_id) = match authorize(&state, &headers, params) {
        Ok(identity) => identity,
        Err(err) => {
            tracing::info!(error = %err, "websocket handshake rejected");
            return err.into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| serve_socket(socket, state, auth.user_id, device_id))
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    params: WsParams,
) -> ServerResult<(AuthenticatedDevice, String)> {
    let auth = match params.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => state.verifier.verify(token)?,
        None => state.verifier.verify(extract_bearer_token(headers).map_err(|_| {
            ServerError::AuthenticationFailed("missing token".into())
        })?)?,
    };
    let device_id = params.device_id.unwrap_or_default();
    auth.authorize_device(&device_id)?;
    Ok((auth, device_id))
}

async fn serve_socket(socket: WebSocket, state: AppState, user_id: String, device_id: String) {
    let mut registration = state.hub.register(&user_id, &device_id);
    tracing::info!(
        user = %user_id,
        device = %device_id,
        connections = state.hub.connection_count(),
        "websocket connected"
    );

    let (mut sender, mut receiver) = socket.split();
    let welcome = ServerMessage::Heartbeat(Heartbeat {
        timestamp: state.clock.now_millis(),
    });
    if send(&mut sender, &welcome).await.is_err() {
        return;
    }

    let period = state.config.ping_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if awaiting_pong {
                    tracing::info!(user = %user_id, device = %device_id, "websocket missed ping, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            hint = registration.recv() => {
                let Some(hint) = hint else { break };
                if send(&mut sender, &hint).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(device = %device_id, error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                };
                awaiting_pong = false;
                match message {
                    Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                        Ok(ClientMessage::Heartbeat) => {
                            let pong = ServerMessage::Pong(Heartbeat {
                                timestamp: state.clock.now_millis(),
                            });
                            if send(&mut sender, &pong).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(device = %device_id, error = %e, "ignoring client message");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    drop(registration);
    tracing::info!(
        user = %user_id,
        device = %device_id,
        connections = state.hub.connection_count(),
        "websocket disconnected"
    );
}

async fn send<S>(sender: &mut S, message: &ServerMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode websocket message");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
