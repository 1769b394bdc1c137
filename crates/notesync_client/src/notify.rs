//! Listener for the server's notification channel.
//!
//! The socket only ever carries hints. Each `sync:notify` becomes a
//! [`NotifyHint`] on a bounded channel; the receiver is expected to pull
//! over HTTP. Hints that find the channel full are dropped, since one
//! pending pull already covers them.
//!
//! Liveness: the listener sends a `heartbeat` every heartbeat interval and
//! treats the socket as dead if no `pong` arrives within the heartbeat
//! timeout. A dead or closed socket is reopened after the fixed reconnect
//! delay. A handshake refused with 401/403 stops the listener for good.

use crate::config::SyncConfig;
use futures_util::{SinkExt, StreamExt};
use notesync_protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Connection status of the notification socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected; a reconnect may be pending.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and receiving hints.
    Connected,
    /// The server refused the credentials; the listener has stopped.
    Rejected,
}

/// A hint that the server committed changes from another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyHint {
    /// Sync log timestamp of the commit.
    pub timestamp: i64,
    /// Device that pushed the changes.
    pub source_device_id: String,
}

/// Handle to a running listener task.
#[derive(Debug)]
pub struct NotifyListener {
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NotifyListener {
    /// Spawns a listener for the device in `config`.
    ///
    /// Returns the handle and the receiving end of the hint channel.
    pub fn spawn(config: &SyncConfig) -> (Self, mpsc::Receiver<NotifyHint>) {
        let (hint_tx, hint_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settings = ListenerSettings {
            url: config.ws_url(),
            device_id: config.device_id.clone(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            reconnect_delay: config.reconnect_delay,
        };
        let task = tokio::spawn(listen(settings, hint_tx, status_tx, shutdown_rx));

        (
            Self {
                status_rx,
                shutdown_tx,
                task,
            },
            hint_rx,
        )
    }

    /// Returns the current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Returns a receiver that observes status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Closes the socket and waits for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

struct ListenerSettings {
    url: String,
    device_id: String,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    reconnect_delay: Duration,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

async fn listen(
    settings: ListenerSettings,
    hint_tx: mpsc::Sender<NotifyHint>,
    status_tx: watch::Sender<ConnectionStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        match connect_async(settings.url.as_str()).await {
            Ok((socket, _)) => {
                let _ = status_tx.send(ConnectionStatus::Connected);
                tracing::info!(device = %settings.device_id, "notification channel connected");
                let end = session(socket, &settings, &hint_tx, &mut shutdown_rx).await;
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                if matches!(end, SessionEnd::Shutdown) {
                    return;
                }
                tracing::info!(device = %settings.device_id, "notification channel lost");
            }
            Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
                tracing::warn!(
                    device = %settings.device_id,
                    status = response.status().as_u16(),
                    "notification channel refused credentials"
                );
                let _ = status_tx.send(ConnectionStatus::Rejected);
                return;
            }
            Err(e) => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                tracing::debug!(error = %e, "notification channel connect failed");
            }
        }

        tokio::select! {
            _ = sleep(settings.reconnect_delay) => {}
            _ = shutdown_rx.changed() => return,
        }
        if *shutdown_rx.borrow() {
            return;
        }
    }
}

async fn session<S>(
    socket: S,
    settings: &ListenerSettings,
    hint_tx: &mpsc::Sender<NotifyHint>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: StreamExt<Item = Result<Message, WsError>> + SinkExt<Message, Error = WsError> + Unpin,
{
    let (mut write, mut read) = socket.split();
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if pong_deadline.is_some() {
                    continue;
                }
                let Ok(text) = ClientMessage::Heartbeat.to_json() else {
                    continue;
                };
                if write.send(Message::Text(text)).await.is_err() {
                    return SessionEnd::Lost;
                }
                pong_deadline = Some(Instant::now() + settings.heartbeat_timeout);
            }

            _ = wait_for(pong_deadline) => {
                tracing::warn!(device = %settings.device_id, "no pong before heartbeat timeout");
                return SessionEnd::Lost;
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(ServerMessage::SyncNotify(notify)) => {
                        tracing::debug!(
                            timestamp = notify.timestamp,
                            source = %notify.source_device_id,
                            "sync notify"
                        );
                        let hint = NotifyHint {
                            timestamp: notify.timestamp,
                            source_device_id: notify.source_device_id,
                        };
                        if let Err(mpsc::error::TrySendError::Closed(_)) = hint_tx.try_send(hint) {
                            let _ = write.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(ServerMessage::Pong(_)) => pong_deadline = None,
                    Ok(ServerMessage::Heartbeat(_)) => {}
                    Err(e) => tracing::debug!(error = %e, "ignoring unknown message"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
            },

            _ = shutdown_rx.changed() => {
                let _ = write.close().await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_stays_disconnected_until_shutdown() {
        let config = SyncConfig::new("http://127.0.0.1:9", "tok", "dev-a")
            .with_reconnect_delay(Duration::from_millis(20));
        let (listener, mut hints) = NotifyListener::spawn(&config);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(listener.status(), ConnectionStatus::Connected);

        tokio::time::timeout(Duration::from_secs(2), listener.shutdown())
            .await
            .expect("listener stops");
        assert!(hints.recv().await.is_none());
    }
}
