//! Registry of connected notification sockets.
//!
//! Each WebSocket registers with the hub under its user and device. After a
//! push commits, the hub sends a [`ServerMessage::SyncNotify`] to every other
//! socket of that user. Delivery is fire-and-forget: a socket whose receiver
//! has gone away is dropped from the registry on the next notify.

use notesync_protocol::ServerMessage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifier of one registered socket.
pub type ConnectionId = u64;

#[derive(Debug)]
struct Subscriber {
    device_id: String,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

/// Tracks live notification sockets per user.
#[derive(Debug, Default)]
pub struct NotificationHub {
    users: RwLock<HashMap<String, HashMap<ConnectionId, Subscriber>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket for `device_id` of `user_id`.
    ///
    /// The socket stays registered until the returned [`Registration`] is
    /// dropped.
    pub fn register(self: &Arc<Self>, user_id: &str, device_id: &str) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.users
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(
                id,
                Subscriber {
                    device_id: device_id.to_string(),
                    sender,
                },
            );
        tracing::debug!(user = %user_id, device = %device_id, connection = id, "socket registered");
        Registration {
            hub: Arc::clone(self),
            user_id: user_id.to_string(),
            id,
            receiver,
        }
    }

    fn unregister(&self, user_id: &str, id: ConnectionId) {
        let mut users = self.users.write();
        if let Some(connections) = users.get_mut(user_id) {
            connections.remove(&id);
            if connections.is_empty() {
                users.remove(user_id);
            }
        }
    }

    /// Tells every socket of `user_id` except those of `source_device_id`
    /// that changes up to `timestamp` are available.
    ///
    /// Returns the number of sockets the hint was queued for.
    pub fn notify(&self, user_id: &str, source_device_id: &str, timestamp: i64) -> usize {
        let message = ServerMessage::notify(timestamp, source_device_id);
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let users = self.users.read();
            let Some(connections) = users.get(user_id) else {
                return 0;
            };
            for (id, subscriber) in connections {
                if subscriber.device_id == source_device_id {
                    continue;
                }
                if subscriber.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.unregister(user_id, id);
        }
        tracing::debug!(user = %user_id, source = %source_device_id, delivered, "sync notify sent");
        delivered
    }

    /// Closes every socket of `user_id`, e.g. after its tokens were revoked.
    ///
    /// Returns the number of sockets closed.
    pub fn disconnect(&self, user_id: &str) -> usize {
        let closed = self.users.write().remove(user_id).map_or(0, |c| c.len());
        if closed > 0 {
            tracing::info!(user = %user_id, closed, "sockets disconnected");
        }
        closed
    }

    /// Returns the number of registered sockets.
    pub fn connection_count(&self) -> usize {
        self.users.read().values().map(HashMap::len).sum()
    }

    /// Returns the devices with a registered socket for `user_id`.
    pub fn devices(&self, user_id: &str) -> Vec<String> {
        let mut devices: Vec<String> = self
            .users
            .read()
            .get(user_id)
            .map(|c| c.values().map(|s| s.device_id.clone()).collect())
            .unwrap_or_default();
        devices.sort();
        devices.dedup();
        devices
    }
}

/// A socket's place in the hub.
///
/// Dropping it removes the socket from the hub.
#[derive(Debug)]
pub struct Registration {
    hub: Arc<NotificationHub>,
    user_id: String,
    id: ConnectionId,
    receiver: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Registration {
    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Waits for the next message addressed to this socket.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.user_id, self.id);
        tracing::debug!(user = %self.user_id, connection = self.id, "socket unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_protocol::SyncNotify;

    #[test]
    fn notify_skips_source_device() {
        let hub = Arc::new(NotificationHub::new());
        let mut a = hub.register("alice", "dev-a");
        let mut b = hub.register("alice", "dev-b");
        let mut other_user = hub.register("bob", "dev-c");

        assert_eq!(hub.notify("alice", "dev-a", 42), 1);

        assert!(a.try_recv().is_none());
        assert!(other_user.try_recv().is_none());
        match b.try_recv() {
            Some(ServerMessage::SyncNotify(SyncNotify {
                timestamp,
                source_device_id,
            })) => {
                assert_eq!(timestamp, 42);
                assert_eq!(source_device_id, "dev-a");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn drop_unregisters() {
        let hub = Arc::new(NotificationHub::new());
        let a = hub.register("alice", "dev-a");
        let b = hub.register("alice", "dev-b");
        assert_eq!(hub.connection_count(), 2);
        assert_eq!(hub.devices("alice"), vec!["dev-a", "dev-b"]);

        drop(a);
        assert_eq!(hub.connection_count(), 1);
        drop(b);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.devices("alice").is_empty());
        assert_eq!(hub.notify("alice", "dev-x", 1), 0);
    }

    #[tokio::test]
    async fn disconnect_ends_the_users_registrations() {
        let hub = Arc::new(NotificationHub::new());
        let mut a = hub.register("alice", "dev-a");
        let _bob = hub.register("bob", "dev-c");

        assert_eq!(hub.disconnect("alice"), 1);
        assert_eq!(hub.connection_count(), 1);
        assert!(a.recv().await.is_none());
        assert_eq!(hub.disconnect("alice"), 0);
    }

    #[test]
    fn two_sockets_of_one_device_both_receive() {
        let hub = Arc::new(NotificationHub::new());
        let mut first = hub.register("alice", "dev-b");
        let mut second = hub.register("alice", "dev-b");
        assert_ne!(first.id(), second.id());

        assert_eq!(hub.notify("alice", "dev-a", 7), 2);
        assert!(first.try_recv().is_some());
        assert!(second.try_recv().is_some());
    }

    #[test]
    fn concurrent_register_and_notify() {
        let hub = Arc::new(NotificationHub::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let registration = hub.register("alice", &format!("dev-{i}"));
                        hub.notify("alice", "writer", n);
                        drop(registration);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn recv_waits_for_notify() {
        let hub = Arc::new(NotificationHub::new());
        let mut registration = hub.register("alice", "dev-b");

        let sender = Arc::clone(&hub);
        tokio::spawn(async move {
            sender.notify("alice", "dev-a", 99);
        });

        let message = registration.recv().await.unwrap();
        assert_eq!(message, ServerMessage::notify(99, "dev-a"));
    }
}
