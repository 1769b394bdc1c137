//! Background sync loop.
//!
//! The runner drives a [`SyncClient`] from three triggers: a fixed poll
//! interval, hints from the notification channel, and explicit
//! [`RunnerCommand::SyncNow`] requests. Polling keeps running whether or not
//! the notification socket is up.
//!
//! A retryable failure schedules another attempt with exponential backoff
//! from the client's [`RetryConfig`](crate::RetryConfig). Once
//! `max_attempts` is reached the runner waits for the next trigger.

use crate::client::SyncClient;
use crate::local::LocalStore;
use crate::notify::{NotifyHint, NotifyListener};
use crate::transport::SyncTransport;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

/// Commands accepted by a running sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Run a full cycle now.
    SyncNow,
    /// Stop the loop.
    Shutdown,
}

/// Snapshot of the loop's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStatus {
    /// Number of successful cycles or pulls.
    pub completed: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last error message, cleared by a success.
    pub last_error: Option<String>,
    /// Queued local changes after the last run.
    pub pending_changes: usize,
}

/// Handle to a spawned sync loop.
#[derive(Debug)]
pub struct RunnerHandle {
    command_tx: mpsc::Sender<RunnerCommand>,
    status_rx: watch::Receiver<RunnerStatus>,
    task: JoinHandle<()>,
    listener: Option<NotifyListener>,
}

impl RunnerHandle {
    /// Requests an immediate cycle.
    pub async fn sync_now(&self) {
        let _ = self.command_tx.send(RunnerCommand::SyncNow).await;
    }

    /// Returns the latest status.
    pub fn status(&self) -> RunnerStatus {
        self.status_rx.borrow().clone()
    }

    /// Returns a receiver that observes status changes.
    pub fn subscribe(&self) -> watch::Receiver<RunnerStatus> {
        self.status_rx.clone()
    }

    /// Returns the notification listener, if one was spawned.
    pub fn listener(&self) -> Option<&NotifyListener> {
        self.listener.as_ref()
    }

    /// Stops the loop and the listener and waits for both.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(RunnerCommand::Shutdown).await;
        let _ = self.task.await;
        if let Some(listener) = self.listener {
            listener.shutdown().await;
        }
    }
}

/// Spawns background sync loops.
pub struct SyncRunner;

impl SyncRunner {
    /// Spawns a loop that polls and accepts commands, without a
    /// notification socket.
    pub fn spawn<T, L>(client: Arc<SyncClient<T, L>>) -> RunnerHandle
    where
        T: SyncTransport + 'static,
        L: LocalStore + 'static,
    {
        Self::spawn_inner(client, None, None)
    }

    /// Spawns a loop that also listens on the notification channel and pulls
    /// on every hint.
    pub fn spawn_with_notifications<T, L>(client: Arc<SyncClient<T, L>>) -> RunnerHandle
    where
        T: SyncTransport + 'static,
        L: LocalStore + 'static,
    {
        let (listener, hints) = NotifyListener::spawn(client.config());
        Self::spawn_inner(client, Some(hints), Some(listener))
    }

    fn spawn_inner<T, L>(
        client: Arc<SyncClient<T, L>>,
        hints: Option<mpsc::Receiver<NotifyHint>>,
        listener: Option<NotifyListener>,
    ) -> RunnerHandle
    where
        T: SyncTransport + 'static,
        L: LocalStore + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(RunnerStatus::default());
        let task = tokio::spawn(run(client, command_rx, hints, status_tx));
        RunnerHandle {
            command_tx,
            status_rx,
            task,
            listener,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Cycle,
    Pull,
}

async fn run<T, L>(
    client: Arc<SyncClient<T, L>>,
    mut command_rx: mpsc::Receiver<RunnerCommand>,
    mut hints: Option<mpsc::Receiver<NotifyHint>>,
    status_tx: watch::Sender<RunnerStatus>,
) where
    T: SyncTransport + 'static,
    L: LocalStore + 'static,
{
    let retry = client.config().retry.clone();
    let mut poll = tokio::time::interval(client.config().poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;
    let mut status = RunnerStatus::default();

    loop {
        let trigger = tokio::select! {
            _ = poll.tick() => Trigger::Cycle,
            _ = wait_until(retry_at) => Trigger::Cycle,
            hint = next_hint(&mut hints) => match hint {
                Some(hint) => {
                    tracing::debug!(source = %hint.source_device_id, "pulling on notify hint");
                    Trigger::Pull
                }
                None => {
                    hints = None;
                    continue;
                }
            },
            cmd = command_rx.recv() => match cmd {
                Some(RunnerCommand::SyncNow) => Trigger::Cycle,
                Some(RunnerCommand::Shutdown) | None => break,
            },
        };

        let outcome = match trigger {
            Trigger::Cycle => client.sync().await,
            Trigger::Pull => client.pull().await,
        };

        match outcome {
            Ok(_) => {
                status.completed += 1;
                status.consecutive_failures = 0;
                status.last_error = None;
                retry_at = None;
            }
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                retry_at = if e.is_retryable() && status.consecutive_failures < retry.max_attempts {
                    let delay = retry.delay_for_attempt(status.consecutive_failures);
                    tracing::debug!(
                        attempt = status.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling sync retry"
                    );
                    Some(Instant::now() + delay)
                } else {
                    None
                };
            }
        }
        status.pending_changes = client.queue().len();
        let _ = status_tx.send(status.clone());
    }

    tracing::debug!(device = %client.config().device_id, "sync loop stopped");
}

async fn next_hint(hints: &mut Option<mpsc::Receiver<NotifyHint>>) -> Option<NotifyHint> {
    match hints {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
