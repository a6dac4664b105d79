//! The per-subscription connection task.
//!
//! One task owns the transport, the watchdog, the backoff counter and the job
//! store for a subscription. The manager talks to it through a command
//! channel; everything it produces goes out through watch channels and the
//! observer registry, always behind the subscription's [`Gate`].

use std::sync::Arc;

use futures::StreamExt;
use jobstream_proto::{StreamEvent, decode};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::backoff::{BackoffPolicy, should_reconnect};
use super::handle::SubscriptionHandle;
use super::observers::{Gate, Observers};
use super::sse::RawEvent;
use super::state::{ConnectionState, ConnectionStatus, StateChange};
use super::transport::{CredentialProvider, EventStream, OpenRequest, Transport};
use super::watchdog::Watchdog;
use crate::config::StreamConfig;
use crate::error::{FatalError, TransportError};
use crate::store::{JobSnapshot, JobStore};

/// Control messages from the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Drop the current connection and start over with a fresh budget.
    Reconnect,
    /// Stop for good.
    Disconnect,
}

/// Why a connection ended.
enum Exit {
    Failed(TransportError),
    Reconnect,
    Disconnect,
}

/// Outcome of an open attempt raced against the command channel.
enum Opened {
    Stream(EventStream),
    Failed(TransportError),
    Command(Option<Command>),
}

/// Channels and shared state a task publishes into.
pub(crate) struct TaskLinks {
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) status: Arc<watch::Sender<ConnectionStatus>>,
    pub(crate) snapshot: Arc<watch::Sender<JobSnapshot>>,
    pub(crate) observers: Arc<Observers>,
    pub(crate) gate: Arc<Gate>,
}

pub(crate) struct ConnectionTask {
    handle: SubscriptionHandle,
    url: Url,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    watchdog: Watchdog,
    store: JobStore,
    state: ConnectionState,
    attempts: u32,
    last_event_id: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    observers: Arc<Observers>,
    gate: Arc<Gate>,
}

impl ConnectionTask {
    pub(crate) fn new(
        handle: SubscriptionHandle,
        url: Url,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn Transport>,
        config: &StreamConfig,
        links: TaskLinks,
    ) -> Self {
        Self {
            handle,
            url,
            credentials,
            transport,
            backoff: config.backoff(),
            max_attempts: config.max_reconnect_attempts,
            watchdog: Watchdog::new(config.heartbeat_timeout()),
            store: JobStore::with_terminal_ttl(config.terminal_job_ttl()),
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_event_id: None,
            commands: links.commands,
            status: links.status,
            snapshot: links.snapshot,
            observers: links.observers,
            gate: links.gate,
        }
    }

    /// Run until disconnected.
    pub(crate) async fn run(mut self) {
        info!(handle = %self.handle, url = %self.url, "subscription started");
        self.publish_snapshot();

        loop {
            self.transition(StateChange::new(
                self.state,
                ConnectionState::Connecting,
                self.attempts,
            ));

            let request = OpenRequest {
                url: self.url.clone(),
                credentials: self.credentials.credentials(),
                last_event_id: self.last_event_id.clone(),
            };

            let opened = tokio::select! {
                biased;
                command = self.commands.recv() => Opened::Command(command),
                result = self.transport.open(&request) => match result {
                    Ok(stream) => Opened::Stream(stream),
                    Err(e) => Opened::Failed(e),
                },
            };

            let exit = match opened {
                Opened::Stream(stream) => {
                    self.attempts = 0;
                    self.transition(StateChange::new(
                        self.state,
                        ConnectionState::Connected,
                        0,
                    ));
                    self.watchdog.arm();
                    let exit = self.pump(stream).await;
                    self.watchdog.cancel();
                    exit
                }
                Opened::Failed(e) => Exit::Failed(e),
                Opened::Command(Some(Command::Reconnect)) => Exit::Reconnect,
                Opened::Command(Some(Command::Disconnect) | None) => Exit::Disconnect,
            };

            let proceed = match exit {
                Exit::Failed(e) => self.recover(e).await,
                Exit::Reconnect => {
                    info!(handle = %self.handle, "reconnect requested");
                    self.attempts = 0;
                    true
                }
                Exit::Disconnect => false,
            };
            if !proceed {
                break;
            }
        }

        self.watchdog.cancel();
        if self.state != ConnectionState::Disconnected {
            self.transition(StateChange::new(
                self.state,
                ConnectionState::Disconnected,
                self.attempts,
            ));
        }
        info!(handle = %self.handle, "subscription stopped");
    }

    /// Read events until the connection ends.
    async fn pump(&mut self, mut stream: EventStream) -> Exit {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    return match command {
                        Some(Command::Reconnect) => Exit::Reconnect,
                        Some(Command::Disconnect) | None => Exit::Disconnect,
                    };
                }
                item = stream.next() => match item {
                    Some(Ok(raw)) => self.handle_raw(raw),
                    Some(Err(e)) => return Exit::Failed(e),
                    None => return Exit::Failed(TransportError::Closed),
                },
                () = self.watchdog.expired() => {
                    return Exit::Failed(TransportError::HeartbeatTimeout(self.watchdog.timeout()));
                }
            }
        }
    }

    fn handle_raw(&mut self, raw: RawEvent) {
        if let Some(id) = raw.id {
            self.last_event_id = Some(id);
        }
        if let Some(retry) = raw.retry {
            debug!(retry_ms = retry.as_millis(), "ignoring server retry hint");
        }

        let event = match decode(&raw.data, &raw.event_type) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    handle = %self.handle,
                    event_type = %e.event_type,
                    raw = %e.raw,
                    error = %e,
                    "dropping undecodable event"
                );
                return;
            }
        };

        self.watchdog.reset();
        match &event {
            StreamEvent::Heartbeat { server_time } => {
                trace!(handle = %self.handle, server_time = ?server_time, "heartbeat");
            }
            StreamEvent::ConnectionOpened(session) => {
                info!(
                    handle = %self.handle,
                    session_id = ?session.session_id,
                    heartbeat_interval_ms = ?session.heartbeat_interval_ms,
                    "stream session opened"
                );
                if let Some(interval) = session.heartbeat_interval_ms {
                    if u128::from(interval) >= self.watchdog.timeout().as_millis() {
                        warn!(
                            interval_ms = interval,
                            timeout_ms = self.watchdog.timeout().as_millis(),
                            "server heartbeat interval is not shorter than the watchdog timeout"
                        );
                    }
                }
            }
            _ => {
                if let Some(job) = self.store.apply(&event) {
                    let snapshot = self.store.snapshot();
                    let _ = self.gate.run(|| {
                        self.snapshot.send_replace(snapshot);
                        self.observers.notify_job(&job);
                    });
                }
            }
        }
    }

    /// Decide what follows a failed connection. Returns false to stop.
    async fn recover(&mut self, cause: TransportError) -> bool {
        if !self.gate.is_open() {
            return false;
        }

        if !should_reconnect(self.attempts, self.max_attempts) {
            // A reconnect queued before the budget ran out starts over at once.
            match self.commands.try_recv() {
                Ok(Command::Reconnect) => {
                    info!(handle = %self.handle, "reconnect requested");
                    self.attempts = 0;
                    return true;
                }
                Ok(Command::Disconnect) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => {}
            }

            let fatal = FatalError {
                attempts: self.attempts,
                last_error: cause.clone(),
            };
            error!(handle = %self.handle, error = %fatal, "giving up on stream");
            self.transition(
                StateChange::new(self.state, ConnectionState::Disconnected, self.attempts)
                    .with_cause(cause)
                    .with_fatal(fatal),
            );

            // Only an explicit reconnect revives a failed subscription.
            return match self.commands.recv().await {
                Some(Command::Reconnect) => {
                    info!(handle = %self.handle, "reconnect requested after failure");
                    self.attempts = 0;
                    true
                }
                Some(Command::Disconnect) | None => false,
            };
        }

        let delay = self.backoff.delay(self.attempts);
        self.attempts += 1;
        warn!(
            handle = %self.handle,
            attempt = self.attempts,
            delay_ms = delay.as_millis(),
            error = %cause,
            "stream lost, reconnecting"
        );
        self.transition(
            StateChange::new(self.state, ConnectionState::Reconnecting, self.attempts)
                .with_retry_in(delay)
                .with_cause(cause),
        );

        tokio::select! {
            biased;
            command = self.commands.recv() => match command {
                Some(Command::Reconnect) => {
                    self.attempts = 0;
                    true
                }
                Some(Command::Disconnect) | None => false,
            },
            () = sleep(delay) => true,
        }
    }

    fn transition(&mut self, change: StateChange) {
        info!(
            handle = %self.handle,
            from = %change.previous,
            to = %change.current,
            attempts = change.attempts,
            "connection state changed"
        );
        self.state = change.current;
        let _ = self.gate.run(|| {
            self.status.send_replace(change.status());
            self.observers.notify_state(&change);
        });
    }

    fn publish_snapshot(&self) {
        let snapshot = self.store.snapshot();
        let _ = self.gate.run(|| {
            self.snapshot.send_replace(snapshot);
        });
    }
}
