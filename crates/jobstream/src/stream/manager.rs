//! Public entry point of the stream client.
//!
//! The manager validates calls, spawns one connection task per subscription
//! and exposes what the task publishes. At most one subscription is live at a
//! time; subscribing again returns the live handle.

use std::collections::HashSet;
use std::sync::Arc;

use jobstream_proto::Job;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::handle::SubscriptionHandle;
use super::observers::{Gate, Observers};
use super::state::{ConnectionState, ConnectionStatus, StateChange};
use super::task::{Command, ConnectionTask, TaskLinks};
use super::transport::{CredentialProvider, SseTransport, Transport};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::store::JobSnapshot;

struct Subscription {
    handle: SubscriptionHandle,
    url: Url,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    gate: Arc<Gate>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Subscriptions {
    active: Option<Subscription>,
    retired: HashSet<SubscriptionHandle>,
}

/// Long-lived client for the job event stream.
///
/// Callbacks run on the connection task. They may call back into the manager,
/// including disconnecting their own subscription, but must not block.
pub struct ConnectionManager {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    observers: Arc<Observers>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    subscriptions: Mutex<Subscriptions>,
}

impl ConnectionManager {
    /// Create a manager that connects over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        let transport = SseTransport::new()?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a manager with a custom transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_transport(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let (snapshot, _) = watch::channel(JobSnapshot::default());
        Ok(Self {
            config,
            transport,
            observers: Arc::new(Observers::default()),
            snapshot: Arc::new(snapshot),
            subscriptions: Mutex::new(Subscriptions::default()),
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start streaming from `url`.
    ///
    /// Returns immediately; connection progress is reported through state
    /// change observers. If a subscription is already live its handle is
    /// returned and nothing else happens.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not an absolute http(s) URL or no tokio
    /// runtime is running.
    pub fn subscribe(
        &self,
        url: &str,
        credentials: impl CredentialProvider + 'static,
    ) -> Result<SubscriptionHandle, StreamError> {
        let url = parse_stream_url(url)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StreamError::NoRuntime(e.to_string()))?;

        let mut subscriptions = self.subscriptions.lock();
        if let Some(active) = &subscriptions.active {
            if active.url != url {
                warn!(
                    handle = %active.handle,
                    active_url = %active.url,
                    requested_url = %url,
                    "already subscribed to a different url; keeping the live subscription"
                );
            }
            debug!(handle = %active.handle, "subscribe on live subscription");
            return Ok(active.handle);
        }

        let handle = SubscriptionHandle::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::initial());
        let status = Arc::new(status);
        let gate = Arc::new(Gate::new());

        let task = ConnectionTask::new(
            handle,
            url.clone(),
            Arc::new(credentials),
            Arc::clone(&self.transport),
            &self.config,
            TaskLinks {
                commands: command_rx,
                status: Arc::clone(&status),
                snapshot: Arc::clone(&self.snapshot),
                observers: Arc::clone(&self.observers),
                gate: Arc::clone(&gate),
            },
        );
        let task = runtime.spawn(task.run());

        info!(handle = %handle, url = %url, "subscribed");
        subscriptions.active = Some(Subscription {
            handle,
            url,
            commands,
            status,
            gate,
            task,
        });
        Ok(handle)
    }

    /// Stop a subscription for good.
    ///
    /// Synchronous: once this returns no callback for the subscription is
    /// running or will run, and a final transition to `Disconnected` has been
    /// delivered. Disconnecting a handle twice is a no-op.
    ///
    /// The connection task is aborted, and the runtime drops it, along with
    /// the response body and its socket, the next time it would be polled.
    /// Use [`shutdown`](Self::shutdown) to wait until the socket is released.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was never issued by this manager.
    pub fn disconnect(&self, handle: SubscriptionHandle) -> Result<(), StreamError> {
        if let Some(subscription) = self.retire(handle)? {
            self.close(&subscription);
        }
        Ok(())
    }

    /// Disconnect and wait for the connection task to finish, so the
    /// transport and its socket are released before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was never issued by this manager.
    pub async fn shutdown(&self, handle: SubscriptionHandle) -> Result<(), StreamError> {
        if let Some(subscription) = self.retire(handle)? {
            self.close(&subscription);
            let _ = subscription.task.await;
        }
        Ok(())
    }

    /// Drop the current connection and connect again with a fresh reconnect
    /// budget. Also revives a subscription that gave up.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or was disconnected.
    pub fn reconnect(&self, handle: SubscriptionHandle) -> Result<(), StreamError> {
        let subscriptions = self.subscriptions.lock();
        let subscription = lookup(&subscriptions, handle)?;
        // Waiters must not see the old failure once a new cycle is queued.
        let _ = subscription.gate.run(|| {
            subscription
                .status
                .send_if_modified(|status| status.fatal.take().is_some())
        });
        subscription
            .commands
            .send(Command::Reconnect)
            .map_err(|_| StreamError::Disconnected(handle))?;
        info!(handle = %handle, "reconnect requested");
        Ok(())
    }

    /// Register a callback for applied job events.
    pub fn on_job_update<F>(&self, callback: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.observers.add_job(Arc::new(callback));
    }

    /// Register a callback for connection state transitions.
    pub fn on_connection_state_change<F>(&self, callback: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.observers.add_state(Arc::new(callback));
    }

    /// Latest job snapshot.
    ///
    /// Kept after a disconnect or a fatal failure, so it may be stale.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch the job snapshot.
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current status of a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was never issued by this manager.
    pub fn status(&self, handle: SubscriptionHandle) -> Result<ConnectionStatus, StreamError> {
        let subscriptions = self.subscriptions.lock();
        match lookup(&subscriptions, handle) {
            Ok(subscription) => Ok(subscription.status.borrow().clone()),
            Err(StreamError::Disconnected(_)) => Ok(ConnectionStatus::initial()),
            Err(e) => Err(e),
        }
    }

    /// Watch the status of a live subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or was disconnected.
    pub fn watch_status(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<watch::Receiver<ConnectionStatus>, StreamError> {
        let subscriptions = self.subscriptions.lock();
        Ok(lookup(&subscriptions, handle)?.status.subscribe())
    }

    /// Wait until the subscription is connected.
    ///
    /// # Errors
    ///
    /// Returns the fatal error if the subscription gave up first, or
    /// [`StreamError::Disconnected`] if it was disconnected while waiting.
    pub async fn wait_connected(&self, handle: SubscriptionHandle) -> Result<(), StreamError> {
        let mut status = self.watch_status(handle)?;
        let outcome = status
            .wait_for(|s| s.state == ConnectionState::Connected || s.is_fatal())
            .await
            .map(|s| s.fatal.clone());

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(fatal)) => Err(fatal.into()),
            Err(_) => Err(StreamError::Disconnected(handle)),
        }
    }

    fn retire(&self, handle: SubscriptionHandle) -> Result<Option<Subscription>, StreamError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.retired.contains(&handle) {
            return Ok(None);
        }
        match subscriptions.active.take() {
            Some(subscription) if subscription.handle == handle => {
                subscriptions.retired.insert(handle);
                Ok(Some(subscription))
            }
            other => {
                subscriptions.active = other;
                Err(StreamError::UnknownHandle(handle))
            }
        }
    }

    /// Deliver the final transition, close the gate and stop the task.
    ///
    /// Must not be called with the subscriptions lock held: a callback
    /// running on the task may need it.
    fn close(&self, subscription: &Subscription) {
        subscription.gate.close_with(|| {
            let status = subscription.status.borrow().clone();
            if status.state != ConnectionState::Disconnected {
                let change = StateChange::new(
                    status.state,
                    ConnectionState::Disconnected,
                    status.attempts,
                );
                subscription.status.send_replace(change.status());
                self.observers.notify_state(&change);
            }
        });
        let _ = subscription.commands.send(Command::Disconnect);
        subscription.task.abort();
        info!(handle = %subscription.handle, "disconnected");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscriptions.get_mut().active.take() {
            subscription.gate.close_with(|| {});
            subscription.task.abort();
        }
    }
}

fn lookup(
    subscriptions: &Subscriptions,
    handle: SubscriptionHandle,
) -> Result<&Subscription, StreamError> {
    match &subscriptions.active {
        Some(subscription) if subscription.handle == handle => Ok(subscription),
        _ if subscriptions.retired.contains(&handle) => Err(StreamError::Disconnected(handle)),
        _ => Err(StreamError::UnknownHandle(handle)),
    }
}

fn parse_stream_url(raw: &str) -> Result<Url, StreamError> {
    let url = Url::parse(raw).map_err(|e| StreamError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(StreamError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::stream::sse::RawEvent;
    use crate::stream::transport::{BoxFuture, Credentials, EventStream, OpenRequest, ProviderFn};
    use futures::StreamExt;
    use futures::channel::mpsc::{UnboundedSender, unbounded};
    use jobstream_proto::{JobStatus, SessionDescriptor, StreamEvent};
    use std::collections::VecDeque;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use test_case::test_case;
    use tokio::time::{Instant, sleep, timeout};

    type EventTx = UnboundedSender<Result<RawEvent, TransportError>>;

    enum Step {
        Fail(TransportError),
        Stream(EventStream),
    }

    /// Plays back a fixed list of connection outcomes. Once the list runs
    /// out, opens hang.
    #[derive(Default)]
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        opens: AtomicU32,
        requests: Mutex<Vec<OpenRequest>>,
    }

    impl ScriptedTransport {
        fn push_stream(&self) -> EventTx {
            let (tx, rx) = unbounded();
            self.steps.lock().push_back(Step::Stream(rx.boxed()));
            tx
        }

        fn push_failures(&self, count: usize, error: &TransportError) {
            let mut steps = self.steps.lock();
            for _ in 0..count {
                steps.push_back(Step::Fail(error.clone()));
            }
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn open<'a>(
            &'a self,
            request: &'a OpenRequest,
        ) -> BoxFuture<'a, Result<EventStream, TransportError>> {
            Box::pin(async move {
                self.opens.fetch_add(1, Ordering::SeqCst);
                self.requests.lock().push(request.clone());
                let step = self.steps.lock().pop_front();
                match step {
                    Some(Step::Stream(stream)) => Ok(stream),
                    Some(Step::Fail(e)) => Err(e),
                    None => futures::future::pending().await,
                }
            })
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        transport: Arc<ScriptedTransport>,
        changes: Arc<Mutex<Vec<StateChange>>>,
        jobs: Arc<Mutex<Vec<Job>>>,
    }

    impl Harness {
        fn new(config: StreamConfig) -> Self {
            let transport = Arc::new(ScriptedTransport::default());
            let manager = Arc::new(
                ConnectionManager::with_transport(config, transport.clone())
                    .expect("valid config"),
            );

            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            manager.on_connection_state_change(move |change| sink.lock().push(change.clone()));

            let jobs = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&jobs);
            manager.on_job_update(move |job| sink.lock().push(job.clone()));

            Self {
                manager,
                transport,
                changes,
                jobs,
            }
        }

        fn subscribe(&self) -> SubscriptionHandle {
            self.manager
                .subscribe("http://jobs.test/api/jobs/stream", Credentials::None)
                .expect("subscribe")
        }

        async fn wait_status(
            &self,
            handle: SubscriptionHandle,
            predicate: impl FnMut(&ConnectionStatus) -> bool,
        ) -> ConnectionStatus {
            let mut status = self.manager.watch_status(handle).expect("live handle");
            timeout(Duration::from_secs(3_600), status.wait_for(predicate))
                .await
                .expect("status wait timed out")
                .expect("status channel open")
                .clone()
        }

        async fn wait_snapshot(&self, predicate: impl FnMut(&JobSnapshot) -> bool) {
            let mut snapshot = self.manager.watch_snapshot();
            let _ = timeout(Duration::from_secs(3_600), snapshot.wait_for(predicate))
                .await
                .expect("snapshot wait timed out")
                .expect("snapshot channel open");
        }

        fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
            self.changes
                .lock()
                .iter()
                .map(|c| (c.previous, c.current))
                .collect()
        }
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            terminal_job_ttl_ms: None,
            ..StreamConfig::default()
        }
    }

    fn raw(event: &StreamEvent) -> RawEvent {
        RawEvent::new(event.kind().tag(), event.payload_json().expect("encodable"))
    }

    fn send(tx: &EventTx, event: &StreamEvent) {
        tx.unbounded_send(Ok(raw(event))).expect("stream open");
    }

    #[test_case("not a url" ; "garbage")]
    #[test_case("/api/jobs/stream" ; "relative path")]
    #[test_case("ftp://jobs.test/stream" ; "unsupported scheme")]
    fn test_invalid_url_rejected(url: &str) {
        let transport = Arc::new(ScriptedTransport::default());
        let manager =
            ConnectionManager::with_transport(test_config(), transport).expect("valid config");

        let result = manager.subscribe(url, Credentials::None);
        assert!(matches!(result, Err(StreamError::InvalidUrl(_))));
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager =
            ConnectionManager::with_transport(test_config(), transport).expect("valid config");
        let result = manager.subscribe("http://jobs.test/stream", Credentials::None);
        assert!(matches!(result, Err(StreamError::NoRuntime(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StreamConfig {
            max_reconnect_attempts: 0,
            ..StreamConfig::default()
        };
        let transport = Arc::new(ScriptedTransport::default());
        assert!(ConnectionManager::with_transport(config, transport).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_connects_and_applies_jobs() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();

        harness.manager.wait_connected(handle).await.expect("connected");

        send(&tx, &StreamEvent::ConnectionOpened(SessionDescriptor::default()));
        send(&tx, &StreamEvent::JobCreated(Job::new("j1", "render", JobStatus::Waiting)));
        send(
            &tx,
            &StreamEvent::JobCompleted(Job::new("j1", "render", JobStatus::Completed).with_result("ok")),
        );

        harness
            .wait_snapshot(|s| s.get("j1").is_some_and(|j| j.status == JobStatus::Completed))
            .await;

        let statuses: Vec<JobStatus> = harness.jobs.lock().iter().map(|j| j.status).collect();
        assert_eq!(statuses, [JobStatus::Waiting, JobStatus::Completed]);
        assert_eq!(harness.manager.snapshot().len(), 1);
        assert_eq!(
            harness.transitions(),
            [
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_idempotent() {
        let harness = Harness::new(test_config());
        let _tx = harness.transport.push_stream();

        let first = harness.subscribe();
        harness.manager.wait_connected(first).await.expect("connected");
        let second = harness.subscribe();

        assert_eq!(first, second);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_trips_watchdog_and_schedules_reconnect() {
        let harness = Harness::new(test_config());
        let _tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");
        let connected_at = Instant::now();

        harness
            .wait_status(handle, |s| s.state == ConnectionState::Reconnecting)
            .await;

        assert!(connected_at.elapsed() >= Duration::from_secs(30));
        let changes = harness.changes.lock();
        let change = changes.last().expect("reconnecting change");
        assert_eq!(change.current, ConnectionState::Reconnecting);
        assert_eq!(
            change.cause,
            Some(TransportError::HeartbeatTimeout(Duration::from_secs(30)))
        );
        let retry_in = change.retry_in.expect("retry scheduled");
        assert!(retry_in >= Duration::from_secs(1));
        assert!(retry_in <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_connection_alive() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        for _ in 0..10 {
            sleep(Duration::from_secs(20)).await;
            send(&tx, &StreamEvent::heartbeat());
        }
        sleep(Duration::from_secs(1)).await;

        let status = harness.manager.status(handle).expect("status");
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(harness.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_reconnect_budget() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        harness
            .transport
            .push_failures(10, &TransportError::Status(503));
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        drop(tx);
        let status = harness.wait_status(handle, ConnectionStatus::is_fatal).await;

        assert_eq!(status.state, ConnectionState::Disconnected);
        let fatal = status.fatal.expect("fatal error");
        assert_eq!(fatal.attempts, 10);
        assert_eq!(fatal.last_error, TransportError::Status(503));
        assert_eq!(harness.transport.opens(), 11);

        let reconnecting = harness
            .changes
            .lock()
            .iter()
            .filter(|c| c.current == ConnectionState::Reconnecting)
            .count();
        assert_eq!(reconnecting, 10);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(harness.transport.opens(), 11);
        assert!(matches!(
            harness.manager.wait_connected(handle).await,
            Err(StreamError::Fatal(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_between_failed_attempts() {
        let harness = Harness::new(test_config());
        harness
            .transport
            .push_failures(4, &TransportError::Connect("refused".to_string()));
        let handle = harness.subscribe();

        harness.wait_status(handle, |s| s.attempts == 4).await;

        let delays: Vec<Duration> = harness
            .changes
            .lock()
            .iter()
            .filter_map(|c| c.retry_in)
            .collect();
        assert_eq!(delays.len(), 4);
        for (attempt, delay) in delays.iter().enumerate() {
            let floor = Duration::from_secs(1 << attempt);
            assert!(*delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(*delay <= floor + Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_reset_after_successful_connect() {
        let harness = Harness::new(test_config());
        let error = TransportError::Connect("refused".to_string());
        harness.transport.push_failures(3, &error);
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();

        harness.manager.wait_connected(handle).await.expect("connected");
        assert_eq!(harness.manager.status(handle).expect("status").attempts, 0);

        drop(tx);
        let status = harness
            .wait_status(handle, |s| s.state == ConnectionState::Reconnecting)
            .await;
        assert_eq!(status.attempts, 1);

        let changes = harness.changes.lock();
        let last = changes.last().expect("reconnecting change");
        assert_eq!(last.cause, Some(TransportError::Closed));
        let retry_in = last.retry_in.expect("retry scheduled");
        assert!(retry_in >= Duration::from_secs(1));
        assert!(retry_in <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_is_final() {
        let harness = Harness::new(test_config());
        harness
            .transport
            .push_failures(1, &TransportError::Status(502));
        let _tx = harness.transport.push_stream();
        let handle = harness.subscribe();

        harness
            .wait_status(handle, |s| s.state == ConnectionState::Reconnecting)
            .await;
        harness.manager.disconnect(handle).expect("disconnect");

        let seen = harness.changes.lock().len();
        assert_eq!(
            harness.transitions().last(),
            Some(&(ConnectionState::Reconnecting, ConnectionState::Disconnected))
        );

        sleep(Duration::from_secs(300)).await;
        assert_eq!(harness.changes.lock().len(), seen);
        assert_eq!(harness.transport.opens(), 1);
        assert_eq!(
            harness.manager.status(handle).expect("status").state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let harness = Harness::new(test_config());
        let _tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        harness.manager.disconnect(handle).expect("first disconnect");
        harness.manager.disconnect(handle).expect("second disconnect");

        let disconnects = harness
            .changes
            .lock()
            .iter()
            .filter(|c| c.current == ConnectionState::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert!(matches!(
            harness.manager.reconnect(handle),
            Err(StreamError::Disconnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_handle_rejected() {
        let harness = Harness::new(test_config());
        let stranger = SubscriptionHandle::new();

        assert!(matches!(
            harness.manager.disconnect(stranger),
            Err(StreamError::UnknownHandle(_))
        ));
        assert!(matches!(
            harness.manager.reconnect(stranger),
            Err(StreamError::UnknownHandle(_))
        ));
        assert!(matches!(
            harness.manager.status(stranger),
            Err(StreamError::UnknownHandle(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_subscription_after_disconnect_gets_new_handle() {
        let harness = Harness::new(test_config());
        let _first_tx = harness.transport.push_stream();
        let _second_tx = harness.transport.push_stream();

        let first = harness.subscribe();
        harness.manager.wait_connected(first).await.expect("connected");
        harness.manager.shutdown(first).await.expect("shutdown");

        let second = harness.subscribe();
        assert_ne!(first, second);
        harness.manager.wait_connected(second).await.expect("connected");
        assert_eq!(harness.transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_event_is_dropped() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        tx.unbounded_send(Ok(RawEvent::new("job:created", "{not json")))
            .expect("stream open");
        tx.unbounded_send(Ok(RawEvent::new("job:paused", "{}")))
            .expect("stream open");
        send(&tx, &StreamEvent::JobCreated(Job::new("j2", "ok", JobStatus::Waiting)));

        harness.wait_snapshot(|s| s.contains_key("j2")).await;

        assert_eq!(harness.jobs.lock().len(), 1);
        assert_eq!(harness.manager.snapshot().len(), 1);
        assert_eq!(
            harness.manager.status(handle).expect("status").state,
            ConnectionState::Connected
        );
        assert_eq!(harness.transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_revives_failed_subscription() {
        let config = StreamConfig {
            max_reconnect_attempts: 1,
            ..test_config()
        };
        let harness = Harness::new(config);
        harness
            .transport
            .push_failures(2, &TransportError::Status(500));
        let handle = harness.subscribe();

        harness.wait_status(handle, ConnectionStatus::is_fatal).await;
        assert_eq!(harness.transport.opens(), 2);

        let _tx = harness.transport.push_stream();
        harness.manager.reconnect(handle).expect("reconnect");
        harness.manager.wait_connected(handle).await.expect("connected");

        let status = harness.manager.status(handle).expect("status");
        assert_eq!(status.attempts, 0);
        assert!(!status.is_fatal());
        assert_eq!(harness.transport.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_clears_fatal_status_before_task_runs() {
        let config = StreamConfig {
            max_reconnect_attempts: 1,
            ..test_config()
        };
        let harness = Harness::new(config);
        harness
            .transport
            .push_failures(2, &TransportError::Status(500));
        let handle = harness.subscribe();
        harness.wait_status(handle, ConnectionStatus::is_fatal).await;

        let tx = harness.transport.push_stream();
        harness.manager.reconnect(handle).expect("reconnect");

        // Nothing has yielded to the task yet.
        let status = harness.manager.status(handle).expect("status");
        assert!(!status.is_fatal());

        harness.manager.wait_connected(handle).await.expect("connected");
        send(&tx, &StreamEvent::JobCreated(Job::new("j1", "sync", JobStatus::Waiting)));
        harness.wait_snapshot(|s| s.contains_key("j1")).await;
        assert_eq!(harness.transport.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_live_connection() {
        let harness = Harness::new(test_config());
        let _first = harness.transport.push_stream();
        let _second = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        harness.manager.reconnect(handle).expect("reconnect");
        sleep(Duration::from_millis(10)).await;
        harness.manager.wait_connected(handle).await.expect("connected");

        assert_eq!(harness.transport.opens(), 2);
        let transitions = harness.transitions();
        assert_eq!(
            transitions[transitions.len() - 2..],
            [
                (ConnectionState::Connected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_event_id_and_fresh_credentials_on_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = ConnectionManager::with_transport(test_config(), transport.clone())
            .expect("valid config");
        let tx = transport.push_stream();
        let _second = transport.push_stream();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let provider = ProviderFn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Credentials::Cookie(format!("session=s{n}"))
        });
        let handle = manager
            .subscribe("https://jobs.test/api/jobs/stream", provider)
            .expect("subscribe");
        manager.wait_connected(handle).await.expect("connected");

        let event = StreamEvent::JobCreated(Job::new("j1", "x", JobStatus::Waiting));
        tx.unbounded_send(Ok(raw(&event).with_id("evt-7")))
            .expect("stream open");
        let mut snapshot = manager.watch_snapshot();
        snapshot
            .wait_for(|s| s.contains_key("j1"))
            .await
            .expect("snapshot channel open");
        drop(tx);

        timeout(Duration::from_secs(60), async {
            while transport.opens() < 2 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("second open");

        let requests = transport.requests.lock();
        assert_eq!(requests[0].last_event_id, None);
        assert_eq!(requests[1].last_event_id.as_deref(), Some("evt-7"));
        assert_eq!(requests[0].credentials, Credentials::Cookie("session=s0".to_string()));
        assert_eq!(requests[1].credentials, Credentials::Cookie("session=s1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_disconnect_its_own_subscription() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        let manager: Weak<ConnectionManager> = Arc::downgrade(&harness.manager);
        harness.manager.on_job_update(move |_| {
            if let Some(manager) = manager.upgrade() {
                manager.disconnect(handle).expect("disconnect from callback");
            }
        });

        send(&tx, &StreamEvent::JobCreated(Job::new("j1", "x", JobStatus::Waiting)));
        send(&tx, &StreamEvent::JobCreated(Job::new("j2", "x", JobStatus::Waiting)));
        sleep(Duration::from_secs(1)).await;

        let delivered: Vec<String> = harness
            .jobs
            .lock()
            .iter()
            .map(|j| j.id.to_string())
            .collect();
        assert_eq!(delivered, ["j1"]);
        assert_eq!(
            harness.transitions().last(),
            Some(&(ConnectionState::Connected, ConnectionState::Disconnected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_kept_after_disconnect() {
        let harness = Harness::new(test_config());
        let tx = harness.transport.push_stream();
        let handle = harness.subscribe();
        harness.manager.wait_connected(handle).await.expect("connected");

        send(&tx, &StreamEvent::JobActive(Job::new("j1", "x", JobStatus::Active).with_progress(40)));
        harness.wait_snapshot(|s| s.contains_key("j1")).await;
        harness.manager.shutdown(handle).await.expect("shutdown");

        let snapshot = harness.manager.snapshot();
        assert_eq!(snapshot["j1"].progress, 40);
    }
}
