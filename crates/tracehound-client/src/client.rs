//! The trace client and its background delivery loop.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracehound_core::TraceEvent;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::queue::EventQueue;
use crate::transport::{BatchSink, Connector, WsConnector};
use crate::{ClientConfig, ClientError};

/// Connection lifecycle of the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

struct Shared {
    queue: EventQueue,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Buffers trace events and delivers them to the gateway in the background.
///
/// `send_event` only enqueues; a spawned task drains the queue every
/// `batch_interval_ms` and reconnects with backoff when the connection drops.
/// Must be created inside a tokio runtime.
pub struct TraceClient {
    shared: Arc<Shared>,
    project_name: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TraceClient {
    /// Starts a client that connects to `config.url` over WebSocket.
    pub fn start(config: ClientConfig) -> Self {
        let connector = WsConnector::new(config.url.clone());
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClientConfig, connector: impl Connector) -> Self {
        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.max_queue_size),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            shared: Arc::clone(&shared),
            connector: Box::new(connector),
            backoff: Backoff::new(&config),
            sink: None,
            config: config.clone(),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        Self {
            shared,
            project_name: config.project_name,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Queues an event for delivery. Never waits on the network.
    pub fn send_event(&self, mut event: TraceEvent) {
        if event.project_name.is_none() {
            event.project_name = Some(self.project_name.clone());
        }
        self.shared.queue.push(event);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue.len()
    }

    /// Events evicted because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.shared.queue.dropped()
    }

    /// Stops the loop after a best-effort flush of everything still queued.
    pub async fn disconnect(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Trace client task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TraceClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery loop
// ─────────────────────────────────────────────────────────────────────────────

struct Worker {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    backoff: Backoff,
    sink: Option<Box<dyn BatchSink>>,
    config: ClientConfig,
}

impl Worker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut flush = time::interval(self.config.batch_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_attempt = Instant::now();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = time::sleep_until(next_attempt), if self.sink.is_none() => {
                    if self.connect().await.is_err() {
                        next_attempt = self.schedule_retry();
                    }
                }
                _ = flush.tick() => {
                    if self.flush_once().await.is_err() {
                        next_attempt = self.schedule_retry();
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        self.shared.set_state(ConnectionState::Connecting);
        let timeout = self.config.connect_timeout();
        let result = match time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        };

        match result {
            Ok(sink) => {
                info!(url = %self.config.url, "Trace client connected");
                self.sink = Some(sink);
                self.backoff.reset();
                self.shared.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(attempt = self.backoff.attempts() + 1, "Trace client connect failed: {}", e);
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn schedule_retry(&mut self) -> Instant {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        Instant::now() + delay
    }

    /// Sends one batch if connected. On failure the batch goes back to the
    /// front of the queue and the connection is dropped.
    async fn flush_once(&mut self) -> Result<(), ClientError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let batch = self.shared.queue.drain_batch(self.config.max_batch_size());
        if batch.is_empty() {
            return Ok(());
        }

        let sent = sink.send_batch(&batch).await;
        match sent {
            Ok(()) => {
                debug!(events = batch.len(), "Flushed trace batch");
                Ok(())
            }
            Err(e) => {
                warn!(events = batch.len(), "Trace batch send failed, requeueing: {}", e);
                self.shared.queue.requeue_front(batch);
                self.sink = None;
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) {
        let budget = self.config.connect_timeout();
        if time::timeout(budget, self.drain_all()).await.is_err() {
            warn!(remaining = self.shared.queue.len(), "Final trace flush timed out");
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("Error closing trace connection: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn drain_all(&mut self) {
        if self.shared.queue.is_empty() {
            return;
        }
        if self.sink.is_none() && self.connect().await.is_err() {
            return;
        }
        while !self.shared.queue.is_empty() {
            if self.flush_once().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracehound_core::EventKind;

    #[derive(Default)]
    struct MockState {
        batches: Mutex<Vec<Vec<TraceEvent>>>,
        connects: AtomicUsize,
        fail_connects: AtomicUsize,
        fail_sends: AtomicUsize,
        stall_connects: AtomicUsize,
        closed: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct MockConnector(Arc<MockState>);

    impl MockConnector {
        fn failing_connects(n: usize) -> Self {
            let mock = Self::default();
            mock.0.fail_connects.store(n, Ordering::SeqCst);
            mock
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.0
                .batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.iter().map(|e| e.run_id.clone()).collect())
                .collect()
        }
    }

    /// Decrements `counter` if positive, returning whether it was.
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn BatchSink>, ClientError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.0.stall_connects) {
                std::future::pending::<()>().await;
            }
            if take_failure(&self.0.fail_connects) {
                return Err(ClientError::Connect("connection refused".to_string()));
            }
            Ok(Box::new(MockSink(Arc::clone(&self.0))))
        }
    }

    struct MockSink(Arc<MockState>);

    #[async_trait]
    impl BatchSink for MockSink {
        async fn send_batch(&mut self, batch: &[TraceEvent]) -> Result<(), ClientError> {
            if take_failure(&self.0.fail_sends) {
                return Err(ClientError::Closed);
            }
            self.0.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ClientError> {
            self.0.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_project_name("agents")
            .with_batch_interval(Duration::from_millis(20))
            .with_connect_timeout(Duration::from_millis(200))
            .with_reconnect(5, Duration::from_millis(10), Duration::from_millis(40))
    }

    fn event(run_id: &str) -> TraceEvent {
        TraceEvent::new("t1", run_id, EventKind::ChainEnd { outputs: serde_json::Value::Null })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_in_one_batch() {
        let mock = MockConnector::default();
        let client = TraceClient::with_connector(config(), mock.clone());

        client.send_event(event("e1"));
        client.send_event(event("e2"));
        client.send_event(event("e3"));
        assert_eq!(client.queue_size(), 3);

        wait_until(|| !mock.batches().is_empty()).await;
        assert_eq!(mock.batches(), vec![vec!["e1", "e2", "e3"]]);
        assert!(client.is_connected());
        assert_eq!(client.queue_size(), 0);

        let sent = mock.0.batches.lock().unwrap()[0][0].clone();
        assert_eq!(sent.project_name.as_deref(), Some("agents"));
    }

    #[tokio::test]
    async fn test_reconnects_after_failed_attempts() {
        let mock = MockConnector::failing_connects(2);
        let client = TraceClient::with_connector(config(), mock.clone());
        client.send_event(event("e1"));

        wait_until(|| !mock.batches().is_empty()).await;
        assert_eq!(mock.0.connects.load(Ordering::SeqCst), 3);
        assert_eq!(mock.batches(), vec![vec!["e1"]]);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_send_is_requeued_and_retried() {
        let mock = MockConnector::default();
        mock.0.fail_sends.store(1, Ordering::SeqCst);
        let client = TraceClient::with_connector(config(), mock.clone());
        client.send_event(event("e1"));
        client.send_event(event("e2"));

        wait_until(|| !mock.batches().is_empty()).await;
        assert_eq!(mock.batches(), vec![vec!["e1", "e2"]]);
        assert!(mock.0.connects.load(Ordering::SeqCst) >= 2);
        assert_eq!(client.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_buffers_while_unreachable_and_evicts_oldest() {
        let mock = MockConnector::failing_connects(usize::MAX);
        let client = TraceClient::with_connector(config().with_max_queue_size(2), mock.clone());

        client.send_event(event("e1"));
        client.send_event(event("e2"));
        client.send_event(event("e3"));

        wait_until(|| mock.0.connects.load(Ordering::SeqCst) >= 2).await;
        assert!(!client.is_connected());
        assert_eq!(client.queue_size(), 2);
        assert_eq!(client.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_queue_and_closes() {
        let mock = MockConnector::default();
        let client = TraceClient::with_connector(
            config().with_batch_interval(Duration::from_secs(60)).with_max_batch_size(2),
            mock.clone(),
        );
        for id in ["e1", "e2", "e3"] {
            client.send_event(event(id));
        }

        client.disconnect().await;
        let delivered: Vec<String> = mock.batches().into_iter().flatten().collect();
        assert_eq!(delivered, vec!["e1", "e2", "e3"]);
        assert!(mock.0.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stalled_connect_times_out_and_retries() {
        let mock = MockConnector::default();
        mock.0.stall_connects.store(1, Ordering::SeqCst);
        let client = TraceClient::with_connector(
            config().with_connect_timeout(Duration::from_millis(100)),
            mock.clone(),
        );
        client.send_event(event("e1"));

        wait_until(|| !mock.batches().is_empty()).await;
        assert_eq!(mock.0.connects.load(Ordering::SeqCst), 2);
        assert!(client.is_connected());
        assert_eq!(mock.batches(), vec![vec!["e1"]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_with_zero_batch_size_completes() {
        let mock = MockConnector::default();
        let client = TraceClient::with_connector(
            config().with_batch_interval(Duration::from_secs(60)).with_max_batch_size(0),
            mock.clone(),
        );
        client.send_event(event("e1"));
        client.send_event(event("e2"));

        time::timeout(Duration::from_secs(3), client.disconnect())
            .await
            .expect("disconnect should not hang");
        assert_eq!(mock.batches(), vec![vec!["e1"], vec!["e2"]]);
    }
}
