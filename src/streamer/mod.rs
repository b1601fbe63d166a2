//! The streamer facade: accepts messages from callers and coordinates the
//! batching, queueing, delivery and replay machinery behind them.

pub mod attachments;
pub mod consumer;
mod ingress;

pub use attachments::{AttachmentExtractor, AttachmentPreprocessor, DisabledUploads, FileUploadManager};
pub use consumer::{ConsumerContext, QueueConsumer};

use crate::buffer::{BatchManager, BatchingConfig, FlushCallback, MessageQueue, remaining, wait_until};
use crate::domain::Message;
use crate::reliability::{
    ConnectionMonitor, ConnectionProbe, MonitorConfig, ReplayCallback, ReplayConfig, ReplayError,
    ReplayManager,
};
use crate::sender::{DeliveryTracker, MessageProcessor, StatsSnapshot, StreamerStats};
use ingress::Ingress;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Replay manager error: {0}")]
    Replay(#[from] ReplayError),
    #[error("Failed to start background thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// `None` leaves the queue unbounded.
    pub queue_max_length: Option<usize>,
    pub consumer_count: usize,
    /// Consumer wait on an empty queue, and the longest a consumer sleeps
    /// before re-checking for stop or backoff.
    pub probe_interval: Duration,
    pub use_batching: bool,
    pub batching: BatchingConfig,
    pub monitor: MonitorConfig,
    pub replay: ReplayConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            queue_max_length: Some(100_000),
            consumer_count: 1,
            probe_interval: Duration::from_millis(100),
            use_batching: true,
            batching: BatchingConfig::default(),
            monitor: MonitorConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl StreamerConfig {
    pub fn validate(&self) -> Result<(), StreamerError> {
        if self.consumer_count == 0 {
            return Err(StreamerError::InvalidConfig(
                "consumer_count must be at least 1".to_string(),
            ));
        }
        if self.probe_interval.is_zero() {
            return Err(StreamerError::InvalidConfig(
                "probe_interval must be greater than zero".to_string(),
            ));
        }
        if self.replay.tick_interval.is_zero() {
            return Err(StreamerError::InvalidConfig(
                "replay tick_interval must be greater than zero".to_string(),
            ));
        }
        let batch_configs = [
            ("spans", &self.batching.spans),
            ("traces", &self.batching.traces),
            ("feedback_scores", &self.batching.feedback_scores),
            ("guardrails", &self.batching.guardrails),
            ("experiment_items", &self.batching.experiment_items),
        ];
        for (name, batch) in batch_configs {
            if batch.max_batch_size == 0 {
                return Err(StreamerError::InvalidConfig(format!(
                    "{name} max_batch_size must be at least 1"
                )));
            }
            if batch.max_payload_mb.is_some_and(|mb| mb.is_nan() || mb <= 0.0) {
                return Err(StreamerError::InvalidConfig(format!(
                    "{name} max_payload_mb must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Running,
    Draining,
    Closed,
}

struct LifecycleState {
    state: StreamerState,
    puts_in_flight: usize,
}

/// Lifecycle plus the count of `put` calls currently executing.
struct Lifecycle {
    inner: Mutex<LifecycleState>,
    puts_done: Condvar,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleState {
                state: StreamerState::Running,
                puts_in_flight: 0,
            }),
            puts_done: Condvar::new(),
        }
    }

    fn state(&self) -> StreamerState {
        self.inner.lock().state
    }

    fn begin_put(&self) -> Option<PutGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.state != StreamerState::Running {
            return None;
        }
        inner.puts_in_flight += 1;
        Some(PutGuard { lifecycle: self })
    }

    /// Waits until no `put` is executing. Returns false on timeout.
    fn wait_for_puts(&self, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        while inner.puts_in_flight > 0 {
            if self.puts_done.wait_until(&mut inner, deadline).timed_out() {
                return inner.puts_in_flight == 0;
            }
        }
        true
    }

    fn transition(&self, state: StreamerState) {
        self.inner.lock().state = state;
    }
}

struct PutGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for PutGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.lifecycle.inner.lock();
        inner.puts_in_flight = inner.puts_in_flight.saturating_sub(1);
        if inner.puts_in_flight == 0 {
            self.lifecycle.puts_done.notify_all();
        }
    }
}

/// Entry point of the delivery pipeline.
///
/// `put` never blocks on the network and never fails: messages are batched,
/// registered for replay, queued, and delivered by background consumers.
/// `flush` and `close` take a timeout and report whether everything drained.
pub struct Streamer {
    lifecycle: Arc<Lifecycle>,
    ingress: Arc<Ingress>,
    queue: Arc<MessageQueue>,
    batch_manager: Option<BatchManager>,
    replay: Arc<ReplayManager>,
    consumers: Mutex<Vec<QueueConsumer>>,
    preprocessor: Box<dyn AttachmentPreprocessor>,
    uploads: Arc<dyn FileUploadManager>,
    stats: Arc<StreamerStats>,
    // Serializes flush and close.
    control: Mutex<()>,
}

impl Streamer {
    pub fn new(
        config: StreamerConfig,
        processor: Arc<dyn MessageProcessor>,
        uploads: Arc<dyn FileUploadManager>,
    ) -> Result<Self, StreamerError> {
        Self::with_probe(config, processor, uploads, None)
    }

    /// Like [`Streamer::new`], with a reachability probe for the connection
    /// monitor.
    pub fn with_probe(
        config: StreamerConfig,
        processor: Arc<dyn MessageProcessor>,
        uploads: Arc<dyn FileUploadManager>,
        probe: Option<Arc<dyn ConnectionProbe>>,
    ) -> Result<Self, StreamerError> {
        config.validate()?;

        let stats = Arc::new(StreamerStats::new());
        let queue = Arc::new(MessageQueue::new(config.queue_max_length));

        let mut monitor = ConnectionMonitor::new(config.monitor.clone());
        if let Some(probe) = probe {
            monitor = monitor.with_probe(probe);
        }
        let replay = Arc::new(ReplayManager::new(config.replay.clone(), monitor));
        let ingress = Arc::new(Ingress::new(queue.clone(), replay.clone(), stats.clone()));
        let lifecycle = Arc::new(Lifecycle::new());

        replay.set_replay_callback(replay_callback(
            Arc::downgrade(&ingress),
            lifecycle.clone(),
            stats.clone(),
        ));

        let batch_manager = if config.use_batching {
            let batch_ingress = ingress.clone();
            let flush_callback: FlushCallback = Arc::new(move |batch| batch_ingress.enqueue(batch));
            let manager = BatchManager::new(config.batching.clone(), flush_callback);
            manager.start()?;
            Some(manager)
        } else {
            None
        };

        let tracker: Arc<dyn DeliveryTracker> = replay.clone();
        let mut consumers = Vec::with_capacity(config.consumer_count);
        for index in 0..config.consumer_count {
            consumers.push(QueueConsumer::start(
                index,
                ConsumerContext {
                    queue: queue.clone(),
                    processor: processor.clone(),
                    tracker: tracker.clone(),
                    stats: stats.clone(),
                    probe_interval: config.probe_interval,
                },
            )?);
        }

        replay.start()?;

        tracing::info!(
            consumers = config.consumer_count,
            batching = config.use_batching,
            queue_max_length = config.queue_max_length,
            "Streamer started"
        );

        Ok(Self {
            lifecycle,
            ingress,
            queue,
            batch_manager,
            replay,
            consumers: Mutex::new(consumers),
            preprocessor: Box::new(AttachmentExtractor::new(uploads.clone())),
            uploads,
            stats,
            control: Mutex::new(()),
        })
    }

    /// Accepts a message for delivery. Ignored once shutdown has begun.
    pub fn put(&self, message: Message) {
        let Some(_put) = self.lifecycle.begin_put() else {
            self.stats.record_dropped_after_close();
            tracing::debug!(
                message_type = %message.message_type(),
                "Streamer is closing, message dropped"
            );
            return;
        };
        self.stats.record_accepted();

        let Some(message) = self.preprocessor.preprocess(message) else {
            return;
        };
        let message = match &self.batch_manager {
            Some(batch_manager) => match batch_manager.process_message(message) {
                Some(message) => message,
                None => return,
            },
            None => message,
        };
        self.ingress.enqueue(message);
    }

    /// Pushes out partial batches, replays failed messages when the server is
    /// reachable, and waits for the queue to drain. Returns false if that did
    /// not finish within `timeout`.
    pub fn flush(&self, timeout: Duration) -> bool {
        let _control = self.control.lock();
        self.flush_until(Instant::now() + timeout, true)
    }

    fn flush_until(&self, deadline: Instant, replay: bool) -> bool {
        let puts_done = self.lifecycle.wait_for_puts(deadline);

        if let Some(batch_manager) = &self.batch_manager {
            batch_manager.flush();
        }

        if replay && self.replay.has_server_connection() {
            match self.replay.flush() {
                Ok(0) => {}
                Ok(replayed) => tracing::debug!(replayed, "Replayed failed messages during flush"),
                Err(e) => tracing::warn!(error = %e, "Replay during flush failed"),
            }
        }

        let drained = wait_until(
            || self.is_idle(),
            remaining(deadline),
            IDLE_POLL_INTERVAL,
        );
        let uploads_done = self.uploads.flush(remaining(deadline), IDLE_POLL_INTERVAL);

        puts_done && drained && uploads_done
    }

    /// Stops accepting messages, drains what is pending within `timeout`,
    /// and stops every background thread. Returns true if the queue ended up
    /// empty.
    pub fn close(&self, timeout: Duration) -> bool {
        let _control = self.control.lock();
        if self.lifecycle.state() == StreamerState::Closed {
            return self.queue.is_empty();
        }
        let deadline = Instant::now() + timeout;

        self.lifecycle.transition(StreamerState::Draining);
        let puts_done = self.lifecycle.wait_for_puts(deadline);

        if let Some(batch_manager) = &self.batch_manager {
            batch_manager.stop();
        }
        self.replay.close_within(remaining(deadline));

        let flushed = self.flush_until(deadline, false);
        self.lifecycle.transition(StreamerState::Closed);

        let mut consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in &consumers {
            consumer.signal_stop();
        }
        for consumer in &mut consumers {
            consumer.close();
        }
        self.uploads.close();

        let empty = self.queue.is_empty();
        if !(puts_done && flushed && empty) {
            tracing::warn!(
                remaining = self.queue.size(),
                "Streamer closed before all messages were delivered"
            );
        }
        tracing::info!(stats = ?self.stats.snapshot(), "Streamer closed");
        puts_done && flushed && empty
    }

    pub fn state(&self) -> StreamerState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn has_server_connection(&self) -> bool {
        self.replay.has_server_connection()
    }

    /// Consumer threads that have not exited yet.
    pub fn active_consumers(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|consumer| consumer.is_running())
            .count()
    }

    pub fn replay_manager(&self) -> &ReplayManager {
        &self.replay
    }

    fn is_idle(&self) -> bool {
        let batches_empty = self
            .batch_manager
            .as_ref()
            .is_none_or(|batch_manager| batch_manager.is_empty());
        batches_empty
            && self.queue.is_drained()
            && self.consumers.lock().iter().all(|consumer| consumer.is_idling())
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.lifecycle.state() != StreamerState::Closed {
            self.close(Duration::ZERO);
        }
    }
}

/// Re-enters replayed messages without batching or attachment handling:
/// they are already delivery units with ids. Accepted until fully closed.
fn replay_callback(
    ingress: Weak<Ingress>,
    lifecycle: Arc<Lifecycle>,
    stats: Arc<StreamerStats>,
) -> ReplayCallback {
    Arc::new(move |message: Message| {
        if lifecycle.state() == StreamerState::Closed {
            return Err(ReplayError::Rejected("streamer is closed".to_string()));
        }
        let ingress = ingress
            .upgrade()
            .ok_or_else(|| ReplayError::Rejected("streamer was dropped".to_string()))?;
        ingress.enqueue(message);
        stats.record_replayed();
        Ok(())
    })
}
