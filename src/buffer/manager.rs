use super::batch::{
    BatchConfig, Batcher, ExperimentItemsBatch, FlushCallback, GuardrailBatch, MessageBatcher,
    SpanBatch, SpanFeedbackBatch, ThreadFeedbackBatch, TraceBatch, TraceFeedbackBatch,
};
use super::concurrency::StopSignal;
use crate::domain::{Message, MessageType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

pub const DEFAULT_FLUSH_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-type batching settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingConfig {
    pub spans: BatchConfig,
    pub traces: BatchConfig,
    pub feedback_scores: BatchConfig,
    pub guardrails: BatchConfig,
    pub experiment_items: BatchConfig,
    /// How often the flushing thread checks batchers for an elapsed interval.
    pub probe_interval: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            spans: BatchConfig::size_limited(),
            traces: BatchConfig::size_limited(),
            feedback_scores: BatchConfig::default(),
            guardrails: BatchConfig::default(),
            experiment_items: BatchConfig::default(),
            probe_interval: DEFAULT_FLUSH_PROBE_INTERVAL,
        }
    }
}

type BatcherTable = HashMap<MessageType, Arc<dyn MessageBatcher>>;

/// Routes batchable messages to their accumulator and flushes them on a timer.
pub struct BatchManager {
    batchers: Arc<BatcherTable>,
    probe_interval: Duration,
    flushing_thread: Mutex<Option<FlushingThread>>,
}

impl BatchManager {
    pub fn new(config: BatchingConfig, flush_callback: FlushCallback) -> Self {
        let mut batchers: BatcherTable = HashMap::new();
        let mut insert = |batcher: Arc<dyn MessageBatcher>| {
            batchers.insert(batcher.message_type(), batcher);
        };

        insert(Arc::new(Batcher::<SpanBatch>::new(
            config.spans.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<TraceBatch>::new(
            config.traces.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<TraceFeedbackBatch>::new(
            config.feedback_scores.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<SpanFeedbackBatch>::new(
            config.feedback_scores.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<ThreadFeedbackBatch>::new(
            config.feedback_scores.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<GuardrailBatch>::new(
            config.guardrails.clone(),
            flush_callback.clone(),
        )));
        insert(Arc::new(Batcher::<ExperimentItemsBatch>::new(
            config.experiment_items,
            flush_callback,
        )));

        Self {
            batchers: Arc::new(batchers),
            probe_interval: config.probe_interval,
            flushing_thread: Mutex::new(None),
        }
    }

    /// Starts the flushing thread. Calling it twice is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut slot = self.flushing_thread.lock();
        if slot.is_none() {
            *slot = Some(FlushingThread::spawn(
                self.batchers.clone(),
                self.probe_interval,
            )?);
        }
        Ok(())
    }

    /// Halts the flushing thread, then flushes every batcher.
    pub fn stop(&self) {
        if let Some(thread) = self.flushing_thread.lock().take() {
            thread.stop();
        }
        self.flush();
    }

    pub fn flush(&self) {
        for batcher in self.batchers.values() {
            batcher.flush();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batchers.values().all(|batcher| batcher.is_empty())
    }

    pub fn message_supports_batching(&self, message: &Message) -> bool {
        self.batchers.contains_key(&message.message_type())
    }

    /// Hands batchable messages to their batcher and returns `None`; any other
    /// message is returned to the caller untouched.
    pub fn process_message(&self, message: Message) -> Option<Message> {
        match self.batchers.get(&message.message_type()) {
            Some(batcher) => {
                batcher.add(message);
                None
            }
            None => Some(message),
        }
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        if let Some(thread) = self.flushing_thread.get_mut().take() {
            thread.stop();
        }
    }
}

struct FlushingThread {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

impl FlushingThread {
    fn spawn(batchers: Arc<BatcherTable>, probe_interval: Duration) -> std::io::Result<Self> {
        let stop = StopSignal::new();
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name("batch-flusher".to_string())
            .spawn(move || {
                debug!("Batch flushing thread started");
                while !signal.wait(probe_interval) {
                    for batcher in batchers.values() {
                        if batcher.is_ready_to_flush() {
                            batcher.flush();
                        }
                    }
                }
                debug!("Batch flushing thread stopped");
            })?;
        info!(
            probe_interval_ms = u64::try_from(probe_interval.as_millis()).unwrap_or(u64::MAX),
            "Batching enabled"
        );
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.stop();
        if self.handle.join().is_err() {
            error!("Batch flushing thread panicked");
        }
    }
}
