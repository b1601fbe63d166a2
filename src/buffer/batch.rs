use crate::domain::{
    BatchPayload, CreateSpanMessage, CreateTraceMessage, ExperimentItemMessage,
    FeedbackScoreMessage, GuardrailItemMessage, Message, MessageType, Payload,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Receives every batch message produced by a flush, in order.
pub type FlushCallback = Arc<dyn Fn(Message) + Send + Sync>;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// Serialized payload budget per outgoing batch. `None` disables
    /// size-aware splitting.
    pub max_payload_mb: Option<f64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            max_payload_mb: None,
        }
    }
}

impl BatchConfig {
    /// Span and trace creation batches carry large free-form payloads.
    pub fn size_limited() -> Self {
        Self {
            max_payload_mb: Some(50.0),
            ..Self::default()
        }
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        self.max_payload_mb.map(|mb| (mb * BYTES_PER_MB) as usize)
    }
}

/// How one batchable message type is folded into its batch container.
pub trait BatchFormat: Send + Sync + 'static {
    type Item: Serialize + Send + 'static;

    /// The incoming message type this format accepts.
    const INPUT: MessageType;

    /// Items carried by an incoming payload; the payload is handed back
    /// untouched when it is not of type `INPUT`.
    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload>;

    fn pack(items: Vec<Self::Item>) -> Payload;
}

pub struct SpanBatch;
pub struct TraceBatch;
pub struct TraceFeedbackBatch;
pub struct SpanFeedbackBatch;
pub struct ThreadFeedbackBatch;
pub struct GuardrailBatch;
pub struct ExperimentItemsBatch;

impl BatchFormat for SpanBatch {
    type Item = CreateSpanMessage;
    const INPUT: MessageType = MessageType::CreateSpan;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::CreateSpan(span) => Ok(vec![span]),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::CreateSpansBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for TraceBatch {
    type Item = CreateTraceMessage;
    const INPUT: MessageType = MessageType::CreateTrace;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::CreateTrace(trace) => Ok(vec![trace]),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::CreateTraceBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for TraceFeedbackBatch {
    type Item = FeedbackScoreMessage;
    const INPUT: MessageType = MessageType::AddTraceFeedbackScoresBatch;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::AddTraceFeedbackScoresBatch(scores) => Ok(scores.batch),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::AddTraceFeedbackScoresBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for SpanFeedbackBatch {
    type Item = FeedbackScoreMessage;
    const INPUT: MessageType = MessageType::AddSpanFeedbackScoresBatch;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::AddSpanFeedbackScoresBatch(scores) => Ok(scores.batch),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::AddSpanFeedbackScoresBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for ThreadFeedbackBatch {
    type Item = FeedbackScoreMessage;
    const INPUT: MessageType = MessageType::AddThreadsFeedbackScoresBatch;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::AddThreadsFeedbackScoresBatch(scores) => Ok(scores.batch),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::AddThreadsFeedbackScoresBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for GuardrailBatch {
    type Item = GuardrailItemMessage;
    const INPUT: MessageType = MessageType::GuardrailBatch;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::GuardrailBatch(items) => Ok(items.batch),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::GuardrailBatch(BatchPayload::new(items))
    }
}

impl BatchFormat for ExperimentItemsBatch {
    type Item = ExperimentItemMessage;
    const INPUT: MessageType = MessageType::CreateExperimentItemsBatch;

    fn unpack(payload: Payload) -> Result<Vec<Self::Item>, Payload> {
        match payload {
            Payload::CreateExperimentItemsBatch(items) => Ok(items.batch),
            other => Err(other),
        }
    }

    fn pack(items: Vec<Self::Item>) -> Payload {
        Payload::CreateExperimentItemsBatch(BatchPayload::new(items))
    }
}

/// Object-safe view of a batcher, used by the batch manager's routing table.
pub trait MessageBatcher: Send + Sync {
    fn message_type(&self) -> MessageType;

    /// Accumulates the message's items. Emits full batches synchronously once
    /// `max_batch_size` is reached; a remainder stays accumulated.
    fn add(&self, message: Message);

    /// Emits everything accumulated and restarts the flush interval.
    fn flush(&self);

    fn is_ready_to_flush(&self) -> bool;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

struct Accumulator<T> {
    items: Vec<T>,
    last_flush: Instant,
}

pub struct Batcher<F: BatchFormat> {
    state: Mutex<Accumulator<F::Item>>,
    config: BatchConfig,
    flush_callback: FlushCallback,
    _format: PhantomData<fn() -> F>,
}

impl<F: BatchFormat> Batcher<F> {
    pub fn new(config: BatchConfig, flush_callback: FlushCallback) -> Self {
        Self {
            state: Mutex::new(Accumulator {
                items: Vec::new(),
                last_flush: Instant::now(),
            }),
            config: BatchConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            flush_callback,
            _format: PhantomData,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    // Called with the accumulator lock held so batches of one type leave in
    // the order they were formed.
    fn emit(&self, items: Vec<F::Item>) {
        let groups = match self.config.max_payload_bytes() {
            Some(max_bytes) => split_by_size(items, max_bytes),
            None => vec![items],
        };
        for group in groups {
            debug!(
                message_type = %F::INPUT,
                items = group.len(),
                "Flushing batch"
            );
            (self.flush_callback)(Message::new(F::pack(group)));
        }
    }
}

impl<F: BatchFormat> MessageBatcher for Batcher<F> {
    fn message_type(&self) -> MessageType {
        F::INPUT
    }

    fn add(&self, message: Message) {
        let items = match F::unpack(message.payload) {
            Ok(items) => items,
            Err(payload) => {
                error!(
                    expected = %F::INPUT,
                    actual = %payload.message_type(),
                    "Message routed to the wrong batcher"
                );
                return;
            }
        };

        let mut state = self.state.lock();
        state.items.extend(items);
        let max = self.config.max_batch_size;
        while state.items.len() >= max {
            let full: Vec<F::Item> = state.items.drain(..max).collect();
            state.last_flush = Instant::now();
            self.emit(full);
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        state.last_flush = Instant::now();
        if state.items.is_empty() {
            return;
        }
        let items = std::mem::take(&mut state.items);
        self.emit(items);
    }

    fn is_ready_to_flush(&self) -> bool {
        self.state.lock().last_flush.elapsed() >= self.config.flush_interval
    }

    fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

/// Partitions `items` into consecutive groups whose summed serialized size
/// stays within `max_bytes`. An item larger than the budget forms a group of
/// its own; nothing is dropped and order is preserved.
pub fn split_by_size<T: Serialize>(items: Vec<T>, max_bytes: usize) -> Vec<Vec<T>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;

    for item in items {
        let size = serialized_size(&item);
        if !current.is_empty() && current_size.saturating_add(size) > max_bytes {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size = current_size.saturating_add(size);
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

pub fn serialized_size<T: Serialize>(item: &T) -> usize {
    serde_json::to_vec(item).map_or(0, |bytes| bytes.len())
}
