use crate::buffer::{MessageQueue, StopSignal};
use crate::domain::Message;
use crate::sender::{DeliveryTracker, MessageProcessor, ProcessError, StreamerStats};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything a consumer thread shares with the rest of the pipeline.
#[derive(Clone)]
pub struct ConsumerContext {
    pub queue: Arc<MessageQueue>,
    pub processor: Arc<dyn MessageProcessor>,
    pub tracker: Arc<dyn DeliveryTracker>,
    pub stats: Arc<StreamerStats>,
    pub probe_interval: Duration,
}

/// State of one consumer loop. Kept apart from the thread so the loop body
/// can be driven step by step.
struct ConsumerLoop {
    ctx: ConsumerContext,
    idling: Arc<AtomicBool>,
    stop: StopSignal,
    // Per-consumer: other consumers keep their own backoff.
    next_message_time: Instant,
}

impl ConsumerLoop {
    fn new(ctx: ConsumerContext, idling: Arc<AtomicBool>, stop: StopSignal) -> Self {
        Self {
            ctx,
            idling,
            stop,
            next_message_time: Instant::now(),
        }
    }

    fn run(mut self) {
        while !self.stop.is_stopped() {
            self.step();
        }
        self.idling.store(true, Ordering::SeqCst);
    }

    fn step(&mut self) {
        let now = Instant::now();
        if now < self.next_message_time {
            let backoff = (self.next_message_time - now).min(self.ctx.probe_interval);
            self.stop.wait(backoff);
            return;
        }

        let Ok(message) = self.ctx.queue.get(self.ctx.probe_interval) else {
            return;
        };
        self.idling.store(false, Ordering::SeqCst);
        let deferred_for = self.handle(message);
        self.ctx.queue.task_done();
        self.idling.store(true, Ordering::SeqCst);

        if let Some(wait) = deferred_for {
            self.stop.wait(wait.min(self.ctx.probe_interval));
        }
    }

    /// Delivers one message. Returns how long to pause when the message was
    /// put back because it is not due yet.
    fn handle(&mut self, mut message: Message) -> Option<Duration> {
        let now = Instant::now();
        if !message.is_deliverable_at(now) {
            let wait = message.delivery_time - now;
            self.put_back(message);
            return Some(wait);
        }

        let message_id = message.message_id;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.ctx.processor.process(&message)))
            .unwrap_or_else(|payload| {
                let reason = format!("message processor panicked: {}", panic_reason(payload.as_ref()));
                error!(
                    message_id,
                    message_type = %message.message_type(),
                    %reason,
                    "Message processor panicked"
                );
                Err(ProcessError::Connection(reason))
            });
        match outcome {
            Ok(()) => {
                self.ctx.tracker.message_delivered(message_id);
                self.ctx.stats.record_delivered();
            }
            Err(ProcessError::Conflict(reason)) => {
                debug!(
                    message_id,
                    message_type = %message.message_type(),
                    %reason,
                    "Message already delivered"
                );
                self.ctx.tracker.message_delivered(message_id);
                self.ctx.stats.record_delivered();
            }
            Err(ProcessError::RateLimited { retry_after }) => {
                let next = now + retry_after;
                self.next_message_time = next;
                message.defer_until(next);
                self.ctx.stats.record_rate_limited();
                info!(
                    message_id,
                    message_type = %message.message_type(),
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Rate limited, deferring message"
                );
                self.put_back(message);
            }
            Err(ProcessError::Rejected(reason)) => {
                error!(
                    message_id,
                    message_type = %message.message_type(),
                    %reason,
                    "Message rejected by server"
                );
                self.ctx.tracker.message_rejected(message_id, &reason);
                self.ctx.stats.record_rejected();
            }
            Err(ProcessError::Connection(reason)) => {
                warn!(
                    message_id,
                    message_type = %message.message_type(),
                    %reason,
                    "Failed to deliver message"
                );
                self.ctx.tracker.message_sent_failed(message_id, &reason);
                self.ctx.stats.record_failed();
            }
        }
        None
    }

    fn put_back(&self, message: Message) {
        if let Some(evicted) = self.ctx.queue.put_back(message) {
            self.ctx.stats.record_discarded();
            self.ctx.tracker.message_discarded(evicted.message_id);
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// A background thread delivering messages from the shared queue.
pub struct QueueConsumer {
    name: String,
    idling: Arc<AtomicBool>,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl QueueConsumer {
    pub fn start(index: usize, ctx: ConsumerContext) -> std::io::Result<Self> {
        let name = format!("queue-consumer-{index}");
        let idling = Arc::new(AtomicBool::new(true));
        let stop = StopSignal::new();
        let consumer_loop = ConsumerLoop::new(ctx, idling.clone(), stop.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || consumer_loop.run())?;
        debug!(consumer = %name, "Queue consumer started");
        Ok(Self {
            name,
            idling,
            stop,
            handle: Some(handle),
        })
    }

    /// True while waiting for work, false while a message is in hand.
    pub fn is_idling(&self) -> bool {
        self.idling.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Asks the thread to stop after its current message.
    pub fn signal_stop(&self) {
        self.stop.stop();
    }

    /// Stops and joins the thread.
    pub fn close(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(consumer = %self.name, "Queue consumer panicked");
            } else {
                debug!(consumer = %self.name, "Queue consumer stopped");
            }
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.close();
    }
}
