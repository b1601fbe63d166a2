use crate::buffer::MessageQueue;
use crate::domain::Message;
use crate::reliability::ReplayManager;
use crate::sender::{DeliveryTracker, StreamerStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Last step before the queue: register for replay, then enqueue.
pub(crate) struct Ingress {
    queue: Arc<MessageQueue>,
    replay: Arc<ReplayManager>,
    stats: Arc<StreamerStats>,
    discard_warned: AtomicBool,
}

impl Ingress {
    pub(crate) fn new(
        queue: Arc<MessageQueue>,
        replay: Arc<ReplayManager>,
        stats: Arc<StreamerStats>,
    ) -> Self {
        Self {
            queue,
            replay,
            stats,
            discard_warned: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, mut message: Message) {
        if let Err(e) = self.replay.register_message(&mut message) {
            tracing::debug!(
                message_type = %message.message_type(),
                error = %e,
                "Message not registered for replay"
            );
        }

        if let Some(discarded) = self.queue.put(message) {
            self.stats.record_discarded();
            if !self.discard_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    max_length = self.queue.max_length(),
                    "Message queue is full, discarding oldest messages; \
                     registered messages will be replayed later"
                );
            }
            self.replay.message_discarded(discarded.message_id);
        }
    }
}
