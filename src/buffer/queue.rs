use super::error::QueueError;
use crate::domain::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct QueueState {
    entries: VecDeque<Message>,
    /// Entries handed out by `get` and not yet acknowledged with `task_done`.
    unfinished: usize,
}

/// Bounded FIFO shared by the streamer and its consumers.
///
/// The front of the deque is the "old" end: `get` pops from it and `put_back`
/// pushes onto it. When full, `put` evicts the oldest entry instead of
/// blocking the producer.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    max_length: Option<usize>,
}

impl MessageQueue {
    pub fn new(max_length: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            max_length: max_length.filter(|len| *len > 0),
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Appends at the new end. Returns the entry evicted to make room, if any.
    pub fn put(&self, message: Message) -> Option<Message> {
        let mut state = self.state.lock();
        let discarded = match self.max_length {
            Some(max) if state.entries.len() >= max => state.entries.pop_front(),
            _ => None,
        };
        state.entries.push_back(message);
        self.not_empty.notify_one();
        discarded
    }

    /// Re-inserts at the old end so the entry is the next one handed out.
    ///
    /// Capacity still applies: a full queue evicts its newest entry, keeping
    /// the re-inserted one which has already waited longest.
    pub fn put_back(&self, message: Message) -> Option<Message> {
        let mut state = self.state.lock();
        let discarded = match self.max_length {
            Some(max) if state.entries.len() >= max => state.entries.pop_back(),
            _ => None,
        };
        state.entries.push_front(message);
        self.not_empty.notify_one();
        discarded
    }

    /// Waits up to `timeout` for an entry and removes the oldest one.
    ///
    /// Every successful `get` must be paired with a `task_done` once the
    /// caller is finished with the entry (including after a `put_back`).
    pub fn get(&self, timeout: Duration) -> Result<Message, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(message) = state.entries.pop_front() {
                state.unfinished += 1;
                return Ok(message);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if let Some(message) = state.entries.pop_front() {
                    state.unfinished += 1;
                    return Ok(message);
                }
                return Err(QueueError::Empty { waited: timeout });
            }
        }
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Empty and no consumer still holding an entry it took.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.entries.is_empty() && state.unfinished == 0
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MessageQueue")
            .field("len", &state.entries.len())
            .field("unfinished", &state.unfinished)
            .field("max_length", &self.max_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchPayload, ExperimentItemMessage, Payload};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn numbered(n: usize) -> Message {
        Message::new(Payload::CreateExperimentItemsBatch(BatchPayload::new(vec![
            ExperimentItemMessage {
                id: n.to_string(),
                experiment_id: "exp".to_string(),
                dataset_item_id: "item".to_string(),
                trace_id: "trace".to_string(),
            },
        ])))
    }

    fn number_of(message: &Message) -> usize {
        match &message.payload {
            Payload::CreateExperimentItemsBatch(p) => p.batch[0].id.parse().unwrap(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(None);
        for i in 0..10 {
            assert!(queue.put(numbered(i)).is_none());
        }
        for i in 0..10 {
            let message = queue.get(Duration::from_millis(10)).unwrap();
            assert_eq!(number_of(&message), i);
            queue.task_done();
        }
        assert!(queue.is_drained());
    }

    #[test]
    fn test_get_times_out_on_empty_queue() {
        let queue = MessageQueue::new(None);
        let start = Instant::now();
        let result = queue.get(Duration::from_millis(25));
        assert!(matches!(result, Err(QueueError::Empty { .. })));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_put_wakes_blocked_get() {
        let queue = Arc::new(MessageQueue::new(None));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get(Duration::from_secs(5)).map(|m| number_of(&m)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.put(numbered(42));
        assert_eq!(consumer.join().unwrap().unwrap(), 42);
    }

    #[test]
    fn test_put_back_goes_to_front() {
        let queue = MessageQueue::new(None);
        queue.put(numbered(1));
        queue.put(numbered(2));

        let first = queue.get(Duration::from_millis(10)).unwrap();
        queue.put_back(first);
        queue.task_done();

        assert_eq!(number_of(&queue.get(Duration::from_millis(10)).unwrap()), 1);
    }

    #[test]
    fn test_put_back_on_full_queue_evicts_newest() {
        let queue = MessageQueue::new(Some(2));
        queue.put(numbered(1));
        queue.put(numbered(2));
        let taken = queue.get(Duration::from_millis(10)).unwrap();
        queue.put(numbered(3));

        let evicted = queue.put_back(taken).unwrap();
        assert_eq!(number_of(&evicted), 3);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_taken_entry_keeps_queue_undrained() {
        let queue = MessageQueue::new(None);
        queue.put(numbered(1));
        let _message = queue.get(Duration::from_millis(10)).unwrap();
        assert!(queue.is_empty());
        assert!(!queue.is_drained());
        queue.task_done();
        assert!(queue.is_drained());
    }

    proptest! {
        #[test]
        fn prop_bounded_queue_keeps_most_recent(max in 1usize..20, count in 0usize..60) {
            let queue = MessageQueue::new(Some(max));
            let mut discarded = Vec::new();
            for i in 0..count {
                if let Some(old) = queue.put(numbered(i)) {
                    discarded.push(number_of(&old));
                }
                prop_assert!(queue.size() <= max);
            }

            let kept: Vec<usize> = (0..queue.size())
                .map(|_| number_of(&queue.get(Duration::ZERO).unwrap()))
                .collect();
            let expected_start = count.saturating_sub(max);
            prop_assert_eq!(kept, (expected_start..count).collect::<Vec<_>>());
            prop_assert_eq!(discarded, (0..expected_start).collect::<Vec<_>>());
        }
    }
}
