use super::health::{ConnectionMonitor, TickOutcome};
use super::store::{MessageStatus, ReplayStore, ReplayStoreError, StoreConfig};
use crate::buffer::StopSignal;
use crate::domain::{Message, MessageId};
use crate::sender::DeliveryTracker;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Replay callback must be set before the replay manager is used")]
    CallbackNotSet,
    #[error("Replayed message refused: {0}")]
    Rejected(String),
    #[error("Replay store error: {0}")]
    Store(#[from] ReplayStoreError),
    #[error("Failed to spawn replay thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Re-injects one replayed message into the pipeline.
pub type ReplayCallback = Arc<dyn Fn(Message) -> Result<(), ReplayError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// How often the background thread ticks the connection monitor.
    pub tick_interval: Duration,
    pub store: StoreConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(300),
            store: StoreConfig::default(),
        }
    }
}

struct ReplayShared {
    store: ReplayStore,
    monitor: ConnectionMonitor,
    next_id: Mutex<MessageId>,
    callback: RwLock<Option<ReplayCallback>>,
    // One replay pass at a time, whether triggered by a tick or by flush.
    replay_pass: Mutex<()>,
    // Set by a bounded close; replay passes stop starting pages after it.
    deadline: Mutex<Option<Instant>>,
}

impl ReplayShared {
    fn replay_failed(&self) -> Result<usize, ReplayError> {
        let callback = self
            .callback
            .read()
            .clone()
            .ok_or(ReplayError::CallbackNotSet)?;
        let _pass = self.replay_pass.lock();
        let replayed = self
            .store
            .replay_failed_messages_until(|| *self.deadline.lock(), |message| callback(message))?;
        Ok(replayed)
    }

    fn tick(&self) {
        if self.monitor.tick() == TickOutcome::ConnectionRestored {
            tracing::info!("Connection restored, replaying failed messages");
            if let Err(e) = self.replay_failed() {
                tracing::error!(error = %e, "Replay after connection restore failed");
            }
            self.monitor.reset();
        }
    }

    fn final_replay(&self) {
        if !self.monitor.has_server_connection() {
            return;
        }
        if self
            .deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            tracing::debug!("No time left for a final replay");
            return;
        }
        match self.replay_failed() {
            Ok(0) => {}
            Ok(replayed) => tracing::debug!(replayed, "Final replay before shutdown"),
            Err(e) => tracing::warn!(error = %e, "Final replay before shutdown failed"),
        }
    }
}

// Closes the store when the replay thread exits, including by panic.
struct CloseStoreOnExit(Arc<ReplayShared>);

impl Drop for CloseStoreOnExit {
    fn drop(&mut self) {
        self.0.store.close();
    }
}

/// Owns the replay store and drives the connection monitor from a
/// background thread, replaying failed messages whenever the connection
/// comes back.
pub struct ReplayManager {
    shared: Arc<ReplayShared>,
    tick_interval: Duration,
    stop: StopSignal,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayManager {
    pub fn new(config: ReplayConfig, monitor: ConnectionMonitor) -> Self {
        Self {
            shared: Arc::new(ReplayShared {
                store: ReplayStore::new(config.store),
                monitor,
                next_id: Mutex::new(0),
                callback: RwLock::new(None),
                replay_pass: Mutex::new(()),
                deadline: Mutex::new(None),
            }),
            tick_interval: config.tick_interval,
            stop: StopSignal::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn set_replay_callback(&self, callback: ReplayCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    pub fn start(&self) -> Result<(), ReplayError> {
        if self.shared.callback.read().is_none() {
            return Err(ReplayError::CallbackNotSet);
        }
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let tick_interval = self.tick_interval;
        let handle = thread::Builder::new()
            .name("replay-manager".to_string())
            .spawn(move || {
                let _guard = CloseStoreOnExit(shared.clone());
                tracing::debug!("Replay manager started");
                while !stop.wait(tick_interval) {
                    shared.tick();
                }
                shared.final_replay();
                tracing::debug!("Replay manager stopped");
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops the background thread. The store is closed on the way out after
    /// one last replay if the connection is believed up.
    pub fn close(&self) {
        self.stop.stop();
        self.join_thread();
    }

    /// Like [`ReplayManager::close`], but any replay still running or about
    /// to run stops starting new pages once `timeout` has elapsed.
    pub fn close_within(&self, timeout: Duration) {
        *self.shared.deadline.lock() = Some(Instant::now() + timeout);
        self.stop.stop();
        self.join_thread();
    }

    fn join_thread(&self) {
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!("Replay manager thread panicked");
                }
            }
            None => self.shared.store.close(),
        }
    }

    /// Assigns an id if the message has none and records it as registered.
    /// If the store refuses, the id is cleared so nothing downstream tries to
    /// update a row that does not exist.
    pub fn register_message(&self, message: &mut Message) -> Result<MessageId, ReplayError> {
        let id = match message.message_id {
            Some(id) => id,
            None => {
                let mut next = self.shared.next_id.lock();
                *next += 1;
                *next
            }
        };
        message.message_id = Some(id);

        match self
            .shared
            .store
            .register_message(message, MessageStatus::Registered)
        {
            Ok(()) => Ok(id),
            Err(e) => {
                message.message_id = None;
                Err(e.into())
            }
        }
    }

    pub fn unregister_message(&self, message_id: MessageId) {
        if let Err(e) = self
            .shared
            .store
            .update_message(message_id, MessageStatus::Delivered)
        {
            tracing::debug!(message_id, error = %e, "Failed to unregister message");
        }
    }

    /// Marks a stored message failed without touching the monitor.
    pub fn mark_failed(&self, message_id: MessageId) {
        if let Err(e) = self
            .shared
            .store
            .update_message(message_id, MessageStatus::Failed)
        {
            tracing::debug!(message_id, error = %e, "Failed to mark message failed");
        }
    }

    /// Replays all failed messages now, independent of the tick schedule.
    pub fn flush(&self) -> Result<usize, ReplayError> {
        self.shared.replay_failed()
    }

    pub fn has_server_connection(&self) -> bool {
        self.shared.monitor.has_server_connection()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.shared.monitor
    }

    pub fn store(&self) -> &ReplayStore {
        &self.shared.store
    }
}

impl DeliveryTracker for ReplayManager {
    fn message_delivered(&self, message_id: Option<MessageId>) {
        self.shared.monitor.connection_succeeded();
        if let Some(id) = message_id {
            self.unregister_message(id);
        }
    }

    fn message_sent_failed(&self, message_id: Option<MessageId>, reason: &str) {
        self.shared.monitor.connection_failed(reason);
        if let Some(id) = message_id {
            self.mark_failed(id);
        }
    }

    fn message_rejected(&self, message_id: Option<MessageId>, reason: &str) {
        // The server answered, so the connection itself is fine.
        self.shared.monitor.connection_succeeded();
        if let Some(id) = message_id {
            tracing::debug!(message_id = id, reason, "Dropping rejected message from replay store");
            self.unregister_message(id);
        }
    }

    fn message_discarded(&self, message_id: Option<MessageId>) {
        if let Some(id) = message_id {
            self.mark_failed(id);
        }
    }
}

impl Drop for ReplayManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchPayload, GuardrailItemMessage, Payload};
    use crate::reliability::health::MonitorConfig;
    use crate::reliability::store::StoreStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guardrail() -> Message {
        Message::new(Payload::GuardrailBatch(BatchPayload::new(vec![
            GuardrailItemMessage {
                project_name: "default".to_string(),
                entity_id: "trace-1".to_string(),
                secondary_id: "span-1".to_string(),
                name: "pii".to_string(),
                result: "passed".to_string(),
                config: json!({"threshold": 0.5}),
                details: json!({}),
            },
        ])))
    }

    fn manager() -> ReplayManager {
        ReplayManager::new(
            ReplayConfig {
                tick_interval: Duration::from_millis(10),
                store: StoreConfig {
                    replay_batch_delay: Duration::ZERO,
                    ..StoreConfig::default()
                },
            },
            ConnectionMonitor::new(MonitorConfig {
                failure_threshold: 3,
                probe_interval: Duration::ZERO,
            }),
        )
    }

    #[test]
    fn test_ids_are_monotonic_and_kept_when_present() {
        let manager = manager();
        let mut first = guardrail();
        let mut second = guardrail();
        assert_eq!(manager.register_message(&mut first).unwrap(), 1);
        assert_eq!(manager.register_message(&mut second).unwrap(), 2);
        assert_eq!(manager.register_message(&mut first).unwrap(), 1);
        manager.close();
    }

    #[test]
    fn test_start_and_flush_require_callback() {
        let manager = manager();
        assert!(matches!(manager.start(), Err(ReplayError::CallbackNotSet)));
        assert!(matches!(manager.flush(), Err(ReplayError::CallbackNotSet)));
    }

    #[test]
    fn test_refused_registration_clears_id() {
        let manager = manager();
        manager.store().close();
        let mut message = guardrail();
        assert!(manager.register_message(&mut message).is_err());
        assert_eq!(message.message_id, None);
    }

    #[test]
    fn test_failed_message_is_replayed_on_flush() {
        let manager = manager();
        let replayed = Arc::new(AtomicUsize::new(0));
        let counter = replayed.clone();
        manager.set_replay_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut message = guardrail();
        let id = manager.register_message(&mut message).unwrap();
        manager.message_sent_failed(Some(id), "503 Service Unavailable");
        assert_eq!(manager.store().failed_count().unwrap(), 1);

        assert_eq!(manager.flush().unwrap(), 1);
        assert_eq!(replayed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.store().failed_count().unwrap(), 0);
    }

    #[test]
    fn test_delivered_and_rejected_rows_are_removed() {
        let manager = manager();
        let mut delivered = guardrail();
        let mut rejected = guardrail();
        let delivered_id = manager.register_message(&mut delivered).unwrap();
        let rejected_id = manager.register_message(&mut rejected).unwrap();

        manager.message_delivered(Some(delivered_id));
        manager.message_rejected(Some(rejected_id), "400 Bad Request");

        assert_eq!(manager.store().message_status(delivered_id).unwrap(), None);
        assert_eq!(manager.store().message_status(rejected_id).unwrap(), None);
    }

    #[test]
    fn test_close_within_bounds_final_replay() {
        let manager = ReplayManager::new(
            ReplayConfig {
                tick_interval: Duration::from_millis(10),
                store: StoreConfig {
                    replay_batch_size: 1,
                    replay_batch_delay: Duration::from_millis(50),
                    ..StoreConfig::default()
                },
            },
            ConnectionMonitor::new(MonitorConfig {
                failure_threshold: 3,
                probe_interval: Duration::ZERO,
            }),
        );
        let replayed = Arc::new(AtomicUsize::new(0));
        let counter = replayed.clone();
        manager.set_replay_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        for _ in 0..40 {
            let mut message = guardrail();
            let id = manager.register_message(&mut message).unwrap();
            manager.message_discarded(Some(id));
        }
        manager.start().unwrap();
        assert!(manager.has_server_connection());

        let started = Instant::now();
        manager.close_within(Duration::from_millis(100));

        // A full pass would take about two seconds of page delays.
        assert!(started.elapsed() < Duration::from_secs(1));
        let replayed = replayed.load(Ordering::SeqCst);
        assert!(replayed > 0);
        assert!(replayed < 40);
        assert_eq!(manager.store().status(), StoreStatus::Closed);
    }

    #[test]
    fn test_close_stops_thread_and_closes_store() {
        let manager = manager();
        manager.set_replay_callback(Arc::new(|_| Ok(())));
        manager.start().unwrap();
        let dir = manager.store().directory().unwrap();

        manager.close();
        assert_eq!(manager.store().status(), StoreStatus::Closed);
        assert!(!dir.exists());
        assert!(manager.thread.lock().is_none());
    }
}
