use crate::buffer::remaining;
use crate::domain::{Message, MessageError, MessageId};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;

const DB_FILE_NAME: &str = "replay.db";

#[derive(Error, Debug)]
pub enum ReplayStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Message has no id assigned")]
    MissingId,
    #[error("Replay store not available ({0})")]
    NotAvailable(StoreStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Undefined,
    Initialized,
    Closed,
    Error,
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreStatus::Undefined => "undefined",
            StoreStatus::Initialized => "initialized",
            StoreStatus::Closed => "closed",
            StoreStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Delivery status persisted in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageStatus {
    Registered = 0,
    Delivered = 1,
    Failed = 2,
}

impl MessageStatus {
    fn from_column(value: i64) -> Option<Self> {
        match value {
            0 => Some(MessageStatus::Registered),
            1 => Some(MessageStatus::Delivered),
            2 => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory under which the temporary store directory is created.
    /// `None` uses the system temp directory.
    pub base_dir: Option<PathBuf>,
    /// Rows fetched per page during replay.
    pub replay_batch_size: usize,
    /// Pause after each full page during replay.
    pub replay_batch_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            replay_batch_size: 200,
            replay_batch_delay: Duration::from_millis(50),
        }
    }
}

/// One persisted row, decoded lazily.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub message_json: String,
}

impl StoredMessage {
    pub fn decode(&self) -> Result<Message, MessageError> {
        Message::from_record(self.message_id, &self.message_type, &self.message_json)
    }
}

struct StoreInner {
    conn: Option<Connection>,
    dir: Option<TempDir>,
    status: StoreStatus,
}

/// Durable record of every message not yet confirmed delivered.
///
/// Backed by a SQLite file inside a private temporary directory that is
/// removed on `close`. Any storage failure moves the store to
/// `StoreStatus::Error`; from then on writes report `NotAvailable` and reads
/// come back empty, so the pipeline keeps running without replay.
pub struct ReplayStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
    support_warned: AtomicBool,
}

impl ReplayStore {
    pub fn new(config: StoreConfig) -> Self {
        let store = Self {
            inner: Mutex::new(StoreInner {
                conn: None,
                dir: None,
                status: StoreStatus::Undefined,
            }),
            config,
            support_warned: AtomicBool::new(false),
        };
        store.initialize();
        store
    }

    fn initialize(&self) {
        let mut inner = self.inner.lock();
        match Self::open(&self.config) {
            Ok((dir, conn)) => {
                tracing::debug!(path = %dir.path().display(), "Replay store initialized");
                inner.conn = Some(conn);
                inner.dir = Some(dir);
                inner.status = StoreStatus::Initialized;
            }
            Err(e) => {
                self.mark_failed(&mut inner, &e);
            }
        }
    }

    fn open(config: &StoreConfig) -> Result<(TempDir, Connection), ReplayStoreError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("trace-streamer-replay-");
        let dir = match &config.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        let conn = Connection::open(dir.path().join(DB_FILE_NAME))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS messages (
                message_id INTEGER PRIMARY KEY,
                status INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                message_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages (status, message_id);
        ",
        )?;
        Ok((dir, conn))
    }

    fn mark_failed(&self, inner: &mut StoreInner, error: &ReplayStoreError) {
        inner.status = StoreStatus::Error;
        if !self.support_warned.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                error = %error,
                "Local replay store failed; failed messages will not be retried for the rest of \
                 this process. If this keeps happening, please contact support"
            );
        } else {
            tracing::debug!(error = %error, "Replay store operation failed");
        }
    }

    /// Runs `op` against the open connection. `Ok(None)` means the store is
    /// not initialized and nothing was attempted.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, ReplayStoreError>,
    ) -> Result<Option<T>, ReplayStoreError> {
        let mut inner = self.inner.lock();
        if inner.status != StoreStatus::Initialized {
            return Ok(None);
        }
        let Some(conn) = inner.conn.as_mut() else {
            return Ok(None);
        };
        match op(conn) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.mark_failed(&mut inner, &e);
                Err(e)
            }
        }
    }

    pub fn status(&self) -> StoreStatus {
        self.inner.lock().status
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == StoreStatus::Initialized
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persists the message. Re-registering an existing id replaces the row.
    pub fn register_message(
        &self,
        message: &Message,
        status: MessageStatus,
    ) -> Result<(), ReplayStoreError> {
        let row = encode(message)?;
        let written = self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages (message_id, status, message_type, message_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.0, status as i64, row.1, row.2],
            )?;
            Ok(())
        })?;
        written.ok_or_else(|| ReplayStoreError::NotAvailable(self.status()))
    }

    pub fn register_messages(
        &self,
        messages: &[Message],
        status: MessageStatus,
    ) -> Result<(), ReplayStoreError> {
        let rows = messages
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()?;
        let written = self.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO messages (message_id, status, message_type, message_json)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (id, message_type, json) in &rows {
                    stmt.execute(params![id, status as i64, message_type, json])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        written.ok_or_else(|| ReplayStoreError::NotAvailable(self.status()))
    }

    /// `Delivered` removes the row; any other status is written in place.
    pub fn update_message(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<(), ReplayStoreError> {
        self.update_messages_batch(&[message_id], status)
    }

    pub fn update_messages_batch(
        &self,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<(), ReplayStoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = if status == MessageStatus::Delivered {
                    tx.prepare_cached("DELETE FROM messages WHERE message_id = ?1")?
                } else {
                    tx.prepare_cached("UPDATE messages SET status = ?2 WHERE message_id = ?1")?
                };
                for id in message_ids {
                    if status == MessageStatus::Delivered {
                        stmt.execute(params![id])?;
                    } else {
                        stmt.execute(params![id, status as i64])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn message_status(
        &self,
        message_id: MessageId,
    ) -> Result<Option<MessageStatus>, ReplayStoreError> {
        let status = self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached("SELECT status FROM messages WHERE message_id = ?1")?;
            let result = stmt.query_row(params![message_id], |row| row.get::<_, i64>(0));
            match result {
                Ok(value) => Ok(MessageStatus::from_column(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })?;
        Ok(status.flatten())
    }

    pub fn failed_count(&self) -> Result<usize, ReplayStoreError> {
        self.count_with_status(MessageStatus::Failed)
    }

    pub fn count_with_status(&self, status: MessageStatus) -> Result<usize, ReplayStoreError> {
        let count = self.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE status = ?1",
                params![status as i64],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })?;
        Ok(count.unwrap_or(0))
    }

    fn fetch_failed_after(
        &self,
        last_seen: MessageId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, ReplayStoreError> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT message_id, message_type, message_json FROM messages
                 WHERE status = ?1 AND message_id > ?2
                 ORDER BY message_id ASC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![MessageStatus::Failed as i64, last_seen, limit as i64],
                    |row| {
                        Ok(StoredMessage {
                            message_id: row.get(0)?,
                            message_type: row.get(1)?,
                            message_json: row.get(2)?,
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.unwrap_or_default())
    }

    /// Pages through failed rows in ascending id order, one query per page.
    pub fn fetch_failed_messages_batched(&self, batch_size: usize) -> FailedMessages<'_> {
        FailedMessages {
            store: self,
            last_seen: MessageId::MIN,
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }

    /// Hands every failed message to `callback`, page by page. Rows are
    /// marked `Registered` before their page is replayed; a row whose
    /// callback fails is marked `Failed` again and the pass continues.
    /// Returns the number of messages replayed successfully.
    pub fn replay_failed_messages<F, E>(&self, callback: F) -> Result<usize, ReplayStoreError>
    where
        F: FnMut(Message) -> Result<(), E>,
        E: fmt::Display,
    {
        self.replay_failed_messages_until(|| None, callback)
    }

    /// Like [`ReplayStore::replay_failed_messages`], but no new page is
    /// started once the deadline has passed. `deadline` is read before every
    /// page, so it may be set while the pass runs. Rows on pages not reached
    /// stay `Failed`.
    pub fn replay_failed_messages_until<D, F, E>(
        &self,
        deadline: D,
        mut callback: F,
    ) -> Result<usize, ReplayStoreError>
    where
        D: Fn() -> Option<Instant>,
        F: FnMut(Message) -> Result<(), E>,
        E: fmt::Display,
    {
        if !self.is_initialized() {
            return Ok(0);
        }

        let expired = || deadline().is_some_and(|deadline| Instant::now() >= deadline);
        let batch_size = self.config.replay_batch_size.max(1);
        let mut replayed = 0;
        for page in self.fetch_failed_messages_batched(batch_size) {
            if expired() {
                tracing::debug!(replayed, "Replay deadline reached, leaving remaining rows failed");
                break;
            }
            let ids: Vec<MessageId> = page.iter().map(|row| row.message_id).collect();
            self.update_messages_batch(&ids, MessageStatus::Registered)?;

            let full_page = page.len() >= batch_size;
            for row in page {
                let outcome = row
                    .decode()
                    .map_err(|e| e.to_string())
                    .and_then(|message| callback(message).map_err(|e| e.to_string()));
                match outcome {
                    Ok(()) => replayed += 1,
                    Err(reason) => {
                        tracing::warn!(
                            message_id = row.message_id,
                            message_type = %row.message_type,
                            %reason,
                            "Failed to replay message"
                        );
                        self.update_message(row.message_id, MessageStatus::Failed)?;
                    }
                }
            }

            if full_page && !self.config.replay_batch_delay.is_zero() {
                let delay = match deadline() {
                    Some(deadline) => self.config.replay_batch_delay.min(remaining(deadline)),
                    None => self.config.replay_batch_delay,
                };
                std::thread::sleep(delay);
            }
        }

        if replayed > 0 {
            tracing::info!(replayed, "Replayed failed messages");
        }
        Ok(replayed)
    }

    /// Closes the connection and removes the store directory. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.status == StoreStatus::Closed {
            return;
        }
        if let Some(conn) = inner.conn.take()
            && let Err((_, e)) = conn.close()
        {
            tracing::debug!(error = %e, "Error closing replay store connection");
        }
        if let Some(dir) = inner.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove replay store directory");
            }
        }
        inner.status = StoreStatus::Closed;
        tracing::debug!("Replay store closed");
    }

    /// Path of the store directory while it exists.
    pub fn directory(&self) -> Option<PathBuf> {
        self.inner.lock().dir.as_ref().map(|dir| dir.path().to_path_buf())
    }
}

impl Drop for ReplayStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ReplayStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayStore")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

fn encode(message: &Message) -> Result<(MessageId, String, String), ReplayStoreError> {
    let id = message.message_id.ok_or(ReplayStoreError::MissingId)?;
    Ok((id, message.message_type().to_string(), message.to_json()?))
}

/// Lazy page iterator returned by [`ReplayStore::fetch_failed_messages_batched`].
pub struct FailedMessages<'a> {
    store: &'a ReplayStore,
    last_seen: MessageId,
    batch_size: usize,
    exhausted: bool,
}

impl Iterator for FailedMessages<'_> {
    type Item = Vec<StoredMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let page = match self.store.fetch_failed_after(self.last_seen, self.batch_size) {
            Ok(page) => page,
            Err(e) => {
                tracing::debug!(error = %e, "Stopping failed-message scan");
                Vec::new()
            }
        };
        if page.len() < self.batch_size {
            self.exhausted = true;
        }
        let last = page.last()?;
        self.last_seen = last.message_id;
        Some(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchPayload, FeedbackScoreMessage, Payload};

    fn store() -> ReplayStore {
        ReplayStore::new(StoreConfig {
            replay_batch_size: 3,
            replay_batch_delay: Duration::ZERO,
            ..StoreConfig::default()
        })
    }

    fn message(id: MessageId) -> Message {
        let mut message = Message::new(Payload::AddTraceFeedbackScoresBatch(BatchPayload::new(
            vec![FeedbackScoreMessage {
                id: format!("trace-{id}"),
                project_name: "default".to_string(),
                name: "relevance".to_string(),
                value: 0.9,
                source: "sdk".to_string(),
                reason: Some("looks right".to_string()),
                category_name: None,
            }],
        )));
        message.message_id = Some(id);
        message
    }

    #[test]
    fn test_register_and_deliver_removes_row() {
        let store = store();
        assert_eq!(store.status(), StoreStatus::Initialized);

        store.register_message(&message(1), MessageStatus::Registered).unwrap();
        assert_eq!(store.message_status(1).unwrap(), Some(MessageStatus::Registered));

        store.update_message(1, MessageStatus::Delivered).unwrap();
        assert_eq!(store.message_status(1).unwrap(), None);
    }

    #[test]
    fn test_register_without_id_is_rejected() {
        let store = store();
        let mut unassigned = message(1);
        unassigned.message_id = None;
        assert!(matches!(
            store.register_message(&unassigned, MessageStatus::Registered),
            Err(ReplayStoreError::MissingId)
        ));
    }

    #[test]
    fn test_reregistration_replaces_row() {
        let store = store();
        store.register_message(&message(7), MessageStatus::Failed).unwrap();
        store.register_message(&message(7), MessageStatus::Registered).unwrap();
        assert_eq!(store.message_status(7).unwrap(), Some(MessageStatus::Registered));
        assert_eq!(store.failed_count().unwrap(), 0);
    }

    #[test]
    fn test_fetch_pages_in_id_order() {
        let store = store();
        let messages: Vec<Message> = (1..=7).map(message).collect();
        store.register_messages(&messages, MessageStatus::Failed).unwrap();
        store.update_message(4, MessageStatus::Registered).unwrap();

        let pages: Vec<Vec<MessageId>> = store
            .fetch_failed_messages_batched(3)
            .map(|page| page.into_iter().map(|row| row.message_id).collect())
            .collect();
        assert_eq!(pages, vec![vec![1, 2, 3], vec![5, 6, 7]]);
    }

    #[test]
    fn test_replay_continues_after_callback_error() {
        let store = store();
        let messages: Vec<Message> = (1..=5).map(message).collect();
        store.register_messages(&messages, MessageStatus::Failed).unwrap();

        let mut seen = Vec::new();
        let replayed = store
            .replay_failed_messages(|m| {
                let id = m.message_id.unwrap_or_default();
                seen.push(id);
                if id == 2 { Err("downstream refused") } else { Ok(()) }
            })
            .unwrap();

        assert_eq!(replayed, 4);
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.message_status(2).unwrap(), Some(MessageStatus::Failed));
        assert_eq!(store.message_status(3).unwrap(), Some(MessageStatus::Registered));
        assert_eq!(store.failed_count().unwrap(), 1);
    }

    #[test]
    fn test_replay_stops_between_pages_at_deadline() {
        let store = ReplayStore::new(StoreConfig {
            replay_batch_size: 3,
            replay_batch_delay: Duration::from_secs(5),
            ..StoreConfig::default()
        });
        let messages: Vec<Message> = (1..=7).map(message).collect();
        store.register_messages(&messages, MessageStatus::Failed).unwrap();

        let started = Instant::now();
        let replayed = store
            .replay_failed_messages_until(
                || Some(started + Duration::from_millis(50)),
                |_| Ok::<(), String>(()),
            )
            .unwrap();

        // The page delay is cut short and the second page is never started.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(replayed, 3);
        assert_eq!(store.failed_count().unwrap(), 4);
        assert_eq!(store.message_status(4).unwrap(), Some(MessageStatus::Failed));
    }

    #[test]
    fn test_replay_with_expired_deadline_touches_nothing() {
        let store = store();
        let messages: Vec<Message> = (1..=2).map(message).collect();
        store.register_messages(&messages, MessageStatus::Failed).unwrap();

        let replayed = store
            .replay_failed_messages_until(|| Some(Instant::now()), |_| Ok::<(), String>(()))
            .unwrap();
        assert_eq!(replayed, 0);
        assert_eq!(store.failed_count().unwrap(), 2);
    }

    #[test]
    fn test_close_removes_directory_and_disables_store() {
        let store = store();
        let dir = store.directory().unwrap();
        assert!(dir.exists());

        store.close();
        assert_eq!(store.status(), StoreStatus::Closed);
        assert!(!dir.exists());
        assert!(matches!(
            store.register_message(&message(1), MessageStatus::Registered),
            Err(ReplayStoreError::NotAvailable(StoreStatus::Closed))
        ));
        assert!(store.update_message(1, MessageStatus::Failed).is_ok());
        assert_eq!(store.fetch_failed_messages_batched(10).count(), 0);
        assert_eq!(store.replay_failed_messages(|_| Ok::<(), String>(())).unwrap(), 0);
    }

    #[test]
    fn test_unusable_base_dir_puts_store_in_error_state() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = ReplayStore::new(StoreConfig {
            base_dir: Some(file.path().join("nested")),
            ..StoreConfig::default()
        });
        assert_eq!(store.status(), StoreStatus::Error);
        assert!(store.register_message(&message(1), MessageStatus::Registered).is_err());
        assert_eq!(store.failed_count().unwrap(), 0);
    }
}
