//! Outbound side of the pipeline.
//!
//! Consumers hand each message to a [`MessageProcessor`] and report the
//! outcome to a [`DeliveryTracker`]. [`HttpMessageProcessor`] is the REST
//! implementation used by the binary.

pub mod http;
pub mod serialization;
pub mod stats;

pub use http::{HttpHealthProbe, HttpMessageProcessor, HttpProcessorConfig, HttpProcessorError};
pub use serialization::{EncodedBody, RequestEncoder, SerializationError};
pub use stats::{StatsSnapshot, StreamerStats};

use crate::domain::{Message, MessageId};
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Outcome of a failed delivery, as seen by consumers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// Server asked us to slow down; retry after the given delay.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Transient failure that outlived the processor's own retries.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Permanent refusal of this payload; retrying will not help.
    #[error("Rejected by server: {0}")]
    Rejected(String),
    /// The entity already exists on the server.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Delivers one message to the backend, blocking the calling thread.
#[cfg_attr(test, automock)]
pub trait MessageProcessor: Send + Sync {
    fn process(&self, message: &Message) -> Result<(), ProcessError>;
}

/// Receives per-message delivery outcomes.
#[cfg_attr(test, automock)]
pub trait DeliveryTracker: Send + Sync {
    fn message_delivered(&self, message_id: Option<MessageId>);

    fn message_sent_failed(&self, message_id: Option<MessageId>, reason: &str);

    fn message_rejected(&self, message_id: Option<MessageId>, reason: &str);

    /// The queue evicted the message before it was attempted.
    fn message_discarded(&self, message_id: Option<MessageId>);
}
