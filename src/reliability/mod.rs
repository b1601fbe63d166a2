//! Delivery guarantees: connection tracking, the durable replay store, the
//! replay loop that re-injects failed messages, and backoff for transient
//! failures.

pub mod health;
pub mod replay;
pub mod retry;
pub mod store;

pub use health::{ConnectionMonitor, ConnectionProbe, ConnectionState, MonitorConfig, TickOutcome};
pub use replay::{ReplayCallback, ReplayConfig, ReplayError, ReplayManager};
pub use retry::{RetryConfig, RetryError, RetryManager, RetryStrategy};
pub use store::{
    FailedMessages, MessageStatus, ReplayStore, ReplayStoreError, StoreConfig, StoreStatus,
    StoredMessage,
};
