//! In-memory staging between producers and consumers.
//!
//! - `queue`: bounded FIFO with discard-oldest semantics
//! - `batch`: per-type accumulators that fold small messages into batches
//! - `manager`: routing table plus the timed flushing thread
//! - `concurrency`: stop signals and polling helpers for background loops

pub mod batch;
pub mod concurrency;
pub mod error;
pub mod manager;
pub mod queue;

pub use batch::{BatchConfig, BatchFormat, Batcher, FlushCallback, MessageBatcher, split_by_size};
pub use concurrency::{StopSignal, remaining, wait_until};
pub use error::QueueError;
pub use manager::{BatchManager, BatchingConfig, DEFAULT_FLUSH_PROBE_INTERVAL};
pub use queue::MessageQueue;
