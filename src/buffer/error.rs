use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Queue empty after waiting {waited:?}")]
    Empty { waited: Duration },
}
