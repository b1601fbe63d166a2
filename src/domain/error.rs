use thiserror::Error;

/// Failures turning messages into stored or wire form and back.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
