//! Domain layer for trace-streamer.
//!
//! Contains the canonical types shared across all modules:
//! - `Message`: The pipeline's unit of work (envelope + typed `Payload`)
//! - `MessageType`: Stable tag used for persistence and dispatch
//! - `MessageError`: Serialization failures

pub mod error;
pub mod message;

pub use error::MessageError;
pub use message::{
    Attachment, AttachmentEntity, BatchPayload, CreateAttachmentMessage, CreateSpanMessage,
    CreateTraceMessage, ErrorInfo, ExperimentItemMessage, FeedbackScoreMessage,
    GuardrailItemMessage, Message, MessageId, MessageType, Payload, SpanType, UpdateSpanMessage,
    UpdateTraceMessage, new_entity_id,
};
