use crate::domain::{Message, Payload};
use flate2::{Compression, write::GzEncoder};
use reqwest::Method;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use thiserror::Error;

/// Bodies at or above this many bytes are gzip-compressed by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("No REST endpoint for message type {0}")]
    Unsupported(String),
}

/// A fully prepared request for one message.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
    pub gzipped: bool,
}

/// Maps messages onto the REST API: method, path and JSON body.
#[derive(Debug, Clone)]
pub struct RequestEncoder {
    compression_threshold: Option<usize>,
}

impl Default for RequestEncoder {
    fn default() -> Self {
        Self::new(Some(DEFAULT_COMPRESSION_THRESHOLD))
    }
}

impl RequestEncoder {
    /// `None` disables compression.
    pub fn new(compression_threshold: Option<usize>) -> Self {
        Self {
            compression_threshold,
        }
    }

    pub fn encode(&self, message: &Message) -> Result<EncodedBody, SerializationError> {
        let (method, path, body) = match &message.payload {
            Payload::CreateTrace(trace) => (Method::POST, "/v1/private/traces".to_string(), to_vec(trace)?),
            Payload::UpdateTrace(update) => (
                Method::PATCH,
                format!("/v1/private/traces/{}", update.trace_id),
                to_vec(update)?,
            ),
            Payload::CreateSpan(span) => (Method::POST, "/v1/private/spans".to_string(), to_vec(span)?),
            Payload::UpdateSpan(update) => (
                Method::PATCH,
                format!("/v1/private/spans/{}", update.span_id),
                to_vec(update)?,
            ),
            Payload::CreateSpansBatch(batch) => (
                Method::POST,
                "/v1/private/spans/batch".to_string(),
                to_vec(&json!({ "spans": batch.batch }))?,
            ),
            Payload::CreateTraceBatch(batch) => (
                Method::POST,
                "/v1/private/traces/batch".to_string(),
                to_vec(&json!({ "traces": batch.batch }))?,
            ),
            Payload::AddTraceFeedbackScoresBatch(scores) => (
                Method::PUT,
                "/v1/private/traces/feedback-scores".to_string(),
                to_vec(&json!({ "scores": scores.batch }))?,
            ),
            Payload::AddSpanFeedbackScoresBatch(scores) => (
                Method::PUT,
                "/v1/private/spans/feedback-scores".to_string(),
                to_vec(&json!({ "scores": scores.batch }))?,
            ),
            Payload::AddThreadsFeedbackScoresBatch(scores) => (
                Method::PUT,
                "/v1/private/traces/threads/feedback-scores".to_string(),
                to_vec(&json!({ "scores": scores.batch }))?,
            ),
            Payload::GuardrailBatch(guardrails) => (
                Method::POST,
                "/v1/private/guardrails".to_string(),
                to_vec(&json!({ "guardrails": guardrails.batch }))?,
            ),
            Payload::CreateExperimentItemsBatch(items) => (
                Method::POST,
                "/v1/private/experiments/items".to_string(),
                to_vec(&json!({ "experiment_items": items.batch }))?,
            ),
            Payload::CreateAttachment(_) => {
                return Err(SerializationError::Unsupported(
                    message.message_type().to_string(),
                ));
            }
        };

        match self.compression_threshold {
            Some(threshold) if body.len() >= threshold => Ok(EncodedBody {
                method,
                path,
                body: gzip(&body)?,
                gzipped: true,
            }),
            _ => Ok(EncodedBody {
                method,
                path,
                body,
                gzipped: false,
            }),
        }
    }
}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    Ok(serde_json::to_vec(value)?)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AttachmentEntity, BatchPayload, CreateAttachmentMessage, ExperimentItemMessage,
    };
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn experiment_items(count: usize) -> Message {
        Message::new(Payload::CreateExperimentItemsBatch(BatchPayload::new(
            (0..count)
                .map(|n| ExperimentItemMessage {
                    id: format!("item-{n}"),
                    experiment_id: "exp-1".to_string(),
                    dataset_item_id: format!("dataset-{n}"),
                    trace_id: format!("trace-{n}"),
                })
                .collect(),
        )))
    }

    #[test]
    fn test_batch_body_is_wrapped_under_collection_key() {
        let encoded = RequestEncoder::new(None).encode(&experiment_items(2)).unwrap();
        assert_eq!(encoded.method, Method::POST);
        assert_eq!(encoded.path, "/v1/private/experiments/items");
        assert!(!encoded.gzipped);

        let body: serde_json::Value = serde_json::from_slice(&encoded.body).unwrap();
        assert_eq!(body["experiment_items"].as_array().unwrap().len(), 2);
        assert_eq!(body["experiment_items"][1]["id"], "item-1");
    }

    #[test]
    fn test_large_body_is_gzipped() {
        let encoder = RequestEncoder::new(Some(256));
        let encoded = encoder.encode(&experiment_items(50)).unwrap();
        assert!(encoded.gzipped);

        let mut decoded = String::new();
        GzDecoder::new(encoded.body.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.starts_with("{\"experiment_items\":["));
    }

    #[test]
    fn test_attachments_have_no_rest_endpoint() {
        let message = Message::new(Payload::CreateAttachment(CreateAttachmentMessage {
            file_path: "/tmp/image.png".to_string(),
            file_name: "image.png".to_string(),
            mime_type: Some("image/png".to_string()),
            entity_type: AttachmentEntity::Span,
            entity_id: "span-1".to_string(),
            project_name: "default".to_string(),
            delete_after_upload: false,
        }));
        assert!(matches!(
            RequestEncoder::default().encode(&message),
            Err(SerializationError::Unsupported(_))
        ));
    }
}
