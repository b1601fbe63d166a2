use super::error::MessageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Replay-store primary key. Assigned by the replay manager, never by callers.
pub type MessageId = i64;

/// Stable tag for every message kind. The string form is persisted in the
/// replay store and must not change between versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    CreateTrace,
    UpdateTrace,
    CreateSpan,
    UpdateSpan,
    AddTraceFeedbackScoresBatch,
    AddSpanFeedbackScoresBatch,
    AddThreadsFeedbackScoresBatch,
    CreateSpansBatch,
    CreateTraceBatch,
    GuardrailBatch,
    CreateExperimentItemsBatch,
    CreateAttachment,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::CreateTrace,
        MessageType::UpdateTrace,
        MessageType::CreateSpan,
        MessageType::UpdateSpan,
        MessageType::AddTraceFeedbackScoresBatch,
        MessageType::AddSpanFeedbackScoresBatch,
        MessageType::AddThreadsFeedbackScoresBatch,
        MessageType::CreateSpansBatch,
        MessageType::CreateTraceBatch,
        MessageType::GuardrailBatch,
        MessageType::CreateExperimentItemsBatch,
        MessageType::CreateAttachment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::CreateTrace => "create_trace",
            MessageType::UpdateTrace => "update_trace",
            MessageType::CreateSpan => "create_span",
            MessageType::UpdateSpan => "update_span",
            MessageType::AddTraceFeedbackScoresBatch => "add_trace_feedback_scores_batch",
            MessageType::AddSpanFeedbackScoresBatch => "add_span_feedback_scores_batch",
            MessageType::AddThreadsFeedbackScoresBatch => "add_threads_feedback_scores_batch",
            MessageType::CreateSpansBatch => "create_spans_batch",
            MessageType::CreateTraceBatch => "create_trace_batch",
            MessageType::GuardrailBatch => "guardrail_batch",
            MessageType::CreateExperimentItemsBatch => "create_experiment_items_batch",
            MessageType::CreateAttachment => "create_attachment",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MessageError::UnknownType(s.to_string()))
    }
}

/// Generates an id for a new trace, span or score.
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub exception_type: String,
    pub message: Option<String>,
    pub traceback: String,
}

/// A file attached to a trace or span. Uploaded out of band, never inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_path: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    #[default]
    General,
    Tool,
    Llm,
    Guardrail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEntity {
    Trace,
    Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTraceMessage {
    pub trace_id: String,
    pub project_name: String,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub error_info: Option<ErrorInfo>,
    pub thread_id: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTraceMessage {
    pub trace_id: String,
    pub project_name: String,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub error_info: Option<ErrorInfo>,
    pub thread_id: Option<String>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpanMessage {
    pub span_id: String,
    pub trace_id: String,
    pub project_name: String,
    pub parent_span_id: Option<String>,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    #[serde(rename = "type", default)]
    pub span_type: SpanType,
    pub usage: Option<Value>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub total_cost: Option<f64>,
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpanMessage {
    pub span_id: String,
    pub trace_id: String,
    pub project_name: String,
    pub parent_span_id: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub usage: Option<Value>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub total_cost: Option<f64>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

/// One score; `id` is the trace, span or thread the score belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackScoreMessage {
    pub id: String,
    pub project_name: String,
    pub name: String,
    pub value: f64,
    pub source: String,
    pub reason: Option<String>,
    pub category_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailItemMessage {
    pub project_name: String,
    pub entity_id: String,
    pub secondary_id: String,
    pub name: String,
    pub result: String,
    pub config: Value,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentItemMessage {
    pub id: String,
    pub experiment_id: String,
    pub dataset_item_id: String,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAttachmentMessage {
    pub file_path: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub entity_type: AttachmentEntity,
    pub entity_id: String,
    pub project_name: String,
    #[serde(default)]
    pub delete_after_upload: bool,
}

/// Container for homogeneous items sent in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload<T> {
    pub batch: Vec<T>,
}

impl<T> BatchPayload<T> {
    pub fn new(batch: Vec<T>) -> Self {
        Self { batch }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Type-specific body of a message. The adjacent tagging is the NDJSON
/// input format accepted by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    CreateTrace(CreateTraceMessage),
    UpdateTrace(UpdateTraceMessage),
    CreateSpan(CreateSpanMessage),
    UpdateSpan(UpdateSpanMessage),
    AddTraceFeedbackScoresBatch(BatchPayload<FeedbackScoreMessage>),
    AddSpanFeedbackScoresBatch(BatchPayload<FeedbackScoreMessage>),
    AddThreadsFeedbackScoresBatch(BatchPayload<FeedbackScoreMessage>),
    CreateSpansBatch(BatchPayload<CreateSpanMessage>),
    CreateTraceBatch(BatchPayload<CreateTraceMessage>),
    GuardrailBatch(BatchPayload<GuardrailItemMessage>),
    CreateExperimentItemsBatch(BatchPayload<ExperimentItemMessage>),
    CreateAttachment(CreateAttachmentMessage),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::CreateTrace(_) => MessageType::CreateTrace,
            Payload::UpdateTrace(_) => MessageType::UpdateTrace,
            Payload::CreateSpan(_) => MessageType::CreateSpan,
            Payload::UpdateSpan(_) => MessageType::UpdateSpan,
            Payload::AddTraceFeedbackScoresBatch(_) => MessageType::AddTraceFeedbackScoresBatch,
            Payload::AddSpanFeedbackScoresBatch(_) => MessageType::AddSpanFeedbackScoresBatch,
            Payload::AddThreadsFeedbackScoresBatch(_) => MessageType::AddThreadsFeedbackScoresBatch,
            Payload::CreateSpansBatch(_) => MessageType::CreateSpansBatch,
            Payload::CreateTraceBatch(_) => MessageType::CreateTraceBatch,
            Payload::GuardrailBatch(_) => MessageType::GuardrailBatch,
            Payload::CreateExperimentItemsBatch(_) => MessageType::CreateExperimentItemsBatch,
            Payload::CreateAttachment(_) => MessageType::CreateAttachment,
        }
    }

    /// Serializes the body alone, without the type tag.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let json = match self {
            Payload::CreateTrace(p) => serde_json::to_string(p),
            Payload::UpdateTrace(p) => serde_json::to_string(p),
            Payload::CreateSpan(p) => serde_json::to_string(p),
            Payload::UpdateSpan(p) => serde_json::to_string(p),
            Payload::AddTraceFeedbackScoresBatch(p)
            | Payload::AddSpanFeedbackScoresBatch(p)
            | Payload::AddThreadsFeedbackScoresBatch(p) => serde_json::to_string(p),
            Payload::CreateSpansBatch(p) => serde_json::to_string(p),
            Payload::CreateTraceBatch(p) => serde_json::to_string(p),
            Payload::GuardrailBatch(p) => serde_json::to_string(p),
            Payload::CreateExperimentItemsBatch(p) => serde_json::to_string(p),
            Payload::CreateAttachment(p) => serde_json::to_string(p),
        }?;
        Ok(json)
    }

    /// Inverse of [`Payload::to_json`], dispatched on the stored type tag.
    pub fn from_json(message_type: MessageType, json: &str) -> Result<Self, MessageError> {
        let payload = match message_type {
            MessageType::CreateTrace => Payload::CreateTrace(serde_json::from_str(json)?),
            MessageType::UpdateTrace => Payload::UpdateTrace(serde_json::from_str(json)?),
            MessageType::CreateSpan => Payload::CreateSpan(serde_json::from_str(json)?),
            MessageType::UpdateSpan => Payload::UpdateSpan(serde_json::from_str(json)?),
            MessageType::AddTraceFeedbackScoresBatch => {
                Payload::AddTraceFeedbackScoresBatch(serde_json::from_str(json)?)
            }
            MessageType::AddSpanFeedbackScoresBatch => {
                Payload::AddSpanFeedbackScoresBatch(serde_json::from_str(json)?)
            }
            MessageType::AddThreadsFeedbackScoresBatch => {
                Payload::AddThreadsFeedbackScoresBatch(serde_json::from_str(json)?)
            }
            MessageType::CreateSpansBatch => Payload::CreateSpansBatch(serde_json::from_str(json)?),
            MessageType::CreateTraceBatch => Payload::CreateTraceBatch(serde_json::from_str(json)?),
            MessageType::GuardrailBatch => Payload::GuardrailBatch(serde_json::from_str(json)?),
            MessageType::CreateExperimentItemsBatch => {
                Payload::CreateExperimentItemsBatch(serde_json::from_str(json)?)
            }
            MessageType::CreateAttachment => Payload::CreateAttachment(serde_json::from_str(json)?),
        };
        Ok(payload)
    }

    /// Number of entities carried (1 for single messages).
    pub fn item_count(&self) -> usize {
        match self {
            Payload::AddTraceFeedbackScoresBatch(p)
            | Payload::AddSpanFeedbackScoresBatch(p)
            | Payload::AddThreadsFeedbackScoresBatch(p) => p.len(),
            Payload::CreateSpansBatch(p) => p.len(),
            Payload::CreateTraceBatch(p) => p.len(),
            Payload::GuardrailBatch(p) => p.len(),
            Payload::CreateExperimentItemsBatch(p) => p.len(),
            _ => 1,
        }
    }
}

/// One unit of work flowing through the pipeline.
///
/// Only `delivery_time` changes after a message is enqueued: a rate-limited
/// delivery pushes it into the future.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub delivery_time: Instant,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: None,
            delivery_time: Instant::now(),
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_deliverable_at(&self, now: Instant) -> bool {
        self.delivery_time <= now
    }

    pub fn defer_until(&mut self, when: Instant) {
        self.delivery_time = when;
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        self.payload.to_json()
    }

    /// Rebuilds a message from a replay-store row. It becomes deliverable now.
    pub fn from_record(
        message_id: MessageId,
        message_type: &str,
        json: &str,
    ) -> Result<Self, MessageError> {
        let message_type: MessageType = message_type.parse()?;
        Ok(Self {
            message_id: Some(message_id),
            delivery_time: Instant::now(),
            payload: Payload::from_json(message_type, json)?,
        })
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        Message::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn span(id: &str) -> CreateSpanMessage {
        CreateSpanMessage {
            span_id: id.to_string(),
            trace_id: "trace-1".to_string(),
            project_name: "default".to_string(),
            parent_span_id: None,
            name: Some("llm-call".to_string()),
            start_time: "2024-05-01T10:00:00Z".parse().unwrap(),
            end_time: None,
            input: Some(json!({"prompt": "2024-05-01T10:00:00Z"})),
            output: None,
            metadata: None,
            tags: Some(vec!["a".to_string()]),
            span_type: SpanType::Llm,
            usage: None,
            model: None,
            provider: None,
            error_info: None,
            total_cost: Some(0.25),
            last_updated_at: None,
            attachments: vec![Attachment {
                file_path: "/tmp/a.png".to_string(),
                file_name: None,
                content_type: None,
            }],
        }
    }

    #[test]
    fn test_message_type_tags_are_stable() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert_eq!(MessageType::CreateSpansBatch.as_str(), "create_spans_batch");
        assert!("no_such_type".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_record_rebuild_keeps_id_and_payload() {
        let message = Message::new(Payload::CreateSpan(span("s-1")));
        let json = message.to_json().unwrap();

        let rebuilt = Message::from_record(7, "create_span", &json).unwrap();
        assert_eq!(rebuilt.message_id, Some(7));
        let Payload::CreateSpan(rebuilt_span) = rebuilt.payload else {
            panic!("wrong payload variant");
        };
        // Attachments travel separately and are not persisted.
        assert!(rebuilt_span.attachments.is_empty());
        assert_eq!(rebuilt_span.span_id, "s-1");
        assert_eq!(rebuilt_span.span_type, SpanType::Llm);
        // A date-looking string stays a string.
        assert_eq!(rebuilt_span.input, Some(json!({"prompt": "2024-05-01T10:00:00Z"})));
    }

    #[test]
    fn test_timestamps_serialize_as_iso8601() {
        let json = Payload::CreateSpan(span("s-2")).to_json().unwrap();
        assert!(json.contains("\"start_time\":\"2024-05-01T10:00:00Z\""));
        assert!(json.contains("\"type\":\"llm\""));
    }

    #[test]
    fn test_tagged_payload_format() {
        let line = r#"{"message_type":"add_trace_feedback_scores_batch","payload":{"batch":[
            {"id":"t1","project_name":"p","name":"accuracy","value":0.9,"source":"sdk",
             "reason":null,"category_name":null}]}}"#;
        let payload: Payload = serde_json::from_str(line).unwrap();
        assert_eq!(payload.message_type(), MessageType::AddTraceFeedbackScoresBatch);
        assert_eq!(payload.item_count(), 1);
    }

    #[test]
    fn test_delivery_time_gate() {
        let mut message = Message::new(Payload::CreateSpan(span("s-3")));
        let now = Instant::now();
        assert!(message.is_deliverable_at(now));
        message.defer_until(now + std::time::Duration::from_secs(5));
        assert!(!message.is_deliverable_at(now));
    }
}
