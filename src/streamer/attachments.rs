use crate::domain::{
    Attachment, AttachmentEntity, CreateAttachmentMessage, Message, Payload,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs on every message before batching. May consume the message entirely.
pub trait AttachmentPreprocessor: Send + Sync {
    fn preprocess(&self, message: Message) -> Option<Message>;
}

/// Out-of-band upload of attachment files.
pub trait FileUploadManager: Send + Sync {
    fn upload(&self, attachment: CreateAttachmentMessage);

    /// Waits up to `timeout` for pending uploads, polling every
    /// `sleep_time`. Returns true when nothing is pending.
    fn flush(&self, timeout: Duration, sleep_time: Duration) -> bool;

    fn close(&self);
}

/// Upload manager used when file uploads are not configured.
#[derive(Debug, Default)]
pub struct DisabledUploads {
    warned: AtomicBool,
}

impl DisabledUploads {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileUploadManager for DisabledUploads {
    fn upload(&self, attachment: CreateAttachmentMessage) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("File uploads are disabled; attachments will be dropped");
        }
        tracing::debug!(
            file = %attachment.file_path,
            entity_id = %attachment.entity_id,
            "Dropping attachment"
        );
    }

    fn flush(&self, _timeout: Duration, _sleep_time: Duration) -> bool {
        true
    }

    fn close(&self) {}
}

/// Strips attachments off span and trace messages and sends them, together
/// with standalone attachment messages, to the upload manager.
pub struct AttachmentExtractor {
    uploads: Arc<dyn FileUploadManager>,
}

impl AttachmentExtractor {
    pub fn new(uploads: Arc<dyn FileUploadManager>) -> Self {
        Self { uploads }
    }

    fn upload_all(
        &self,
        attachments: Vec<Attachment>,
        entity_type: AttachmentEntity,
        entity_id: &str,
        project_name: &str,
    ) {
        for attachment in attachments {
            self.uploads.upload(to_upload(
                attachment,
                entity_type,
                entity_id,
                project_name,
            ));
        }
    }
}

impl AttachmentPreprocessor for AttachmentExtractor {
    fn preprocess(&self, mut message: Message) -> Option<Message> {
        match &mut message.payload {
            Payload::CreateAttachment(attachment) => {
                self.uploads.upload(attachment.clone());
                return None;
            }
            Payload::CreateSpan(span) if !span.attachments.is_empty() => {
                let attachments = std::mem::take(&mut span.attachments);
                self.upload_all(attachments, AttachmentEntity::Span, &span.span_id, &span.project_name);
            }
            Payload::UpdateSpan(span) if !span.attachments.is_empty() => {
                let attachments = std::mem::take(&mut span.attachments);
                self.upload_all(attachments, AttachmentEntity::Span, &span.span_id, &span.project_name);
            }
            Payload::CreateTrace(trace) if !trace.attachments.is_empty() => {
                let attachments = std::mem::take(&mut trace.attachments);
                self.upload_all(attachments, AttachmentEntity::Trace, &trace.trace_id, &trace.project_name);
            }
            Payload::UpdateTrace(trace) if !trace.attachments.is_empty() => {
                let attachments = std::mem::take(&mut trace.attachments);
                self.upload_all(attachments, AttachmentEntity::Trace, &trace.trace_id, &trace.project_name);
            }
            _ => {}
        }
        Some(message)
    }
}

fn to_upload(
    attachment: Attachment,
    entity_type: AttachmentEntity,
    entity_id: &str,
    project_name: &str,
) -> CreateAttachmentMessage {
    let file_name = attachment.file_name.unwrap_or_else(|| {
        Path::new(&attachment.file_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&attachment.file_path)
            .to_string()
    });
    CreateAttachmentMessage {
        file_path: attachment.file_path,
        file_name,
        mime_type: attachment.content_type,
        entity_type,
        entity_id: entity_id.to_string(),
        project_name: project_name.to_string(),
        delete_after_upload: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UpdateTraceMessage;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUploads {
        uploaded: Mutex<Vec<CreateAttachmentMessage>>,
    }

    impl FileUploadManager for RecordingUploads {
        fn upload(&self, attachment: CreateAttachmentMessage) {
            self.uploaded.lock().push(attachment);
        }

        fn flush(&self, _timeout: Duration, _sleep_time: Duration) -> bool {
            true
        }

        fn close(&self) {}
    }

    fn trace_update(attachments: Vec<Attachment>) -> Message {
        Message::new(Payload::UpdateTrace(UpdateTraceMessage {
            trace_id: "trace-1".to_string(),
            project_name: "demo".to_string(),
            end_time: None,
            input: None,
            output: None,
            metadata: None,
            tags: None,
            error_info: None,
            thread_id: None,
            attachments,
        }))
    }

    #[test]
    fn test_attachments_are_split_off_and_message_kept() {
        let uploads = Arc::new(RecordingUploads::default());
        let extractor = AttachmentExtractor::new(uploads.clone());

        let message = trace_update(vec![Attachment {
            file_path: "/data/report.pdf".to_string(),
            file_name: None,
            content_type: Some("application/pdf".to_string()),
        }]);
        let remaining = extractor.preprocess(message).unwrap();

        match remaining.payload {
            Payload::UpdateTrace(trace) => assert!(trace.attachments.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
        let uploaded = uploads.uploaded.lock();
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].file_name, "report.pdf");
        assert_eq!(uploaded[0].entity_type, AttachmentEntity::Trace);
        assert_eq!(uploaded[0].entity_id, "trace-1");
    }

    #[test]
    fn test_standalone_attachment_is_consumed() {
        let uploads = Arc::new(RecordingUploads::default());
        let extractor = AttachmentExtractor::new(uploads.clone());
        let message = Message::new(Payload::CreateAttachment(CreateAttachmentMessage {
            file_path: "/tmp/a.txt".to_string(),
            file_name: "a.txt".to_string(),
            mime_type: None,
            entity_type: AttachmentEntity::Span,
            entity_id: "span-9".to_string(),
            project_name: "demo".to_string(),
            delete_after_upload: true,
        }));
        assert!(extractor.preprocess(message).is_none());
        assert_eq!(uploads.uploaded.lock().len(), 1);
    }

    #[test]
    fn test_message_without_attachments_passes_through() {
        let uploads = Arc::new(RecordingUploads::default());
        let extractor = AttachmentExtractor::new(uploads.clone());
        let message = trace_update(Vec::new());
        assert_eq!(extractor.preprocess(message.clone()), Some(message));
        assert!(uploads.uploaded.lock().is_empty());
    }
}
