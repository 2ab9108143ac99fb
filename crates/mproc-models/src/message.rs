//! Queue message envelope.
//!
//! Every message on the request and update topics shares the envelope
//! fields and is discriminated by `messageType`:
//!
//! ```json
//! {"messageType": "progress", "mediaType": "image", "mediaId": "...",
//!  "userId": "...", "timestamp": "...", "status": "PROCESSING", "progress": 40}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::batch::BatchSummary;
use crate::job::{MediaId, MediaJob};
use crate::job_status::JobStatus;
use crate::media::MediaType;
use crate::stage::Stage;

/// Discriminant of a [`QueueMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Progress,
    Result,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Progress => "progress",
            MessageType::Result => "result",
            MessageType::Error => "error",
        }
    }
}

/// A message on a request or update topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub media_type: MediaType,
    pub media_id: MediaId,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum MessageBody {
    Request(RequestBody),
    Progress(ProgressBody),
    Result(ResultBody),
    Error(ErrorBody),
}

/// Processing request for one uploaded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub s3_key: String,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Attempt counter, bumped by an explicit retry
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBody {
    pub status: JobStatus,
    /// Progress (0-100)
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultBody {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MediaOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// Everything a finished job produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaOutput {
    /// Key of the persisted original
    pub s3_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_s3_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Duration in seconds (video only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<QualityVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_media: Option<Vec<ExtractedMedia>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSummary>,
}

/// One derived quality version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QualityVersion {
    pub label: String,
    pub s3_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub size: u64,
}

/// Outcome of one archive entry that became a child job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMedia {
    pub media_id: MediaId,
    pub filename: String,
    pub media_type: MediaType,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_s3_key: Option<String>,
}

/// Progress detail emitted once an archive has been scanned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZipExtractionProgress {
    pub status: JobStatus,
    pub total_files: u32,
    pub media_files: u32,
    pub skipped_files: u32,
}

impl QueueMessage {
    /// Create a request message.
    pub fn request(
        media_type: MediaType,
        media_id: MediaId,
        user_id: impl Into<String>,
        body: RequestBody,
    ) -> Self {
        Self {
            media_type,
            media_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            body: MessageBody::Request(body),
        }
    }

    /// Wrap a body in the envelope of `job`.
    pub fn for_job(job: &MediaJob, body: MessageBody) -> Self {
        Self {
            media_type: job.envelope_media_type(),
            media_id: job.media_id.clone(),
            user_id: job.user_id.clone(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// A message with the same envelope as `self` and a fresh timestamp.
    pub fn reply(&self, body: MessageBody) -> Self {
        Self {
            media_type: self.media_type,
            media_id: self.media_id.clone(),
            user_id: self.user_id.clone(),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn progress(job: &MediaJob, body: ProgressBody) -> Self {
        Self::for_job(job, MessageBody::Progress(body))
    }

    pub fn result(job: &MediaJob, body: ResultBody) -> Self {
        Self::for_job(job, MessageBody::Result(body))
    }

    pub fn error(job: &MediaJob, body: ErrorBody) -> Self {
        Self::for_job(job, MessageBody::Error(body))
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            MessageBody::Request(_) => MessageType::Request,
            MessageBody::Progress(_) => MessageType::Progress,
            MessageBody::Result(_) => MessageType::Result,
            MessageBody::Error(_) => MessageType::Error,
        }
    }

    /// Whether this is the last message emitted for a job attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, MessageBody::Result(_) | MessageBody::Error(_))
    }

    /// Build the request for an explicit retry of this request.
    ///
    /// Returns `None` for anything other than a request message.
    pub fn retry_of(&self) -> Option<Self> {
        match &self.body {
            MessageBody::Request(req) => {
                let mut req = req.clone();
                req.attempt += 1;
                Some(Self {
                    timestamp: Utc::now(),
                    body: MessageBody::Request(req),
                    ..self.clone()
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> QueueMessage {
        QueueMessage::request(
            MediaType::Image,
            MediaId::from_string("m-1"),
            "u-1",
            RequestBody {
                s3_key: "uploads/u-1/photo.jpg".into(),
                original_filename: "photo.jpg".into(),
                mime_type: "image/jpeg".into(),
                file_size: 1024,
                metadata: None,
                attempt: 0,
            },
        )
    }

    #[test]
    fn test_request_wire_format() {
        let value = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(value["messageType"], "request");
        assert_eq!(value["mediaType"], "image");
        assert_eq!(value["mediaId"], "m-1");
        assert_eq!(value["userId"], "u-1");
        assert_eq!(value["s3Key"], "uploads/u-1/photo.jpg");
        assert_eq!(value["fileSize"], 1024);
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_parse_result_message() {
        let json = r#"{
            "messageType": "result",
            "mediaType": "video",
            "mediaId": "m-9",
            "userId": "u-2",
            "timestamp": "2024-05-01T10:00:00Z",
            "status": "COMPLETED",
            "result": {"s3Key": "u-2/m-9/original.mp4", "thumbnailS3Key": "u-2/m-9/thumbnail.jpg", "duration": 12.5}
        }"#;
        let msg: QueueMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_type(), MessageType::Result);
        assert!(msg.is_terminal());
        match msg.body {
            MessageBody::Result(body) => {
                assert_eq!(body.status, JobStatus::Completed);
                let result = body.result.unwrap();
                assert_eq!(result.thumbnail_s3_key.as_deref(), Some("u-2/m-9/thumbnail.jpg"));
                assert_eq!(result.duration, Some(12.5));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_document_entry_reports_as_zip() {
        let parent = MediaJob::from_request(
            MediaType::Zip,
            MediaId::from_string("batch-1"),
            "u-1",
            &RequestBody {
                s3_key: "u-1/batch-1/archive.zip".into(),
                original_filename: "archive.zip".into(),
                mime_type: "application/zip".into(),
                file_size: 2048,
                metadata: None,
                attempt: 0,
            },
        );
        let document = MediaJob::child_of(
            &parent,
            MediaType::Document,
            "u-1/batch-1/entries/d/notes.pdf",
            "notes.pdf",
            "application/pdf",
            10,
        );
        let image = MediaJob::child_of(
            &parent,
            MediaType::Image,
            "u-1/batch-1/entries/i/a.png",
            "a.png",
            "image/png",
            10,
        );

        let value = serde_json::to_value(QueueMessage::for_job(
            &document,
            MessageBody::Progress(ProgressBody {
                status: JobStatus::Processing,
                progress: 30,
                message: None,
                stage: None,
                details: None,
            }),
        ))
        .unwrap();
        assert_eq!(value["mediaType"], "zip");
        assert_eq!(value["mediaId"], document.media_id.as_str());
        assert_eq!(image.envelope_media_type(), MediaType::Image);
        assert_eq!(parent.envelope_media_type(), MediaType::Zip);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"messageType": "bogus", "mediaType": "image", "mediaId": "m",
                       "userId": "u", "timestamp": "2024-05-01T10:00:00Z"}"#;
        assert!(serde_json::from_str::<QueueMessage>(json).is_err());
    }

    #[test]
    fn test_retry_bumps_attempt() {
        let retried = sample_request().retry_of().unwrap();
        match retried.body {
            MessageBody::Request(req) => assert_eq!(req.attempt, 1),
            _ => panic!("expected request"),
        }
    }
}
