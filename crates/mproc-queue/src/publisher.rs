//! Update messages for the record-management backend.

use std::sync::Arc;

use mproc_models::{
    ErrorBody, JobStatus, MediaJob, MediaOutput, MessageBody, ProgressBody, QueueMessage,
    ResultBody, Stage, ZipExtractionProgress,
};
use tracing::{debug, warn};

use crate::error::QueueResult;
use crate::transport::QueueTransport;

/// Publishes progress, result and error messages for jobs.
#[derive(Clone)]
pub struct UpdatePublisher {
    transport: Arc<dyn QueueTransport>,
}

impl UpdatePublisher {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, message: &QueueMessage) -> QueueResult<()> {
        debug!(
            media_id = %message.media_id,
            message_type = message.message_type().as_str(),
            "Publishing update"
        );
        self.transport.publish_update(message).await?;
        Ok(())
    }

    /// Publish a progress update. Failures are logged, not returned.
    pub async fn progress(
        &self,
        job: &MediaJob,
        stage: Stage,
        progress: u8,
        message: impl Into<String>,
    ) {
        let body = ProgressBody {
            status: job.status,
            progress: progress.min(100),
            message: Some(message.into()),
            stage: Some(stage),
            details: None,
        };
        self.publish_progress(job, body).await;
    }

    /// Publish the archive scan summary of a zip job.
    pub async fn extraction(&self, job: &MediaJob, summary: &ZipExtractionProgress) {
        let body = ProgressBody {
            status: summary.status,
            progress: job.progress,
            message: Some(format!(
                "Found {} media files, skipped {}",
                summary.media_files, summary.skipped_files
            )),
            stage: Some(Stage::Extract),
            details: serde_json::to_value(summary).ok(),
        };
        self.publish_progress(job, body).await;
    }

    async fn publish_progress(&self, job: &MediaJob, body: ProgressBody) {
        let message = QueueMessage::progress(job, body);
        if let Err(e) = self.publish(&message).await {
            warn!(media_id = %job.media_id, "Failed to publish progress: {}", e);
        }
    }

    /// Publish the terminal result of a job.
    pub async fn result(
        &self,
        job: &MediaJob,
        status: JobStatus,
        result: Option<MediaOutput>,
        error: Option<String>,
    ) -> QueueResult<()> {
        let message = QueueMessage::result(job, ResultBody { status, result, error });
        self.publish(&message).await
    }

    /// Publish a terminal error.
    pub async fn error(
        &self,
        job: &MediaJob,
        error: impl Into<String>,
        details: Option<String>,
        retryable: bool,
    ) -> QueueResult<()> {
        let message = QueueMessage::error(
            job,
            ErrorBody {
                error: error.into(),
                details,
                retryable: Some(retryable),
            },
        );
        self.publish(&message).await
    }

    /// Reject a request before a job exists for it.
    pub async fn reject(&self, request: &QueueMessage, error: impl Into<String>) -> QueueResult<()> {
        let message = request.reply(MessageBody::Error(ErrorBody {
            error: error.into(),
            details: Some("validation".to_string()),
            retryable: Some(false),
        }));
        self.publish(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use mproc_models::{MediaId, MediaType, MessageType, RequestBody};

    fn job() -> MediaJob {
        let request = RequestBody {
            s3_key: "uploads/a.zip".into(),
            original_filename: "a.zip".into(),
            mime_type: "application/zip".into(),
            file_size: 10,
            metadata: None,
            attempt: 0,
        };
        MediaJob::from_request(MediaType::Zip, MediaId::from_string("m-1"), "u-1", &request)
    }

    #[tokio::test]
    async fn test_messages_keyed_by_media_id() {
        let transport = Arc::new(MemoryTransport::default());
        let publisher = UpdatePublisher::new(transport.clone());
        let job = job();

        publisher.progress(&job, Stage::Download, 10, "Downloading").await;
        publisher
            .extraction(
                &job,
                &ZipExtractionProgress {
                    status: JobStatus::Extracted,
                    total_files: 10,
                    media_files: 8,
                    skipped_files: 2,
                },
            )
            .await;
        publisher
            .result(&job, JobStatus::PartialSuccess, None, None)
            .await
            .unwrap();

        let updates = transport.published_updates();
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|m| m.media_id.as_str() == "m-1"));
        assert_eq!(updates[2].message_type(), MessageType::Result);

        let value = serde_json::to_value(&updates[1]).unwrap();
        assert_eq!(value["stage"], "extract");
        assert_eq!(value["details"]["mediaFiles"], 8);
        assert_eq!(value["details"]["skippedFiles"], 2);
    }

    #[tokio::test]
    async fn test_error_carries_retryable_flag() {
        let transport = Arc::new(MemoryTransport::default());
        let publisher = UpdatePublisher::new(transport.clone());
        publisher
            .error(&job(), "download failed", Some("download".into()), true)
            .await
            .unwrap();

        match &transport.published_updates()[0].body {
            MessageBody::Error(body) => {
                assert_eq!(body.retryable, Some(true));
                assert_eq!(body.details.as_deref(), Some("download"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
