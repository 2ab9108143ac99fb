//! Media job definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job_status::{JobStateError, JobStatus};
use crate::media::MediaType;
use crate::message::{MediaOutput, RequestBody};

/// Unique identifier for one job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a media object, stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MediaId(pub String);

impl MediaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One processing request for a single media object, as held by a worker.
///
/// Created when a worker accepts a request, not when it is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaJob {
    pub job_id: JobId,
    pub media_id: MediaId,
    pub user_id: String,
    pub media_type: MediaType,
    /// Object key of the uploaded source
    pub source_key: String,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Batch this job belongs to (zip children and zip parents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Media ID of the zip job that produced this child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_media_id: Option<MediaId>,

    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub attempt: u32,
    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MediaOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MediaJob {
    /// Build a job from an accepted request.
    pub fn from_request(
        media_type: MediaType,
        media_id: MediaId,
        user_id: impl Into<String>,
        request: &RequestBody,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            media_id,
            user_id: user_id.into(),
            media_type,
            source_key: request.s3_key.clone(),
            original_filename: request.original_filename.clone(),
            mime_type: request.mime_type.clone(),
            file_size: request.file_size,
            metadata: request.metadata.clone(),
            batch_id: None,
            parent_media_id: None,
            status: JobStatus::Pending,
            attempt: request.attempt,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Build a child job for one archive entry of `parent`.
    pub fn child_of(
        parent: &MediaJob,
        media_type: MediaType,
        source_key: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            media_id: MediaId::new(),
            user_id: parent.user_id.clone(),
            media_type,
            source_key: source_key.into(),
            original_filename: filename.into(),
            mime_type: mime_type.into(),
            file_size,
            metadata: None,
            batch_id: parent.batch_id.clone(),
            parent_media_id: Some(parent.media_id.clone()),
            status: JobStatus::Pending,
            attempt: 0,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the batch ID.
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobStateError> {
        if !self.status.can_transition_to(next, self.media_type) {
            return Err(JobStateError::InvalidTransition {
                media_type: self.media_type,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && next != JobStatus::Pending {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if next == JobStatus::Completed || next == JobStatus::PartialSuccess {
                self.progress = 100;
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Set progress, clamped to 100 and never decreasing.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.updated_at = Utc::now();
    }

    /// Re-enter `PENDING` as a fresh attempt.
    ///
    /// Only terminal jobs can be retried.
    pub fn retry(&mut self) -> Result<(), JobStateError> {
        if !self.status.is_terminal() {
            return Err(JobStateError::NotRetryable(self.status));
        }
        let now = Utc::now();
        self.job_id = JobId::new();
        self.attempt += 1;
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_zip(&self) -> bool {
        self.media_type == MediaType::Zip
    }

    /// Media type carried on this job's update messages.
    ///
    /// Archive entries of a type with no request queue (documents) report
    /// under their parent batch's type.
    pub fn envelope_media_type(&self) -> MediaType {
        if !self.media_type.is_queued() && self.parent_media_id.is_some() {
            MediaType::Zip
        } else {
            self.media_type
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestBody {
        RequestBody {
            s3_key: "uploads/u/clip.mp4".into(),
            original_filename: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
            file_size: 42,
            metadata: None,
            attempt: 0,
        }
    }

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_transition_happy_path() {
        let mut job = MediaJob::from_request(MediaType::Video, MediaId::new(), "u", &request());
        job.transition(JobStatus::Processing).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Completed).unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_job_rejects_transition() {
        let mut job = MediaJob::from_request(MediaType::Image, MediaId::new(), "u", &request());
        job.transition(JobStatus::Failed).unwrap();
        let err = job.transition(JobStatus::Processing).unwrap_err();
        assert!(matches!(err, JobStateError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_allocates_fresh_attempt() {
        let mut job = MediaJob::from_request(MediaType::Image, MediaId::new(), "u", &request());
        assert!(job.retry().is_err());

        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        let old_job_id = job.job_id.clone();

        job.retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 1);
        assert_ne!(job.job_id, old_job_id);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = MediaJob::from_request(MediaType::Image, MediaId::new(), "u", &request());
        job.set_progress(40);
        job.set_progress(20);
        assert_eq!(job.progress, 40);
        job.set_progress(250);
        assert_eq!(job.progress, 100);
    }
}
