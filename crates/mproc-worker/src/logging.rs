//! Structured job logging.

use mproc_models::{MediaJob, Stage};
use tracing::{error, info, warn, Span};

/// Logs job lifecycle events with the job's identifying fields attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    media_id: String,
    media_type: &'static str,
}

impl JobLogger {
    pub fn new(job: &MediaJob) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            media_id: job.media_id.to_string(),
            media_type: job.media_type.as_str(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type,
            "Job started: {}", message
        );
    }

    pub fn log_stage(&self, stage: Stage, message: &str) {
        info!(
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type,
            stage = stage.as_str(),
            "{}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, stage: Stage, message: &str) {
        error!(
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type,
            stage = stage.as_str(),
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Span covering the whole job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            media_id = %self.media_id,
            media_type = self.media_type
        )
    }
}
