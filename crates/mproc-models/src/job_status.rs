//! Job status state machine.
//!
//! `PENDING -> (EXTRACTING -> EXTRACTED ->)? PROCESSING -> terminal`, where
//! the extraction states only apply to zip jobs and `PARTIAL_SUCCESS` is
//! only reachable by zip jobs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::MediaType;

/// Processing status of a media job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted by a worker, no stage has run yet
    #[default]
    Pending,
    /// Archive is being extracted (zip only)
    Extracting,
    /// Archive extracted, children not yet started (zip only)
    Extracted,
    /// Transform/upload stages are running
    Processing,
    /// All work succeeded
    Completed,
    /// Some archive entries succeeded and some failed (zip only)
    PartialSuccess,
    /// The job failed
    Failed,
    /// The job was cancelled
    Cancelled,
}

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("Invalid transition for {media_type} job: {from} -> {to}")]
    InvalidTransition {
        media_type: MediaType,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job is not terminal ({0}); only terminal jobs can be retried")]
    NotRetryable(JobStatus),
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Extracted => "EXTRACTED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::PartialSuccess => "PARTIAL_SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Check if this is a terminal state (no further stage transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PartialSuccess | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition for a job of `media_type`.
    pub fn can_transition_to(&self, next: JobStatus, media_type: MediaType) -> bool {
        use JobStatus::*;

        let is_zip = media_type == MediaType::Zip;
        match (self, next) {
            // Failure and cancellation are reachable from every live state.
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Pending, Extracting) => is_zip,
            (Pending, Processing) => !is_zip,
            (Extracting, Extracted) => is_zip,
            (Extracted, Processing) => is_zip,
            (Processing, Completed) => true,
            (Processing, PartialSuccess) => is_zip,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path() {
        let t = MediaType::Image;
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing, t));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed, t));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Extracting, t));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::PartialSuccess, t));
    }

    #[test]
    fn test_zip_path() {
        let t = MediaType::Zip;
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Extracting, t));
        assert!(JobStatus::Extracting.can_transition_to(JobStatus::Extracted, t));
        assert!(JobStatus::Extracted.can_transition_to(JobStatus::Processing, t));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::PartialSuccess, t));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Processing, t));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            JobStatus::Completed,
            JobStatus::PartialSuccess,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Pending, MediaType::Zip));
            assert!(!terminal.can_transition_to(JobStatus::Failed, MediaType::Zip));
            assert!(!terminal.can_transition_to(JobStatus::Processing, MediaType::Image));
        }
    }

    #[test]
    fn test_serde_screaming_case() {
        let json = serde_json::to_string(&JobStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"PARTIAL_SUCCESS\"");
    }
}
