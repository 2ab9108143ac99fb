//! Zip batch accounting.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job_status::JobStatus;

/// Default bound on recorded per-entry errors.
pub const MAX_BATCH_ERRORS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntryError {
    pub filename: String,
    pub error: String,
}

/// Aggregate outcome of the child jobs of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: String,
    /// Entries in the archive, including skipped ones
    pub total_files: u32,
    /// Entries that were attempted
    pub total_processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default)]
    pub errors: Vec<EntryError>,
    /// Set when failures were dropped from `errors`
    #[serde(default)]
    pub errors_truncated: bool,
    #[serde(skip, default = "default_error_limit")]
    error_limit: usize,
}

fn default_error_limit() -> usize {
    MAX_BATCH_ERRORS
}

impl BatchSummary {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            total_files: 0,
            total_processed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            errors_truncated: false,
            error_limit: MAX_BATCH_ERRORS,
        }
    }

    /// Override the bound on recorded errors.
    pub fn with_error_limit(mut self, limit: usize) -> Self {
        self.error_limit = limit;
        self
    }

    pub fn record_success(&mut self) {
        self.total_processed += 1;
        self.successful += 1;
    }

    pub fn record_failure(&mut self, filename: impl Into<String>, error: impl Into<String>) {
        self.total_processed += 1;
        self.failed += 1;
        if self.errors.len() < self.error_limit {
            self.errors.push(EntryError {
                filename: filename.into(),
                error: error.into(),
            });
        } else {
            self.errors_truncated = true;
        }
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Terminal status of the parent job.
    pub fn final_status(&self) -> JobStatus {
        match (self.successful, self.failed) {
            (_, 0) => JobStatus::Completed,
            (0, _) => JobStatus::Failed,
            _ => JobStatus::PartialSuccess,
        }
    }
}
