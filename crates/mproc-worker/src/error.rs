//! Worker error types.

use mproc_models::{JobStateError, Stage};
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported media: {0}")]
    Unsupported(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    State(#[from] JobStateError),

    #[error("Storage error: {0}")]
    Storage(#[from] mproc_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] mproc_media::MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] mproc_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::DownloadFailed(msg.into())
    }

    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn invalid_archive(msg: impl Into<String>) -> Self {
        Self::InvalidArchive(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Bad input: fails fast and is reported with `retryable: false`.
    pub fn is_validation(&self) -> bool {
        match self {
            WorkerError::InvalidRequest(_)
            | WorkerError::Unsupported(_)
            | WorkerError::InvalidArchive(_) => true,
            WorkerError::Storage(e) => e.is_validation(),
            WorkerError::Media(e) => e.is_validation(),
            _ => false,
        }
    }

    /// Check if resubmitting the job may succeed.
    pub fn is_retryable(&self) -> bool {
        if self.is_validation() {
            return false;
        }
        match self {
            WorkerError::DownloadFailed(_) | WorkerError::UploadFailed(_) | WorkerError::Io(_) => true,
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Media(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            WorkerError::Cancelled | WorkerError::Storage(mproc_storage::StorageError::Cancelled)
        )
    }
}

/// An error attributed to the stage it escaped from.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: WorkerError,
}

impl StageError {
    pub fn new(stage: Stage, source: impl Into<WorkerError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// Attach the failing stage to a result.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E: Into<WorkerError>> StageContext<T> for Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|e| StageError::new(stage, e))
    }
}
