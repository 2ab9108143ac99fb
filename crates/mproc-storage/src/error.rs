//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage client: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Multipart operation failed: {0}")]
    Multipart(String),

    #[error("Part {part_number} failed after {attempts} attempts: {message}")]
    ChunkFailed {
        part_number: u32,
        attempts: u32,
        message: String,
    },

    #[error("Invalid part list: {0}")]
    InvalidPartList(String),

    #[error("File too large: {size} bytes exceeds limit of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AWS SDK error: {0}")]
    AwsSdk(String),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::DownloadFailed(msg.into())
    }

    pub fn delete_failed(msg: impl Into<String>) -> Self {
        Self::DeleteFailed(msg.into())
    }

    pub fn multipart(msg: impl Into<String>) -> Self {
        Self::Multipart(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::UploadFailed(_)
                | StorageError::DownloadFailed(_)
                | StorageError::Multipart(_)
                | StorageError::ChunkFailed { .. }
                | StorageError::Transient(_)
                | StorageError::Io(_)
        )
    }

    /// Whether the input itself was rejected.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StorageError::FileTooLarge { .. } | StorageError::InvalidPartList(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StorageError::transient("timeout").is_retryable());
        assert!(StorageError::ChunkFailed {
            part_number: 2,
            attempts: 4,
            message: "reset".into()
        }
        .is_retryable());
        assert!(!StorageError::not_found("k").is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());

        let too_large = StorageError::FileTooLarge { size: 10, max: 5 };
        assert!(too_large.is_validation());
        assert!(!too_large.is_retryable());
    }
}
