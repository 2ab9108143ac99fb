//! Shared data models for the media pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Media jobs and their status state machine
//! - The queue message envelope (request/progress/result/error)
//! - Multipart upload sessions and chunk plans
//! - Zip batch accounting and entry classification

pub mod batch;
pub mod job;
pub mod job_status;
pub mod media;
pub mod message;
pub mod stage;
pub mod upload;

// Re-export common types
pub use batch::{BatchSummary, EntryError, MAX_BATCH_ERRORS};
pub use job::{JobId, MediaId, MediaJob};
pub use job_status::{JobStateError, JobStatus};
pub use media::{EntryKind, MediaType};
pub use message::{
    ErrorBody, ExtractedMedia, MediaOutput, MessageBody, MessageType, ProgressBody, QualityVersion,
    QueueMessage, RequestBody, ResultBody, ZipExtractionProgress,
};
pub use stage::Stage;
pub use upload::{
    ChunkPlan, CompletedPart, UploadProgress, UploadSession, UploadSessionError, UploadStatus,
};
