//! Object storage for the media pipeline.
//!
//! This crate provides:
//! - The `ObjectStore` trait with S3 and in-memory implementations
//! - The chunked multipart upload service with retry and abort
//! - Metadata sanitizing for object headers

pub mod client;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod multipart;
pub mod retry;

pub use client::{store_from_env, ObjectStore, S3Client, S3Config};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryObjectStore, StoredObject};
pub use metadata::{metadata_from_json, sanitize_metadata, MAX_METADATA_BYTES};
pub use multipart::{MultipartUploader, UploadConfig, UploadSource};
pub use retry::{retry_async, retry_async_if, RetryExhausted, RetryPolicy};
