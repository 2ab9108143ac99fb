//! Chunked multipart upload service.
//!
//! Splits a source into a fixed chunk plan, uploads the parts with bounded
//! parallelism and per-chunk retry, then completes the session. Any failure
//! or cancellation aborts the session exactly once before the error is
//! returned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use mproc_models::{ChunkPlan, CompletedPart, UploadProgress, UploadStatus};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ObjectStore;
use crate::error::{StorageError, StorageResult};
use crate::metadata::sanitize_metadata;
use crate::retry::{retry_async_if, RetryPolicy};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Upload tuning and store limits.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub chunk_size: u64,
    /// Sizes above this use multipart
    pub multipart_threshold: u64,
    pub max_concurrent_chunks: usize,
    pub max_chunk_retries: u32,
    pub retry_base_delay: Duration,
    pub max_file_size: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * MIB,
            multipart_threshold: 5 * MIB,
            max_concurrent_chunks: 4,
            max_chunk_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            max_file_size: 5 * GIB,
            min_part_size: 5 * MIB,
            max_part_size: 5 * GIB,
            max_parts: 10_000,
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse().ok())
        }

        Self {
            chunk_size: parse("UPLOAD_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            multipart_threshold: parse("UPLOAD_MULTIPART_THRESHOLD")
                .unwrap_or(defaults.multipart_threshold),
            max_concurrent_chunks: parse("UPLOAD_MAX_CONCURRENT_CHUNKS")
                .unwrap_or(defaults.max_concurrent_chunks),
            max_chunk_retries: parse("UPLOAD_MAX_CHUNK_RETRIES")
                .unwrap_or(defaults.max_chunk_retries),
            retry_base_delay: parse("UPLOAD_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            max_file_size: parse("UPLOAD_MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
            min_part_size: parse("S3_MIN_PART_SIZE").unwrap_or(defaults.min_part_size),
            max_part_size: parse("S3_MAX_PART_SIZE").unwrap_or(defaults.max_part_size),
            max_parts: parse("S3_MAX_PARTS").unwrap_or(defaults.max_parts),
        }
    }

    /// Check the config against store limits.
    ///
    /// Returns warnings for settings that work but cap what can be uploaded.
    pub fn validate(&self) -> StorageResult<Vec<String>> {
        if self.chunk_size < self.min_part_size || self.chunk_size > self.max_part_size {
            return Err(StorageError::config_error(format!(
                "chunk size {} must be within [{}, {}]",
                self.chunk_size, self.min_part_size, self.max_part_size
            )));
        }
        if self.multipart_threshold < self.min_part_size {
            return Err(StorageError::config_error(format!(
                "multipart threshold {} is below the minimum part size {}",
                self.multipart_threshold, self.min_part_size
            )));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(StorageError::config_error(
                "max concurrent chunks must be at least 1",
            ));
        }

        let mut warnings = Vec::new();
        let reachable = self.chunk_size.saturating_mul(self.max_parts as u64);
        if reachable < self.max_file_size {
            warnings.push(format!(
                "chunk size {} x {} parts allows {} bytes, below max file size {}",
                self.chunk_size, self.max_parts, reachable, self.max_file_size
            ));
        }
        Ok(warnings)
    }
}

/// Bytes to upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Path(PathBuf),
    Bytes(Bytes),
}

impl UploadSource {
    pub async fn len(&self) -> StorageResult<u64> {
        match self {
            UploadSource::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
            UploadSource::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }

    async fn read_all(&self) -> StorageResult<Bytes> {
        match self {
            UploadSource::Path(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            UploadSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    async fn read_chunk(&self, chunk: &ChunkPlan) -> StorageResult<Bytes> {
        match self {
            UploadSource::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(chunk.start)).await?;
                let mut buf = vec![0u8; chunk.size as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            UploadSource::Bytes(bytes) => {
                Ok(bytes.slice(chunk.start as usize..chunk.end as usize))
            }
        }
    }
}

/// Multipart upload service over an [`ObjectStore`].
#[derive(Clone)]
pub struct MultipartUploader {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// True iff `size` exceeds the multipart threshold.
    pub fn should_use_multipart(&self, size: u64) -> bool {
        size > self.config.multipart_threshold
    }

    /// Fixed chunk plan for `size` bytes.
    pub fn calculate_chunks(&self, size: u64) -> Vec<ChunkPlan> {
        ChunkPlan::plan(size, self.config.chunk_size)
    }

    /// Open a multipart session with sanitized metadata.
    pub async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<String> {
        let metadata = sanitize_metadata(metadata);
        self.store
            .create_multipart_upload(key, content_type, metadata)
            .await
    }

    /// Upload one part, retrying with linear backoff.
    pub async fn upload_chunk(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<CompletedPart> {
        let policy = RetryPolicy::new(format!("upload_part[{part_number}]"))
            .with_max_retries(self.config.max_chunk_retries)
            .with_base_delay(self.config.retry_base_delay);

        let result = retry_async_if(&policy, StorageError::is_retryable, |retry_count| {
            let body = body.clone();
            async move {
                if retry_count > 0 {
                    metrics::counter!("mproc_upload_chunk_retries_total").increment(1);
                }
                self.store.upload_part(key, upload_id, part_number, body).await
            }
        })
        .await;

        match result {
            Ok(e_tag) => {
                debug!(key, upload_id, part_number, "Uploaded part");
                Ok(CompletedPart { part_number, e_tag })
            }
            // Permanent failures surface as they are.
            Err(exhausted) if !exhausted.error.is_retryable() => Err(exhausted.error),
            Err(exhausted) => Err(StorageError::ChunkFailed {
                part_number,
                attempts: exhausted.attempts,
                message: exhausted.error.to_string(),
            }),
        }
    }

    /// Complete a session. Parts are sorted before submission.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPart>,
    ) -> StorageResult<String> {
        parts.sort_by_key(|p| p.part_number);
        self.store
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        Ok(key.to_string())
    }

    /// Abort a session. Failures are logged, not returned.
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        if let Err(e) = self.store.abort_multipart_upload(key, upload_id).await {
            warn!(key, upload_id, "Failed to abort multipart upload: {}", e);
        }
    }

    /// Upload `source` to `key`, using a single PUT below the threshold.
    ///
    /// Returns the final object key.
    pub async fn upload_file_in_chunks(
        &self,
        source: UploadSource,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        progress: Option<mpsc::Sender<UploadProgress>>,
        cancel: &CancellationToken,
    ) -> StorageResult<String> {
        let size = source.len().await?;
        if size > self.config.max_file_size {
            return Err(StorageError::FileTooLarge {
                size,
                max: self.config.max_file_size,
            });
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        if !self.should_use_multipart(size) {
            let body = source.read_all().await?;
            self.store
                .put_object(key, body, content_type, sanitize_metadata(metadata))
                .await?;
            report(
                &progress,
                UploadProgress::new(size, size, 1, 1, UploadStatus::Completed),
            )
            .await;
            return Ok(key.to_string());
        }

        let chunks = self.calculate_chunks(size);
        let total_chunks = chunks.len() as u32;
        let upload_id = self
            .initiate_multipart_upload(key, content_type, metadata)
            .await?;
        info!(key, upload_id = %upload_id, size, total_chunks, "Uploading in chunks");

        match self
            .upload_parts(&source, key, &upload_id, &chunks, size, &progress, cancel)
            .await
        {
            Ok(parts) => {
                match self.complete_multipart_upload(key, &upload_id, parts).await {
                    Ok(final_key) => {
                        report(
                            &progress,
                            UploadProgress::new(
                                size,
                                size,
                                total_chunks,
                                total_chunks,
                                UploadStatus::Completed,
                            ),
                        )
                        .await;
                        Ok(final_key)
                    }
                    Err(e) => {
                        self.abort_multipart_upload(key, &upload_id).await;
                        Err(e)
                    }
                }
            }
            Err((e, uploaded, completed)) => {
                self.abort_multipart_upload(key, &upload_id).await;
                let status = if matches!(e, StorageError::Cancelled) {
                    UploadStatus::Aborted
                } else {
                    UploadStatus::Failed
                };
                report(
                    &progress,
                    UploadProgress::new(uploaded, size, completed, total_chunks, status),
                )
                .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        source: &UploadSource,
        key: &str,
        upload_id: &str,
        chunks: &[ChunkPlan],
        size: u64,
        progress: &Option<mpsc::Sender<UploadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>, (StorageError, u64, u32)> {
        let total_chunks = chunks.len() as u32;
        let mut uploads = stream::iter(chunks.iter().copied())
            .map(|chunk| async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let body = source.read_chunk(&chunk).await?;
                let part = self
                    .upload_chunk(key, upload_id, chunk.part_number, body)
                    .await?;
                Ok((chunk, part))
            })
            .buffer_unordered(self.config.max_concurrent_chunks.max(1));

        let mut parts = Vec::with_capacity(chunks.len());
        let mut uploaded = 0u64;

        while let Some(next) = uploads.next().await {
            match next {
                Ok((chunk, part)) => {
                    uploaded += chunk.size;
                    parts.push(part);
                    report(
                        progress,
                        UploadProgress::new(
                            uploaded,
                            size,
                            parts.len() as u32,
                            total_chunks,
                            UploadStatus::Uploading,
                        ),
                    )
                    .await;
                    if cancel.is_cancelled() && parts.len() < chunks.len() {
                        return Err((StorageError::Cancelled, uploaded, parts.len() as u32));
                    }
                }
                Err(e) => {
                    warn!(key, upload_id, "Chunked upload failed: {}", e);
                    return Err((e, uploaded, parts.len() as u32));
                }
            }
        }

        Ok(parts)
    }
}

async fn report(progress: &Option<mpsc::Sender<UploadProgress>>, update: UploadProgress) {
    if let Some(tx) = progress {
        let _ = tx.send(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockObjectStore;
    use crate::memory::MemoryObjectStore;

    fn fast_config() -> UploadConfig {
        UploadConfig {
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_should_use_multipart_threshold() {
        let uploader = MultipartUploader::new(Arc::new(MemoryObjectStore::new()), fast_config());
        assert!(!uploader.should_use_multipart(0));
        assert!(!uploader.should_use_multipart(5 * MIB));
        assert!(uploader.should_use_multipart(5 * MIB + 1));
    }

    #[test]
    fn test_validate_config() {
        assert!(UploadConfig::default().validate().unwrap().is_empty());

        let too_small = UploadConfig {
            chunk_size: MIB,
            ..Default::default()
        };
        assert!(too_small.validate().is_err());

        let capped = UploadConfig {
            max_parts: 10,
            ..Default::default()
        };
        let warnings = capped.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_exhausting_retries_aborts_once() {
        let mut store = MockObjectStore::new();
        store
            .expect_create_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok("up-1".to_string()));
        store
            .expect_upload_part()
            .times(4)
            .returning(|_, _, _, _| Err(StorageError::transient("connection reset")));
        store
            .expect_abort_multipart_upload()
            .withf(|key, upload_id| key == "big.mp4" && upload_id == "up-1")
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_complete_multipart_upload().never();

        let config = UploadConfig {
            max_concurrent_chunks: 1,
            ..fast_config()
        };
        let uploader = MultipartUploader::new(Arc::new(store), config);
        let data = Bytes::from(vec![7u8; (5 * MIB + 1) as usize]);

        let err = uploader
            .upload_file_in_chunks(
                UploadSource::Bytes(data),
                "big.mp4",
                "video/mp4",
                &HashMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            StorageError::ChunkFailed {
                part_number,
                attempts,
                ..
            } => {
                assert_eq!(part_number, 1);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_part_is_not_retried() {
        let mut store = MockObjectStore::new();
        store
            .expect_upload_part()
            .times(1)
            .returning(|_, _, _, _| Err(StorageError::InvalidPartList("part 0".into())));

        let config = UploadConfig {
            retry_base_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let uploader = MultipartUploader::new(Arc::new(store), config);
        let err = uploader
            .upload_chunk("k", "up", 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPartList(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_abort_failure_does_not_replace_error() {
        let mut store = MockObjectStore::new();
        store
            .expect_create_multipart_upload()
            .returning(|_, _, _| Ok("up-2".to_string()));
        store
            .expect_upload_part()
            .returning(|_, _, _, _| Err(StorageError::transient("timeout")));
        store
            .expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _| Err(StorageError::multipart("already gone")));

        let config = UploadConfig {
            max_chunk_retries: 0,
            max_concurrent_chunks: 1,
            ..fast_config()
        };
        let uploader = MultipartUploader::new(Arc::new(store), config);
        let err = uploader
            .upload_file_in_chunks(
                UploadSource::Bytes(Bytes::from(vec![0u8; (6 * MIB) as usize])),
                "k",
                "video/mp4",
                &HashMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChunkFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_completion_sorts_parts() {
        let mut store = MockObjectStore::new();
        store
            .expect_complete_multipart_upload()
            .withf(|key, upload_id, parts| {
                key == "k"
                    && upload_id == "up"
                    && parts.iter().map(|p| p.part_number).collect::<Vec<_>>() == vec![1, 2, 3]
            })
            .times(2)
            .returning(|_, _, _| Ok(()));
        let uploader = MultipartUploader::new(Arc::new(store), fast_config());

        let part = |n: u32| CompletedPart {
            part_number: n,
            e_tag: format!("e{n}"),
        };
        let in_order = uploader
            .complete_multipart_upload("k", "up", vec![part(1), part(2), part(3)])
            .await
            .unwrap();
        let shuffled = uploader
            .complete_multipart_upload("k", "up", vec![part(3), part(1), part(2)])
            .await
            .unwrap();
        assert_eq!(in_order, shuffled);
        assert_eq!(in_order, "k");
    }

    #[tokio::test]
    async fn test_twelve_mb_upload_end_to_end() {
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = MultipartUploader::new(store.clone(), fast_config());

        let sizes: Vec<u64> = uploader
            .calculate_chunks(12 * MIB)
            .iter()
            .map(|c| c.size)
            .collect();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let data: Vec<u8> = (0..12 * MIB).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let key = uploader
            .upload_file_in_chunks(
                UploadSource::Path(path),
                "u1/m1/original.mp4",
                "video/mp4",
                &HashMap::from([("tags".to_string(), "a,b".to_string())]),
                Some(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(key, "u1/m1/original.mp4");
        let stored = store.get(&key).unwrap();
        assert_eq!(stored.data.as_ref(), data.as_slice());
        assert!(stored.metadata.is_empty());
        assert_eq!(store.open_uploads(), 0);

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        let last = updates.last().unwrap();
        assert_eq!(last.status, UploadStatus::Completed);
        assert_eq!(last.percentage, 100);
        assert_eq!(last.total_chunks, 3);
        assert_eq!(
            updates
                .iter()
                .filter(|u| u.status == UploadStatus::Uploading)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_small_file_uses_single_put() {
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = MultipartUploader::new(store.clone(), fast_config());

        let key = uploader
            .upload_file_in_chunks(
                UploadSource::Bytes(Bytes::from_static(b"tiny")),
                "u/m/small.png",
                "image/png",
                &HashMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(key, "u/m/small.png");
        assert_eq!(store.get(&key).unwrap().content_type, "image/png");
        assert_eq!(store.aborted_uploads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_aborted() {
        let cancel = CancellationToken::new();
        let cancel_after_first = cancel.clone();

        let mut store = MockObjectStore::new();
        store
            .expect_create_multipart_upload()
            .returning(|_, _, _| Ok("up-3".to_string()));
        store
            .expect_upload_part()
            .times(1)
            .returning(move |_, _, part_number, _| {
                cancel_after_first.cancel();
                Ok(format!("e{part_number}"))
            });
        store
            .expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_complete_multipart_upload().never();

        let config = UploadConfig {
            max_concurrent_chunks: 1,
            ..fast_config()
        };
        let uploader = MultipartUploader::new(Arc::new(store), config);
        let (tx, mut rx) = mpsc::channel(16);
        let err = uploader
            .upload_file_in_chunks(
                UploadSource::Bytes(Bytes::from(vec![1u8; (11 * MIB) as usize])),
                "k",
                "video/mp4",
                &HashMap::new(),
                Some(tx),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));

        let mut last = None;
        while let Some(update) = rx.recv().await {
            last = Some(update);
        }
        let last = last.unwrap();
        assert_eq!(last.status, UploadStatus::Aborted);
        assert_eq!(last.current_chunk, 1);
    }

    #[tokio::test]
    async fn test_rejects_oversized_source() {
        let config = UploadConfig {
            max_file_size: 3,
            ..fast_config()
        };
        let uploader = MultipartUploader::new(Arc::new(MemoryObjectStore::new()), config);
        let err = uploader
            .upload_file_in_chunks(
                UploadSource::Bytes(Bytes::from_static(b"four")),
                "k",
                "image/png",
                &HashMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
