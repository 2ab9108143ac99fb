//! Cancellation after work has started: files are purged, remote sessions
//! released, and a CANCELLED result is the only terminal message.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use mproc_media::{
    Artifact, ArtifactKind, ImageTransformer, MediaResult, MediaTransformer, TransformOutput,
    Transformers,
};
use mproc_models::{CompletedPart, JobStatus, MediaId, MediaJob, MediaType, MessageBody, RequestBody};
use mproc_queue::MemoryTransport;
use mproc_storage::{MemoryObjectStore, ObjectStore, StorageResult};
use mproc_worker::{ConcurrencyLimiter, MediaPipeline, TempFileTracker, WorkerConfig};
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

/// Runs the wrapped transformer, then cancels the job.
struct CancelAfterTransform {
    inner: Arc<dyn MediaTransformer>,
    cancel: CancellationToken,
}

#[async_trait]
impl MediaTransformer for CancelAfterTransform {
    fn media_type(&self) -> MediaType {
        self.inner.media_type()
    }

    async fn transform(&self, input: &Path, work_dir: &Path) -> MediaResult<TransformOutput> {
        let output = self.inner.transform(input, work_dir).await?;
        self.cancel.cancel();
        Ok(output)
    }
}

/// Produces one artifact large enough to need a multipart upload.
struct LargeRendition;

#[async_trait]
impl MediaTransformer for LargeRendition {
    fn media_type(&self) -> MediaType {
        MediaType::Image
    }

    async fn transform(&self, _input: &Path, work_dir: &Path) -> MediaResult<TransformOutput> {
        let path = work_dir.join("raw.bin");
        tokio::fs::write(&path, vec![3u8; 11 * MIB]).await?;
        Ok(TransformOutput {
            artifacts: vec![Artifact {
                kind: ArtifactKind::Version {
                    label: "raw".to_string(),
                },
                path,
                content_type: "application/octet-stream".to_string(),
                width: 1,
                height: 1,
            }],
            ..Default::default()
        })
    }
}

/// Memory store that cancels the job as soon as a part reaches it.
struct CancelOnPart {
    inner: Arc<MemoryObjectStore>,
    cancel: CancellationToken,
}

#[async_trait]
impl ObjectStore for CancelOnPart {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()> {
        self.inner.put_object(key, body, content_type, metadata).await
    }

    async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        self.inner.put_file(path, key, content_type).await
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        self.inner.download_to_file(key, path).await
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.inner.delete_object(key).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<String> {
        self.inner
            .create_multipart_upload(key, content_type, metadata)
            .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String> {
        self.cancel.cancel();
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.inner.check_connectivity().await
    }
}

fn pipeline(
    temp: &tempfile::TempDir,
    store: Arc<dyn ObjectStore>,
    transport: Arc<MemoryTransport>,
    transformer: Arc<dyn MediaTransformer>,
) -> MediaPipeline {
    let config = WorkerConfig {
        temp_dir: temp.path().join("work"),
        ..WorkerConfig::default()
    };
    let tracker = Arc::new(TempFileTracker::new(&config.temp_dir));
    let limiter = Arc::new(ConcurrencyLimiter::new(transport.clone(), &config.max_jobs));
    MediaPipeline::new(&config, store, transport, tracker, limiter)
        .with_transformers(Transformers::standard().with(transformer))
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

fn image_job(size: u64) -> MediaJob {
    let request = RequestBody {
        s3_key: "u1/m1/photo.png".to_string(),
        original_filename: "photo.png".to_string(),
        mime_type: "image/png".to_string(),
        file_size: size,
        metadata: None,
        attempt: 0,
    };
    MediaJob::from_request(MediaType::Image, MediaId::from_string("m1"), "u1", &request)
}

fn assert_single_cancelled_result(transport: &MemoryTransport, media_id: &MediaId) {
    let updates: Vec<_> = transport
        .published_updates()
        .into_iter()
        .filter(|m| &m.media_id == media_id)
        .collect();
    let terminal = updates
        .iter()
        .filter(|m| matches!(m.body, MessageBody::Result(_) | MessageBody::Error(_)))
        .count();
    assert_eq!(terminal, 1);
    match &updates.last().unwrap().body {
        MessageBody::Result(body) => assert_eq!(body.status, JobStatus::Cancelled),
        other => panic!("expected result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_after_process_purges_outputs() {
    let temp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let transport = Arc::new(MemoryTransport::default());
    let cancel = CancellationToken::new();
    let transformer = Arc::new(CancelAfterTransform {
        inner: Arc::new(ImageTransformer::default()),
        cancel: cancel.clone(),
    });
    let pipeline = pipeline(&temp, store.clone(), transport.clone(), transformer);

    let data = png(300, 200);
    store.insert("u1/m1/photo.png", data.clone(), "image/png");
    let mut job = image_job(data.len() as u64);

    let outcome = pipeline.process(&mut job, &cancel).await;

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(outcome.reported);
    assert!(!store.contains("u1/m1/thumbnail.jpg"));
    assert_eq!(store.open_uploads(), 0);
    assert_eq!(pipeline.tracker().tracked_count(), 0);
    assert!(!pipeline.tracker().job_dir(&job.job_id).exists());
    assert_single_cancelled_result(&transport, &job.media_id);
}

#[tokio::test]
async fn test_cancel_during_multipart_upload_aborts_session() {
    let temp = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryObjectStore::new());
    let transport = Arc::new(MemoryTransport::default());
    let cancel = CancellationToken::new();
    let store = Arc::new(CancelOnPart {
        inner: memory.clone(),
        cancel: cancel.clone(),
    });
    let pipeline = pipeline(&temp, store, transport.clone(), Arc::new(LargeRendition));

    let data = png(64, 64);
    memory.insert("u1/m1/photo.png", data.clone(), "image/png");
    let mut job = image_job(data.len() as u64);

    let outcome = pipeline.process(&mut job, &cancel).await;

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(!memory.contains("u1/m1/versions/raw.bin"));
    assert_eq!(memory.open_uploads(), 0);
    assert_eq!(memory.aborted_uploads(), 1);
    assert_eq!(pipeline.tracker().tracked_count(), 0);
    assert!(!pipeline.tracker().job_dir(&job.job_id).exists());
    assert_single_cancelled_result(&transport, &job.media_id);
}
