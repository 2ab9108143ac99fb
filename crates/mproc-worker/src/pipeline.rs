//! Staged job processing: download, process, upload, cleanup.
//!
//! Stages run strictly in order per job. Every stage error is attributed to
//! its stage, the job's temp files are purged, and only then is the terminal
//! message published.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mproc_media::{ArtifactKind, TransformOutput, Transformers};
use mproc_models::{JobStatus, MediaJob, MediaOutput, QualityVersion, Stage};
use mproc_queue::{QueueTransport, UpdatePublisher};
use mproc_storage::{metadata_from_json, MultipartUploader, ObjectStore, UploadSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::WorkerConfig;
use crate::error::{StageContext, StageError, WorkerError, WorkerResult};
use crate::keys;
use crate::limiter::ConcurrencyLimiter;
use crate::logging::JobLogger;
use crate::temp_files::{FileRole, FileStage, TempFileTracker};
use crate::zip_batch::{BatchReport, ChildJob, ZipBatchExpander};

/// Terminal state of a processed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub output: Option<MediaOutput>,
    pub error: Option<String>,
    /// Whether the terminal message reached the update topic
    pub reported: bool,
}

/// Where a job's source file comes from.
#[derive(Debug, Clone)]
enum Source {
    /// Fetch `source_key` from the store
    Remote,
    /// Already on disk (archive entry); the original is persisted during upload
    Extracted(PathBuf),
}

pub struct MediaPipeline {
    store: Arc<dyn ObjectStore>,
    uploader: MultipartUploader,
    publisher: UpdatePublisher,
    tracker: Arc<TempFileTracker>,
    limiter: Arc<ConcurrencyLimiter>,
    transformers: Transformers,
    expander: ZipBatchExpander,
}

impl MediaPipeline {
    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn QueueTransport>,
        tracker: Arc<TempFileTracker>,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> Self {
        Self {
            uploader: MultipartUploader::new(store.clone(), config.upload.clone()),
            store,
            publisher: UpdatePublisher::new(transport),
            tracker,
            limiter,
            transformers: Transformers::standard(),
            expander: ZipBatchExpander::new(config),
        }
    }

    pub fn with_transformers(mut self, transformers: Transformers) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn tracker(&self) -> &Arc<TempFileTracker> {
        &self.tracker
    }

    pub fn publisher(&self) -> &UpdatePublisher {
        &self.publisher
    }

    /// Run a job to a terminal status and publish the terminal message.
    pub async fn process(&self, job: &mut MediaJob, cancel: &CancellationToken) -> JobOutcome {
        let span = JobLogger::new(job).create_span();
        async {
            if job.is_zip() {
                self.process_zip(job, cancel).await
            } else {
                self.process_single(job, Source::Remote, cancel).await
            }
        }
        .instrument(span)
        .await
    }

    async fn process_single(
        &self,
        job: &mut MediaJob,
        source: Source,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let logger = JobLogger::new(job);
        logger.log_start(&job.original_filename);
        metrics::counter!("mproc_jobs_started_total", "media_type" => job.media_type.as_str())
            .increment(1);

        let result = self.run_stages(job, &source, cancel).await;
        self.cleanup(job, &logger).await;

        match result {
            Ok(output) => self.complete(job, JobStatus::Completed, output, None, &logger).await,
            Err(e) => self.fail(job, e, None, &logger).await,
        }
    }

    async fn run_stages(
        &self,
        job: &mut MediaJob,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<MediaOutput, StageError> {
        job.transition(JobStatus::Processing).stage(Stage::Download)?;
        let work_dir = self
            .tracker
            .create_job_dir(&job.job_id)
            .await
            .stage(Stage::Download)?;

        // Stage 1: download
        checkpoint(cancel, Stage::Download)?;
        let input = match source {
            Source::Remote => {
                self.report(job, Stage::Download, 5, "Downloading source").await;
                self.download(job, &work_dir).await.stage(Stage::Download)?
            }
            Source::Extracted(path) => path.clone(),
        };

        // Stage 2: process
        checkpoint(cancel, Stage::Process)?;
        self.report(job, Stage::Process, 30, "Processing").await;
        let output = self.transform(job, &input, &work_dir).await.stage(Stage::Process)?;
        if matches!(source, Source::Remote) {
            self.tracker.mark_for_cleanup(&job.job_id, &input);
            self.tracker.cleanup_marked(&job.job_id).await;
        }

        // Stage 3: upload
        checkpoint(cancel, Stage::Upload)?;
        self.report(job, Stage::Upload, 60, "Uploading").await;
        self.upload(job, source, output, cancel)
            .await
            .stage(Stage::Upload)
    }

    async fn report(&self, job: &mut MediaJob, stage: Stage, progress: u8, message: &str) {
        job.set_progress(progress);
        self.publisher.progress(job, stage, job.progress, message).await;
    }

    async fn download(&self, job: &MediaJob, work_dir: &Path) -> WorkerResult<PathBuf> {
        let path = work_dir.join(format!("source{}", extension_of(&job.original_filename)));
        let result = self.store.download_to_file(&job.source_key, &path).await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.tracker
                .track(&job.job_id, &path, FileStage::Downloaded, FileRole::Input, "source")
                .await;
        }
        let bytes = result?;
        debug!(key = %job.source_key, bytes, "Downloaded source");
        Ok(path)
    }

    async fn transform(
        &self,
        job: &MediaJob,
        input: &Path,
        work_dir: &Path,
    ) -> WorkerResult<TransformOutput> {
        let transformer = self.transformers.get(job.media_type)?;
        let out_dir = work_dir.join("out");
        tokio::fs::create_dir_all(&out_dir).await?;

        let output = transformer.transform(input, &out_dir).await?;
        for artifact in &output.artifacts {
            self.tracker
                .track(
                    &job.job_id,
                    &artifact.path,
                    FileStage::Processed,
                    FileRole::Output,
                    artifact.label(),
                )
                .await;
        }
        Ok(output)
    }

    async fn upload(
        &self,
        job: &mut MediaJob,
        source: &Source,
        output: TransformOutput,
        cancel: &CancellationToken,
    ) -> WorkerResult<MediaOutput> {
        if let Source::Extracted(path) = source {
            let metadata = metadata_from_json(job.metadata.as_ref());
            self.put(path, &job.source_key, &job.mime_type, &metadata, cancel)
                .await?;
        }

        let mut result = MediaOutput {
            s3_key: job.source_key.clone(),
            width: output.width,
            height: output.height,
            duration: output.duration,
            metadata: output.metadata,
            ..Default::default()
        };

        let total = output.artifacts.len().max(1);
        for (i, artifact) in output.artifacts.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            let key = match &artifact.kind {
                ArtifactKind::Thumbnail => keys::thumbnail_key(&job.user_id, &job.media_id),
                ArtifactKind::Version { label } => {
                    keys::version_key(&job.user_id, &job.media_id, label, artifact.extension())
                }
            };
            let size = tokio::fs::metadata(&artifact.path).await?.len();
            self.put(&artifact.path, &key, &artifact.content_type, &HashMap::new(), cancel)
                .await?;
            self.tracker.mark_for_cleanup(&job.job_id, &artifact.path);

            match artifact.kind {
                ArtifactKind::Thumbnail => result.thumbnail_s3_key = Some(key),
                ArtifactKind::Version { label } => result.versions.push(QualityVersion {
                    label,
                    s3_key: key,
                    width: Some(artifact.width),
                    height: Some(artifact.height),
                    size,
                }),
            }

            let progress = 60 + (35 * (i + 1) / total) as u8;
            self.report(job, Stage::Upload, progress, "Uploaded artifact").await;
        }

        self.tracker.cleanup_marked(&job.job_id).await;
        Ok(result)
    }

    /// Upload one local file, forwarding chunk progress to the log.
    async fn put(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        let (tx, mut rx) = mpsc::channel(16);
        let upload = self.uploader.upload_file_in_chunks(
            UploadSource::Path(path.to_path_buf()),
            key,
            content_type,
            metadata,
            Some(tx),
            cancel,
        );
        let forward = async {
            while let Some(progress) = rx.recv().await {
                debug!(
                    key,
                    percentage = progress.percentage,
                    chunk = progress.current_chunk,
                    total_chunks = progress.total_chunks,
                    status = progress.status.as_str(),
                    "Upload progress"
                );
            }
        };
        let (result, ()) = tokio::join!(upload, forward);
        result?;
        Ok(())
    }

    /// Stage 4: unlink everything the job left behind.
    async fn cleanup(&self, job: &MediaJob, logger: &JobLogger) {
        let report = self.tracker.purge_job(&job.job_id).await;
        if report.failed > 0 {
            logger.log_warning(&format!("{} temp files could not be removed", report.failed));
        }
    }

    async fn complete(
        &self,
        job: &mut MediaJob,
        status: JobStatus,
        output: MediaOutput,
        error: Option<String>,
        logger: &JobLogger,
    ) -> JobOutcome {
        if let Err(e) = job.transition(status) {
            logger.log_warning(&e.to_string());
        }
        job.result = Some(output.clone());
        job.error = error.clone();

        let reported = match self
            .publisher
            .result(job, status, Some(output.clone()), error.clone())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                logger.log_warning(&format!("Failed to publish result: {e}"));
                false
            }
        };
        record_finished(job, status);
        logger.log_completion(status.as_str());
        JobOutcome {
            status,
            output: Some(output),
            error,
            reported,
        }
    }

    async fn fail(
        &self,
        job: &mut MediaJob,
        error: StageError,
        partial: Option<MediaOutput>,
        logger: &JobLogger,
    ) -> JobOutcome {
        let message = error.source.to_string();

        if error.source.is_cancelled() {
            if let Err(e) = job.transition(JobStatus::Cancelled) {
                logger.log_warning(&e.to_string());
            }
            let reported = self
                .publisher
                .result(job, JobStatus::Cancelled, partial.clone(), None)
                .await
                .is_ok();
            record_finished(job, JobStatus::Cancelled);
            logger.log_completion("cancelled");
            return JobOutcome {
                status: JobStatus::Cancelled,
                output: partial,
                error: None,
                reported,
            };
        }

        logger.log_error(error.stage, &message);
        if let Err(e) = job.transition(JobStatus::Failed) {
            logger.log_warning(&e.to_string());
        }
        job.error = Some(message.clone());

        let reported = match self
            .publisher
            .error(
                job,
                message.clone(),
                Some(error.stage.as_str().to_string()),
                error.source.is_retryable(),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                logger.log_warning(&format!("Failed to publish error: {e}"));
                false
            }
        };
        record_finished(job, JobStatus::Failed);
        JobOutcome {
            status: JobStatus::Failed,
            output: partial,
            error: Some(message),
            reported,
        }
    }

    async fn process_zip(&self, job: &mut MediaJob, cancel: &CancellationToken) -> JobOutcome {
        let logger = JobLogger::new(job);
        logger.log_start(&job.original_filename);
        metrics::counter!("mproc_jobs_started_total", "media_type" => job.media_type.as_str())
            .increment(1);

        let batch_id = match &job.batch_id {
            Some(id) => id.clone(),
            None => {
                let id = job.media_id.to_string();
                job.batch_id = Some(id.clone());
                id
            }
        };
        let result = self.run_zip(job, &batch_id, cancel).await;
        self.cleanup(job, &logger).await;

        let report = match result {
            Ok(report) => report,
            Err(e) => return self.fail(job, e, None, &logger).await,
        };

        let status = report.summary.final_status();
        let output = MediaOutput {
            s3_key: job.source_key.clone(),
            extracted_media: Some(report.extracted),
            batch: Some(report.summary.clone()),
            ..Default::default()
        };

        if cancel.is_cancelled() {
            let cancelled = StageError::new(Stage::Process, WorkerError::Cancelled);
            return self.fail(job, cancelled, Some(output), &logger).await;
        }
        match status {
            JobStatus::Failed => {
                let error = format!(
                    "all {} archive entries failed",
                    report.summary.total_processed
                );
                logger.log_error(Stage::Process, &error);
                self.complete(job, JobStatus::Failed, output, Some(error), &logger)
                    .await
            }
            status => self.complete(job, status, output, None, &logger).await,
        }
    }

    async fn run_zip(
        &self,
        job: &mut MediaJob,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, StageError> {
        job.transition(JobStatus::Extracting).stage(Stage::Download)?;
        let work_dir = self
            .tracker
            .create_job_dir(&job.job_id)
            .await
            .stage(Stage::Download)?;

        checkpoint(cancel, Stage::Download)?;
        self.report(job, Stage::Download, 5, "Downloading archive").await;
        let archive = self.download(job, &work_dir).await.stage(Stage::Download)?;

        checkpoint(cancel, Stage::Extract)?;
        self.report(job, Stage::Extract, 20, "Extracting archive").await;
        let scan = self
            .expander
            .extract(&archive, &work_dir.join("entries"))
            .await
            .stage(Stage::Extract)?;
        for entry in &scan.entries {
            self.tracker
                .track(
                    &job.job_id,
                    &entry.path,
                    FileStage::Processed,
                    FileRole::Output,
                    entry.filename.as_str(),
                )
                .await;
        }
        self.tracker.mark_for_cleanup(&job.job_id, &archive);
        self.tracker.cleanup_marked(&job.job_id).await;

        job.transition(JobStatus::Extracted).stage(Stage::Extract)?;
        job.set_progress(30);
        self.publisher
            .extraction(job, &scan.progress(JobStatus::Extracted))
            .await;

        checkpoint(cancel, Stage::Process)?;
        job.transition(JobStatus::Processing).stage(Stage::Process)?;
        let children = self.expander.plan_children(job, batch_id, &scan);
        let parent_job_id = job.job_id.clone();

        let (tx, mut rx) = mpsc::channel(32);
        let run = self.expander.run_children(batch_id, &scan, children, cancel, Some(tx), |child| {
            self.run_child(&parent_job_id, child, cancel)
        });
        let parent: &MediaJob = job;
        let forward = async {
            while let Some((finished, total)) = rx.recv().await {
                let progress = 30 + (65 * finished / total.max(1)) as u8;
                self.publisher
                    .progress(
                        parent,
                        Stage::Process,
                        progress,
                        format!("{finished}/{total} entries processed"),
                    )
                    .await;
            }
        };
        let (report, ()) = tokio::join!(run, forward);
        Ok(report)
    }

    /// Process one archive entry as its own job.
    ///
    /// Children hold a slot of their media type's limiter and are not
    /// cancelled with the parent once started.
    async fn run_child(
        &self,
        parent_job_id: &mproc_models::JobId,
        child: ChildJob,
        parent_cancel: &CancellationToken,
    ) -> JobOutcome {
        let ChildJob { mut job, source } = child;
        let token = self.limiter.acquire(job.media_type, &job.job_id).await;

        let outcome = if parent_cancel.is_cancelled() {
            JobOutcome {
                status: JobStatus::Cancelled,
                output: None,
                error: None,
                reported: false,
            }
        } else {
            let span = JobLogger::new(&job).create_span();
            self.process_single(&mut job, Source::Extracted(source.clone()), &CancellationToken::new())
                .instrument(span)
                .await
        };

        self.limiter.finish_job(token).await;
        self.tracker.mark_for_cleanup(parent_job_id, &source);
        self.tracker.cleanup_marked(parent_job_id).await;
        outcome
    }
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        return Err(StageError::new(stage, WorkerError::Cancelled));
    }
    Ok(())
}

fn record_finished(job: &MediaJob, status: JobStatus) {
    metrics::counter!(
        "mproc_jobs_finished_total",
        "media_type" => job.media_type.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

/// `.ext` of a filename, or empty.
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}
