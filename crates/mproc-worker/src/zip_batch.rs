//! Archive expansion into child jobs.
//!
//! An archive is extracted once; each entry classified as image, video or
//! document becomes a child job sharing the parent's batch ID. Unsupported,
//! hidden and unsafe entries are skipped and never submitted.

use std::fs::File;
use std::future::Future;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use futures::stream::{self, StreamExt};
use mproc_models::{
    BatchSummary, EntryError, EntryKind, ExtractedMedia, JobStatus, MediaJob, ZipExtractionProgress,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::keys;
use crate::pipeline::JobOutcome;

/// Names skipped wherever they appear in an entry path.
const SYSTEM_NAMES: &[&str] = &["__MACOSX", "Thumbs.db", "desktop.ini"];

/// A supported entry written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntry {
    /// Path inside the archive
    pub filename: String,
    /// Extracted file
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mime_type: String,
    pub size: u64,
}

/// Result of scanning an archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub entries: Vec<ExtractedEntry>,
    /// File entries in the archive; directories are not counted
    pub total_files: u32,
    pub skipped: u32,
    /// Supported entries that could not be extracted
    pub unreadable: Vec<EntryError>,
}

impl ScanResult {
    pub fn progress(&self, status: JobStatus) -> ZipExtractionProgress {
        ZipExtractionProgress {
            status,
            total_files: self.total_files,
            media_files: (self.entries.len() + self.unreadable.len()) as u32,
            skipped_files: self.skipped,
        }
    }
}

/// A child job and the extracted file it processes.
#[derive(Debug, Clone)]
pub struct ChildJob {
    pub job: MediaJob,
    pub source: PathBuf,
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub extracted: Vec<ExtractedMedia>,
    /// Children that never started because the parent was cancelled
    pub cancelled: u32,
}

#[derive(Debug, Clone)]
pub struct ZipBatchExpander {
    max_entries: usize,
    max_entry_size: u64,
    child_concurrency: usize,
    max_batch_errors: usize,
}

impl ZipBatchExpander {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            max_entries: config.max_zip_entries,
            max_entry_size: config.upload.max_file_size,
            child_concurrency: config.zip_child_concurrency.max(1),
            max_batch_errors: config.max_batch_errors,
        }
    }

    /// Extract supported entries of `archive` into `out_dir`.
    pub async fn extract(&self, archive: &Path, out_dir: &Path) -> WorkerResult<ScanResult> {
        let this = self.clone();
        let archive = archive.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        tokio::task::spawn_blocking(move || this.scan(&archive, &out_dir))
            .await
            .map_err(|e| WorkerError::processing_failed(format!("extraction task failed: {e}")))?
    }

    fn scan(&self, archive: &Path, out_dir: &Path) -> WorkerResult<ScanResult> {
        let file = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file))
            .map_err(|e| WorkerError::invalid_archive(e.to_string()))?;
        if zip.len() > self.max_entries {
            return Err(WorkerError::invalid_archive(format!(
                "archive has {} entries, limit is {}",
                zip.len(),
                self.max_entries
            )));
        }
        std::fs::create_dir_all(out_dir)?;

        let mut result = ScanResult::default();
        for index in 0..zip.len() {
            let mut entry = match zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, "Unreadable archive entry: {}", e);
                    result.total_files += 1;
                    result.skipped += 1;
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            result.total_files += 1;

            let Some(name) = entry.enclosed_name().map(Path::to_path_buf) else {
                warn!(entry = entry.name(), "Skipping entry with unsafe path");
                result.skipped += 1;
                continue;
            };
            if is_hidden(&name) {
                debug!(entry = %name.display(), "Skipping hidden entry");
                result.skipped += 1;
                continue;
            }

            let filename = name.to_string_lossy().replace('\\', "/");
            let by_extension = EntryKind::from_filename(&filename);
            if entry.size() > self.max_entry_size {
                warn!(entry = %filename, size = entry.size(), "Entry too large");
                match by_extension {
                    Some(_) => result.unreadable.push(EntryError {
                        filename,
                        error: format!("entry exceeds {} bytes", self.max_entry_size),
                    }),
                    None => result.skipped += 1,
                }
                continue;
            }

            let base = name
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "entry".to_string());
            let target = out_dir.join(format!("{index:05}-{base}"));
            let written = File::create(&target).and_then(|mut out| {
                std::io::copy(&mut (&mut entry).take(self.max_entry_size), &mut out)
            });
            let size = match written {
                Ok(size) => size,
                Err(e) => {
                    let _ = std::fs::remove_file(&target);
                    warn!(entry = %filename, "Failed to extract entry: {}", e);
                    match by_extension {
                        Some(_) => result.unreadable.push(EntryError {
                            filename,
                            error: e.to_string(),
                        }),
                        None => result.skipped += 1,
                    }
                    continue;
                }
            };

            let sniffed = infer::get_from_path(&target)
                .ok()
                .flatten()
                .map(|t| t.mime_type());
            let kind = by_extension.or_else(|| sniffed.and_then(EntryKind::from_mime));
            let Some(kind) = kind else {
                debug!(entry = %filename, "Skipping unsupported entry");
                let _ = std::fs::remove_file(&target);
                result.skipped += 1;
                continue;
            };
            let mime_type = sniffed
                .filter(|m| EntryKind::from_mime(m) == Some(kind))
                .map(str::to_string)
                .unwrap_or_else(|| EntryKind::content_type_for(&filename).to_string());

            result.entries.push(ExtractedEntry {
                filename,
                path: target,
                kind,
                mime_type,
                size,
            });
        }

        info!(
            archive = %archive.display(),
            total_files = result.total_files,
            media_files = result.entries.len(),
            skipped = result.skipped,
            "Scanned archive"
        );
        Ok(result)
    }

    /// One child job per extracted entry, keyed under the parent's batch.
    pub fn plan_children(&self, parent: &MediaJob, batch_id: &str, scan: &ScanResult) -> Vec<ChildJob> {
        scan.entries
            .iter()
            .map(|entry| {
                let mut job = MediaJob::child_of(
                    parent,
                    entry.kind.media_type(),
                    String::new(),
                    entry.filename.clone(),
                    entry.mime_type.clone(),
                    entry.size,
                )
                .with_batch_id(batch_id);
                job.source_key = keys::entry_key(&job.user_id, batch_id, &job.media_id, &entry.filename);
                ChildJob {
                    job,
                    source: entry.path.clone(),
                }
            })
            .collect()
    }

    /// Run children with bounded concurrency and aggregate their outcomes.
    ///
    /// Once `parent_cancel` fires, children that have not started are
    /// dropped; running children finish normally. `progress` receives
    /// `(finished, total)` after each child.
    pub async fn run_children<F, Fut>(
        &self,
        batch_id: &str,
        scan: &ScanResult,
        children: Vec<ChildJob>,
        parent_cancel: &CancellationToken,
        progress: Option<mpsc::Sender<(u32, u32)>>,
        run: F,
    ) -> BatchReport
    where
        F: Fn(ChildJob) -> Fut,
        Fut: Future<Output = JobOutcome>,
    {
        let mut summary = BatchSummary::new(batch_id).with_error_limit(self.max_batch_errors);
        summary.total_files = scan.total_files;
        for _ in 0..scan.skipped {
            summary.record_skip();
        }
        for failure in &scan.unreadable {
            summary.record_failure(failure.filename.clone(), failure.error.clone());
        }

        let total = children.len() as u32;
        let run = &run;
        let mut outcomes = stream::iter(children)
            .map(|child| async move {
                let media = ExtractedMedia {
                    media_id: child.job.media_id.clone(),
                    filename: child.job.original_filename.clone(),
                    media_type: child.job.media_type,
                    status: JobStatus::Cancelled,
                    s3_key: None,
                    thumbnail_s3_key: None,
                };
                if parent_cancel.is_cancelled() {
                    return (media, None);
                }
                let outcome = run(child).await;
                (media, Some(outcome))
            })
            .buffer_unordered(self.child_concurrency);

        let mut report = BatchReport {
            summary,
            extracted: Vec::with_capacity(total as usize),
            cancelled: 0,
        };
        let mut finished = 0;
        while let Some((mut media, outcome)) = outcomes.next().await {
            finished += 1;
            match outcome {
                Some(outcome) if outcome.status != JobStatus::Cancelled => {
                    media.status = outcome.status;
                    if outcome.status == JobStatus::Completed {
                        report.summary.record_success();
                        if let Some(output) = &outcome.output {
                            media.s3_key = Some(output.s3_key.clone());
                            media.thumbnail_s3_key = output.thumbnail_s3_key.clone();
                        }
                    } else {
                        report.summary.record_failure(
                            media.filename.clone(),
                            outcome.error.unwrap_or_else(|| outcome.status.to_string()),
                        );
                    }
                }
                _ => report.cancelled += 1,
            }
            report.extracted.push(media);
            if let Some(tx) = &progress {
                let _ = tx.send((finished, total)).await;
            }
        }

        report
    }
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || SYSTEM_NAMES.contains(&part.as_ref())
        }
        _ => false,
    })
}
