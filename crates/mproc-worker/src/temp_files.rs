//! Ledger of the local files each job writes.
//!
//! Every file a stage writes is tracked under its job. Consuming stages mark
//! records for cleanup; [`TempFileTracker::cleanup_marked`] unlinks those and
//! [`TempFileTracker::purge_job`] unlinks everything once the job is terminal.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mproc_models::JobId;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Stage that produced a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStage {
    Downloaded,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Input,
    Output,
}

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TempFileRecord {
    pub job_id: JobId,
    pub path: PathBuf,
    pub stage: FileStage,
    pub role: FileRole,
    pub description: String,
    /// Size when tracked
    pub size: u64,
    pub marked_for_cleanup: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub bytes: u64,
    pub failed: usize,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.bytes += other.bytes;
        self.failed += other.failed;
    }
}

/// Tracks temp files per job.
#[derive(Debug)]
pub struct TempFileTracker {
    root: PathBuf,
    records: DashMap<JobId, Vec<TempFileRecord>>,
}

impl TempFileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a job's files.
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    pub async fn create_job_dir(&self, job_id: &JobId) -> std::io::Result<PathBuf> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Record a file a stage has written. Tracking the same path again
    /// replaces its record.
    pub async fn track(
        &self,
        job_id: &JobId,
        path: impl Into<PathBuf>,
        stage: FileStage,
        role: FileRole,
        description: impl Into<String>,
    ) -> TempFileRecord {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let record = TempFileRecord {
            job_id: job_id.clone(),
            path,
            stage,
            role,
            description: description.into(),
            size,
            marked_for_cleanup: false,
            created_at: Utc::now(),
        };
        debug!(
            job_id = %job_id,
            path = %record.path.display(),
            stage = ?stage,
            role = ?role,
            size,
            "Tracking temp file"
        );

        let mut entry = self.records.entry(job_id.clone()).or_default();
        entry.retain(|r| r.path != record.path);
        entry.push(record.clone());
        record
    }

    /// Flag a file as no longer needed. Returns false if it is not tracked.
    pub fn mark_for_cleanup(&self, job_id: &JobId, path: &Path) -> bool {
        self.records
            .get_mut(job_id)
            .and_then(|mut records| {
                records
                    .iter_mut()
                    .find(|r| r.path == path)
                    .map(|r| r.marked_for_cleanup = true)
            })
            .is_some()
    }

    /// Flag every file of a job produced by `stage`.
    pub fn mark_stage_for_cleanup(&self, job_id: &JobId, stage: FileStage) -> usize {
        self.records
            .get_mut(job_id)
            .map(|mut records| {
                records
                    .iter_mut()
                    .filter(|r| r.stage == stage)
                    .map(|r| r.marked_for_cleanup = true)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn records(&self, job_id: &JobId) -> Vec<TempFileRecord> {
        self.records
            .get(job_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Total tracked bytes for a job.
    pub fn job_size(&self, job_id: &JobId) -> u64 {
        self.records
            .get(job_id)
            .map(|r| r.iter().map(|r| r.size).sum())
            .unwrap_or(0)
    }

    pub fn files_in_stage(&self, job_id: &JobId, stage: FileStage) -> Vec<TempFileRecord> {
        self.filtered(job_id, |r| r.stage == stage)
    }

    pub fn files_by_role(&self, job_id: &JobId, role: FileRole) -> Vec<TempFileRecord> {
        self.filtered(job_id, |r| r.role == role)
    }

    fn filtered(&self, job_id: &JobId, keep: impl Fn(&TempFileRecord) -> bool) -> Vec<TempFileRecord> {
        self.records
            .get(job_id)
            .map(|r| r.iter().filter(|&r| keep(r)).cloned().collect())
            .unwrap_or_default()
    }

    /// Files tracked across all jobs.
    pub fn tracked_count(&self) -> usize {
        self.records.iter().map(|e| e.value().len()).sum()
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    /// Unlink the files of a job that were marked for cleanup.
    pub async fn cleanup_marked(&self, job_id: &JobId) -> CleanupReport {
        let marked: Vec<TempFileRecord> = match self.records.get_mut(job_id) {
            Some(mut records) => {
                let (marked, keep) = records.drain(..).partition(|r| r.marked_for_cleanup);
                *records = keep;
                marked
            }
            None => return CleanupReport::default(),
        };
        self.records.remove_if(job_id, |_, records| records.is_empty());
        unlink_all(&marked).await
    }

    /// Unlink every file of a job and forget it.
    pub async fn purge_job(&self, job_id: &JobId) -> CleanupReport {
        let records = self
            .records
            .remove(job_id)
            .map(|(_, records)| records)
            .unwrap_or_default();
        let mut report = unlink_all(&records).await;

        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(job_id = %job_id, dir = %dir.display(), "Failed to remove job dir: {}", e);
                report.failed += 1;
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                job_id = %job_id,
                removed = report.removed,
                bytes = report.bytes,
                failed = report.failed,
                "Purged temp files"
            );
        }
        metrics::counter!("mproc_temp_bytes_removed_total").increment(report.bytes);
        report
    }

    /// Remove leftovers under the root that belong to no tracked job.
    ///
    /// Run at start-up, before any job is accepted.
    pub async fn sweep_orphans(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.root).await?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.records.contains_key(&JobId::from_string(name.as_str())) {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to remove orphan: {}", e),
            }
        }
        if removed > 0 {
            info!(removed, root = %self.root.display(), "Swept orphaned temp files");
        }
        Ok(removed)
    }
}

async fn unlink_all(records: &[TempFileRecord]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for record in records {
        report.merge(unlink(record).await);
    }
    report
}

async fn unlink(record: &TempFileRecord) -> CleanupReport {
    match tokio::fs::remove_file(&record.path).await {
        Ok(()) => CleanupReport {
            removed: 1,
            bytes: record.size,
            failed: 0,
        },
        // Already gone counts as removed.
        Err(e) if e.kind() == ErrorKind::NotFound => CleanupReport {
            removed: 1,
            bytes: 0,
            failed: 0,
        },
        Err(e) => {
            warn!(
                job_id = %record.job_id,
                path = %record.path.display(),
                "Failed to remove temp file: {}", e
            );
            CleanupReport {
                removed: 0,
                bytes: 0,
                failed: 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(tracker: &TempFileTracker, job: &JobId, name: &str, len: usize) -> PathBuf {
        let dir = tracker.create_job_dir(job).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, vec![0u8; len]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_queries() {
        let root = tempfile::tempdir().unwrap();
        let tracker = TempFileTracker::new(root.path());
        let job = JobId::new();

        let source = write(&tracker, &job, "source.png", 100).await;
        let thumb = write(&tracker, &job, "thumbnail.jpg", 20).await;
        tracker
            .track(&job, &source, FileStage::Downloaded, FileRole::Input, "source")
            .await;
        tracker
            .track(&job, &thumb, FileStage::Processed, FileRole::Output, "thumbnail")
            .await;

        assert_eq!(tracker.job_size(&job), 120);
        assert_eq!(tracker.tracked_count(), 2);
        assert_eq!(tracker.files_in_stage(&job, FileStage::Downloaded).len(), 1);
        assert_eq!(tracker.files_by_role(&job, FileRole::Output)[0].path, thumb);

        // Re-tracking a path keeps one record.
        tracker
            .track(&job, &thumb, FileStage::Processed, FileRole::Output, "thumbnail again")
            .await;
        assert_eq!(tracker.tracked_count(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_marked_leaves_unmarked() {
        let root = tempfile::tempdir().unwrap();
        let tracker = TempFileTracker::new(root.path());
        let job = JobId::new();

        let source = write(&tracker, &job, "source.mp4", 10).await;
        let thumb = write(&tracker, &job, "thumbnail.jpg", 5).await;
        tracker
            .track(&job, &source, FileStage::Downloaded, FileRole::Input, "source")
            .await;
        tracker
            .track(&job, &thumb, FileStage::Processed, FileRole::Output, "thumbnail")
            .await;

        assert!(tracker.mark_for_cleanup(&job, &thumb));
        assert!(!tracker.mark_for_cleanup(&job, Path::new("/nope")));

        let report = tracker.cleanup_marked(&job).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes, 5);
        assert!(!thumb.exists());
        assert!(source.exists());
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let tracker = TempFileTracker::new(root.path());
        let job = JobId::new();

        let source = write(&tracker, &job, "source.zip", 10).await;
        tracker
            .track(&job, &source, FileStage::Downloaded, FileRole::Input, "source")
            .await;
        // Untracked stray file in the job dir goes too.
        write(&tracker, &job, "partial.tmp", 3).await;

        let report = tracker.purge_job(&job).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(!tracker.job_dir(&job).exists());
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_orphans_keeps_tracked_jobs() {
        let root = tempfile::tempdir().unwrap();
        let tracker = TempFileTracker::new(root.path());
        let live = JobId::new();
        let path = write(&tracker, &live, "source.png", 1).await;
        tracker
            .track(&live, &path, FileStage::Downloaded, FileRole::Input, "source")
            .await;

        std::fs::create_dir_all(root.path().join("dead-job")).unwrap();
        std::fs::write(root.path().join("dead-job/source.png"), b"x").unwrap();
        std::fs::write(root.path().join("stray.bin"), b"x").unwrap();

        assert_eq!(tracker.sweep_orphans().await.unwrap(), 2);
        assert!(path.exists());
        assert!(!root.path().join("dead-job").exists());
    }
}
