//! Multipart upload sessions and chunk plans.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One planned part of a multipart upload. Byte range is `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    /// 1-based part number
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl ChunkPlan {
    /// Split `file_size` bytes into fixed `chunk_size` parts; the last part
    /// takes the remainder. An empty file yields no parts.
    pub fn plan(file_size: u64, chunk_size: u64) -> Vec<ChunkPlan> {
        if file_size == 0 || chunk_size == 0 {
            return Vec::new();
        }

        let count = file_size.div_ceil(chunk_size);
        (0..count)
            .map(|i| {
                let start = i * chunk_size;
                let end = (start + chunk_size).min(file_size);
                ChunkPlan {
                    part_number: (i + 1) as u32,
                    start,
                    end,
                    size: end - start,
                }
            })
            .collect()
    }
}

/// A part the store has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub e_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    #[default]
    Pending,
    Uploading,
    Completed,
    Failed,
    Aborted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Aborted
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadSessionError {
    #[error("Upload session {upload_id} is already {status}")]
    Closed { upload_id: String, status: UploadStatus },

    #[error("Part {part_number} is not in the plan (1..={planned})")]
    UnknownPart { part_number: u32, planned: u32 },

    #[error("Upload is missing parts: {0:?}")]
    MissingParts(Vec<u32>),
}

/// One in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub key: String,
    pub content_type: String,
    pub file_size: u64,
    /// Fixed plan computed once from the file size
    pub chunks: Vec<ChunkPlan>,
    /// Parts acknowledged so far, in arrival order
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    #[serde(default)]
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        key: impl Into<String>,
        content_type: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            content_type: content_type.into(),
            file_size,
            chunks: ChunkPlan::plan(file_size, chunk_size),
            parts: Vec::new(),
            status: UploadStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_parts(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Planned chunk for a part number.
    pub fn chunk(&self, part_number: u32) -> Option<&ChunkPlan> {
        self.chunks.iter().find(|c| c.part_number == part_number)
    }

    /// Record an acknowledged part. Re-uploading a part replaces its ETag.
    pub fn record_part(
        &mut self,
        part_number: u32,
        e_tag: impl Into<String>,
    ) -> Result<(), UploadSessionError> {
        self.ensure_open()?;
        if part_number == 0 || part_number > self.total_parts() {
            return Err(UploadSessionError::UnknownPart {
                part_number,
                planned: self.total_parts(),
            });
        }

        let e_tag = e_tag.into();
        match self.parts.iter_mut().find(|p| p.part_number == part_number) {
            Some(existing) => existing.e_tag = e_tag,
            None => self.parts.push(CompletedPart { part_number, e_tag }),
        }
        self.status = UploadStatus::Uploading;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Planned part numbers without a recorded ETag.
    pub fn missing_parts(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .map(|c| c.part_number)
            .filter(|n| !self.parts.iter().any(|p| p.part_number == *n))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts().is_empty()
    }

    /// Recorded parts sorted by part number.
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Parts ready for completion, or the list of missing ones.
    pub fn parts_for_completion(&self) -> Result<Vec<CompletedPart>, UploadSessionError> {
        self.ensure_open()?;
        let missing = self.missing_parts();
        if !missing.is_empty() {
            return Err(UploadSessionError::MissingParts(missing));
        }
        Ok(self.sorted_parts())
    }

    pub fn mark(&mut self, status: UploadStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.parts
            .iter()
            .filter_map(|p| self.chunk(p.part_number))
            .map(|c| c.size)
            .sum()
    }

    fn ensure_open(&self) -> Result<(), UploadSessionError> {
        if self.status.is_terminal() {
            return Err(UploadSessionError::Closed {
                upload_id: self.upload_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Progress report sent after each completed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    /// Percentage (0-100)
    pub percentage: u8,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub status: UploadStatus,
}

impl UploadProgress {
    pub fn new(
        bytes_uploaded: u64,
        total_bytes: u64,
        current_chunk: u32,
        total_chunks: u32,
        status: UploadStatus,
    ) -> Self {
        let percentage = if total_bytes == 0 {
            100
        } else {
            ((bytes_uploaded.min(total_bytes) * 100) / total_bytes) as u8
        };
        Self {
            bytes_uploaded,
            total_bytes,
            percentage,
            current_chunk,
            total_chunks,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_twelve_mb_in_five_mb_chunks() {
        let plan = ChunkPlan::plan(12 * MB, 5 * MB);
        let sizes: Vec<u64> = plan.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![5 * MB, 5 * MB, 2 * MB]);
        assert_eq!(plan.iter().map(|c| c.part_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(plan[2].end, 12 * MB);
    }

    #[test]
    fn test_plan_sizes_sum_to_file_size() {
        for size in [1, 5 * MB - 1, 5 * MB, 5 * MB + 1, 23 * MB + 17] {
            let plan = ChunkPlan::plan(size, 5 * MB);
            assert_eq!(plan.iter().map(|c| c.size).sum::<u64>(), size);
            for chunk in &plan[..plan.len() - 1] {
                assert_eq!(chunk.size, 5 * MB);
            }
            for (i, chunk) in plan.iter().enumerate() {
                assert_eq!(chunk.part_number, i as u32 + 1);
            }
        }
        assert!(ChunkPlan::plan(0, 5 * MB).is_empty());
    }

    #[test]
    fn test_session_requires_every_part() {
        let mut session = UploadSession::new("up-1", "k", "video/mp4", 12 * MB, 5 * MB);
        session.record_part(3, "etag-3").unwrap();
        session.record_part(1, "etag-1").unwrap();
        assert_eq!(session.missing_parts(), vec![2]);
        assert!(matches!(
            session.parts_for_completion(),
            Err(UploadSessionError::MissingParts(_))
        ));

        session.record_part(2, "etag-2").unwrap();
        let parts = session.parts_for_completion().unwrap();
        assert_eq!(parts.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(session.bytes_uploaded(), 12 * MB);
    }

    #[test]
    fn test_session_rejects_unknown_and_closed() {
        let mut session = UploadSession::new("up-1", "k", "image/png", 6 * MB, 5 * MB);
        assert!(matches!(
            session.record_part(3, "x"),
            Err(UploadSessionError::UnknownPart { .. })
        ));
        session.mark(UploadStatus::Aborted);
        assert!(matches!(
            session.record_part(1, "x"),
            Err(UploadSessionError::Closed { .. })
        ));
    }

    #[test]
    fn test_progress_percentage() {
        let progress = UploadProgress::new(5 * MB, 12 * MB, 1, 3, UploadStatus::Uploading);
        assert_eq!(progress.percentage, 41);
    }
}
