//! Upload sessions tracked between HTTP calls.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mproc_models::{CompletedPart, UploadSession, UploadSessionError};
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// In-process registry of multipart upload sessions keyed by upload ID.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, UploadSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: UploadSession) {
        debug!(upload_id = %session.upload_id, key = %session.key, parts = session.total_parts(), "Upload session opened");
        self.sessions.insert(session.upload_id.clone(), session);
    }

    pub fn get(&self, upload_id: &str) -> Option<UploadSession> {
        self.sessions.get(upload_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Fetch a session and check it belongs to `key`.
    pub fn get_for_key(&self, upload_id: &str, key: &str) -> ApiResult<UploadSession> {
        let session = self
            .get(upload_id)
            .ok_or_else(|| ApiError::not_found(format!("upload session {upload_id}")))?;
        if session.key != key {
            return Err(ApiError::bad_request(format!(
                "upload session {upload_id} does not belong to key {key}"
            )));
        }
        Ok(session)
    }

    /// Record an acknowledged part.
    pub fn record_part(&self, upload_id: &str, part_number: u32, e_tag: &str) -> ApiResult<()> {
        let mut session = self
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| ApiError::not_found(format!("upload session {upload_id}")))?;
        session.record_part(part_number, e_tag)?;
        Ok(())
    }

    /// Parts for completion, after checking any client-supplied list against
    /// what this registry recorded.
    pub fn completion_parts(
        &self,
        upload_id: &str,
        claimed: &[CompletedPart],
    ) -> ApiResult<Vec<CompletedPart>> {
        let session = self
            .get(upload_id)
            .ok_or_else(|| ApiError::not_found(format!("upload session {upload_id}")))?;
        let parts = session.parts_for_completion()?;

        for part in claimed {
            match parts.iter().find(|p| p.part_number == part.part_number) {
                Some(recorded) if recorded.e_tag == part.e_tag => {}
                Some(_) => {
                    return Err(ApiError::bad_request(format!(
                        "ETag mismatch for part {}",
                        part.part_number
                    )))
                }
                None => {
                    return Err(UploadSessionError::UnknownPart {
                        part_number: part.part_number,
                        planned: session.total_parts(),
                    }
                    .into())
                }
            }
        }
        Ok(parts)
    }

    pub fn remove(&self, upload_id: &str) -> Option<UploadSession> {
        self.sessions.remove(upload_id).map(|(_, s)| s)
    }

    /// Open sessions not updated within `ttl`, oldest first.
    pub fn stale(&self, ttl: Duration) -> Vec<UploadSession> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Vec::new();
        };
        let mut stale: Vec<UploadSession> = self
            .sessions
            .iter()
            .filter(|s| !s.status.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.value().clone())
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale
    }
}
