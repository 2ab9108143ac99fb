//! Multipart upload handlers.
//!
//! The client drives the upload: it opens a session, sends each planned part
//! as a raw body, then completes or aborts. The registry keeps the fixed
//! chunk plan between calls so completion is checked before the store sees it.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use bytes::Bytes;
use mproc_models::{ChunkPlan, CompletedPart, UploadSession, UploadSessionError};
use mproc_storage::StorageError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    #[validate(length(min = 1, max = 1024))]
    pub key: String,
    #[validate(length(min = 1, max = 255))]
    pub content_type: String,
    #[validate(range(min = 1))]
    pub file_size: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub upload_id: String,
    pub key: String,
    pub chunk_size: u64,
    pub parts: Vec<ChunkPlan>,
}

#[derive(Debug, Deserialize)]
pub struct PartQuery {
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartResponse {
    pub part_number: u32,
    pub e_tag: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    #[validate(length(min = 1))]
    pub upload_id: String,
    #[validate(length(min = 1, max = 1024))]
    pub key: String,
    /// Parts as the client saw them; checked against the recorded ETags
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub key: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    #[validate(length(min = 1))]
    pub upload_id: String,
    #[validate(length(min = 1, max = 1024))]
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct AbortUploadResponse {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: UploadSession,
    pub missing_parts: Vec<u32>,
    pub bytes_uploaded: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleQuery {
    pub older_than_secs: Option<u64>,
}

/// Reject keys that could escape the caller's prefix.
fn check_key(key: &str) -> ApiResult<()> {
    if key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ApiError::bad_request(format!("invalid object key: {key}")));
    }
    Ok(())
}

/// Open a multipart upload session.
pub async fn initiate_upload(
    State(state): State<AppState>,
    payload: Result<Json<InitiateUploadRequest>, JsonRejection>,
) -> ApiResult<Json<InitiateUploadResponse>> {
    let Json(request) = payload?;
    request.validate()?;
    check_key(&request.key)?;

    let config = state.upload_config();
    if request.file_size > config.max_file_size {
        return Err(StorageError::FileTooLarge {
            size: request.file_size,
            max: config.max_file_size,
        }
        .into());
    }
    let chunk_size = config.chunk_size;
    let planned = request.file_size.div_ceil(chunk_size);
    if planned > u64::from(config.max_parts) {
        return Err(ApiError::bad_request(format!(
            "file needs {planned} parts, store allows {}",
            config.max_parts
        )));
    }

    let upload_id = state
        .uploader
        .initiate_multipart_upload(&request.key, &request.content_type, &request.metadata)
        .await?;
    let session = UploadSession::new(
        upload_id.clone(),
        request.key.clone(),
        request.content_type,
        request.file_size,
        chunk_size,
    );
    let parts = session.chunks.clone();
    state.sessions.insert(session);
    metrics::record_upload_session("initiated");

    info!(
        upload_id = %upload_id,
        key = %request.key,
        file_size = request.file_size,
        total_parts = parts.len(),
        "Multipart upload initiated"
    );

    Ok(Json(InitiateUploadResponse {
        upload_id,
        key: request.key,
        chunk_size,
        parts,
    }))
}

/// Upload one planned part. The body is the raw chunk bytes.
///
/// A part that still fails after its retries aborts the whole upload.
pub async fn upload_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    query: Result<Query<PartQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Json<UploadPartResponse>> {
    let Query(PartQuery { key }) = query?;
    let session = state.sessions.get_for_key(&upload_id, &key)?;
    if session.status.is_terminal() {
        return Err(UploadSessionError::Closed {
            upload_id,
            status: session.status,
        }
        .into());
    }

    let chunk = session.chunk(part_number).ok_or(UploadSessionError::UnknownPart {
        part_number,
        planned: session.total_parts(),
    })?;
    if body.len() as u64 != chunk.size {
        return Err(ApiError::bad_request(format!(
            "part {part_number} must be {} bytes, got {}",
            chunk.size,
            body.len()
        )));
    }

    let size = body.len();
    let part = match state
        .uploader
        .upload_chunk(&key, &upload_id, part_number, body)
        .await
    {
        Ok(part) => part,
        Err(e) => {
            // A part that cannot be stored ends the session.
            warn!(upload_id = %upload_id, part_number, "Part upload failed, aborting: {}", e);
            state.uploader.abort_multipart_upload(&key, &upload_id).await;
            state.sessions.remove(&upload_id);
            metrics::record_upload_session("failed");
            return Err(e.into());
        }
    };
    state
        .sessions
        .record_part(&upload_id, part.part_number, &part.e_tag)?;
    metrics::record_upload_part(size);

    Ok(Json(UploadPartResponse {
        part_number: part.part_number,
        e_tag: part.e_tag,
    }))
}

/// Complete a session once every planned part is recorded.
pub async fn complete_upload(
    State(state): State<AppState>,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let Json(request) = payload?;
    request.validate()?;
    state.sessions.get_for_key(&request.upload_id, &request.key)?;

    let parts = state
        .sessions
        .completion_parts(&request.upload_id, &request.parts)?;

    match state
        .uploader
        .complete_multipart_upload(&request.key, &request.upload_id, parts)
        .await
    {
        Ok(key) => {
            state.sessions.remove(&request.upload_id);
            metrics::record_upload_session("completed");
            info!(upload_id = %request.upload_id, key = %key, "Multipart upload completed");
            Ok(Json(CompleteUploadResponse { key }))
        }
        Err(e) => {
            warn!(upload_id = %request.upload_id, "Completion failed, aborting: {}", e);
            state
                .uploader
                .abort_multipart_upload(&request.key, &request.upload_id)
                .await;
            state.sessions.remove(&request.upload_id);
            metrics::record_upload_session("failed");
            Err(e.into())
        }
    }
}

/// Abort a session. Store-side abort failures are logged, not returned.
pub async fn abort_upload(
    State(state): State<AppState>,
    payload: Result<Json<AbortUploadRequest>, JsonRejection>,
) -> ApiResult<Json<AbortUploadResponse>> {
    let Json(request) = payload?;
    request.validate()?;
    if let Some(session) = state.sessions.get(&request.upload_id) {
        if session.key != request.key {
            return Err(ApiError::bad_request(format!(
                "upload session {} does not belong to key {}",
                request.upload_id, request.key
            )));
        }
    }

    state
        .uploader
        .abort_multipart_upload(&request.key, &request.upload_id)
        .await;
    state.sessions.remove(&request.upload_id);
    metrics::record_upload_session("aborted");
    info!(upload_id = %request.upload_id, key = %request.key, "Multipart upload aborted");

    Ok(Json(AbortUploadResponse {}))
}

/// Current state of a session.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state
        .sessions
        .get(&upload_id)
        .ok_or_else(|| ApiError::not_found(format!("upload session {upload_id}")))?;
    Ok(Json(SessionResponse {
        missing_parts: session.missing_parts(),
        bytes_uploaded: session.bytes_uploaded(),
        session,
    }))
}

/// Open sessions untouched for longer than `olderThanSecs` (default: the
/// configured session TTL).
pub async fn list_stale_uploads(
    State(state): State<AppState>,
    query: Result<Query<StaleQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<UploadSession>>> {
    let Query(query) = query?;
    let ttl = query
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or(state.config.session_ttl);
    Ok(Json(state.sessions.stale(ttl)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("u1/m1/video.mp4").is_ok());
        assert!(check_key("/u1/video.mp4").is_err());
        assert!(check_key("u1/../other/video.mp4").is_err());
        assert!(check_key("u1//video.mp4").is_err());
        assert!(check_key("u1\\video.mp4").is_err());
    }
}
