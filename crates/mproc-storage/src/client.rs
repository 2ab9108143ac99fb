//! Object store client.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use mproc_models::CompletedPart;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::memory::MemoryObjectStore;

/// Operations the pipeline needs from an S3-compatible store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload an in-memory object in one request.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()>;

    /// Upload a local file in one request.
    async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()>;

    /// Stream an object into a local file. Returns the number of bytes written.
    async fn download_to_file(&self, key: &str, path: &Path) -> StorageResult<u64>;

    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    /// Open a multipart session and return its upload ID.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<String>;

    /// Upload one part and return its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String>;

    /// Finalize a multipart session. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()>;

    /// Release a multipart session and any parts uploaded to it.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Check the store is reachable.
    async fn check_connectivity(&self) -> StorageResult<()>;
}

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    pub force_path_style: bool,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let endpoint_url = std::env::var("S3_ENDPOINT_URL").ok().filter(|s| !s.is_empty());
        let force_path_style = std::env::var("S3_FORCE_PATH_STYLE")
            .ok()
            .map(|v| v == "true" || v == "1")
            .unwrap_or(endpoint_url.is_some());

        Ok(Self {
            endpoint_url,
            access_key_id: std::env::var("S3_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("S3_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("S3_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("S3_BUCKET")
                .map_err(|_| StorageError::config_error("S3_BUCKET not set"))?,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            force_path_style,
        })
    }
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "mproc",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map an SDK error, keeping network-level failures and 5xx responses retryable.
fn sdk_error<E>(
    err: SdkError<E, HttpResponse>,
    fallback: impl FnOnce(String) -> StorageError,
) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => service.raw().status().is_server_error(),
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        StorageError::Transient(message)
    } else {
        fallback(message)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()> {
        debug!(key, size = body.len(), "Uploading object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::UploadFailed))?;

        Ok(())
    }

    async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::UploadFailed))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        debug!("Downloading {} to {}", key, path.display());

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    StorageError::not_found(key)
                } else {
                    sdk_error(e, StorageError::DownloadFailed)
                }
            })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StorageError::download_failed(format!("{key}: {e}")))?;
        file.flush().await?;

        info!("Downloaded {} ({} bytes) to {}", key, written, path.display());
        Ok(written)
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::DeleteFailed))?;

        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::Multipart))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StorageError::multipart("store returned no upload ID"))?
            .to_string();

        info!(key, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::UploadFailed))?;

        response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::upload_failed(format!("part {part_number} returned no ETag")))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.e_tag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::Multipart))?;

        info!(key, upload_id, "Completed multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error(e, StorageError::Multipart))?;

        info!(key, upload_id, "Aborted multipart upload");
        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("S3 connectivity check failed: {}", e)))?;
        Ok(())
    }
}

/// Build the store selected by `STORAGE_BACKEND` (`s3` by default, or `memory`).
pub fn store_from_env() -> StorageResult<Arc<dyn ObjectStore>> {
    match std::env::var("STORAGE_BACKEND").as_deref() {
        Ok("memory") => {
            info!("Using in-memory object store");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
        Ok("s3") | Err(_) => Ok(Arc::new(S3Client::from_env()?)),
        Ok(other) => Err(StorageError::config_error(format!(
            "unknown STORAGE_BACKEND: {other}"
        ))),
    }
}
