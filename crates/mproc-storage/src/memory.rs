//! In-process object store.
//!
//! Used by local development (`STORAGE_BACKEND=memory`) and by the pipeline,
//! executor and API tests. Multipart completion is validated the same way an
//! S3 backend validates it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use mproc_models::CompletedPart;
use uuid::Uuid;

use crate::client::ObjectStore;
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    content_type: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// Object store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    aborted: AtomicUsize,
    /// Keys containing any of these substrings fail on put and part upload
    failing_puts: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put and part upload whose key contains `pattern` fail.
    pub fn fail_puts_matching(&self, pattern: impl Into<String>) {
        if let Ok(mut patterns) = self.failing_puts.lock() {
            patterns.push(pattern.into());
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>, content_type: &str) {
        self.objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                content_type: content_type.to_string(),
                metadata: HashMap::new(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|o| o.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Multipart sessions neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Number of successful abort calls.
    pub fn aborted_uploads(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn check_put(&self, key: &str) -> StorageResult<()> {
        let failing = self
            .failing_puts
            .lock()
            .map(|patterns| patterns.iter().any(|p| key.contains(p.as_str())))
            .unwrap_or(false);
        if failing {
            return Err(StorageError::transient(format!("injected put failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()> {
        self.check_put(key)?;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                content_type: content_type.to_string(),
                metadata,
            },
        );
        Ok(())
    }

    async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        self.check_put(key)?;
        let data = tokio::fs::read(path).await?;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                content_type: content_type.to_string(),
                metadata: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let data = self
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(key))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String> {
        self.check_put(key)?;
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::multipart(format!("no such upload: {upload_id}")))?;
        if upload.key != key {
            return Err(StorageError::multipart(format!(
                "upload {upload_id} belongs to {}, not {key}",
                upload.key
            )));
        }
        if part_number == 0 {
            return Err(StorageError::InvalidPartList("part numbers start at 1".into()));
        }
        let e_tag = format!("\"{}-{}\"", part_number, body.len());
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        let data = {
            let upload = self
                .uploads
                .get(upload_id)
                .ok_or_else(|| StorageError::multipart(format!("no such upload: {upload_id}")))?;
            if upload.key != key {
                return Err(StorageError::multipart(format!(
                    "upload {upload_id} belongs to {}, not {key}",
                    upload.key
                )));
            }
            if parts.is_empty() {
                return Err(StorageError::InvalidPartList("no parts".into()));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(StorageError::InvalidPartList(
                    "parts must be in ascending order".into(),
                ));
            }

            let mut data = BytesMut::new();
            for part in &parts {
                match upload.parts.get(&part.part_number) {
                    Some((e_tag, body)) if *e_tag == part.e_tag => data.extend_from_slice(body),
                    Some(_) => {
                        return Err(StorageError::InvalidPartList(format!(
                            "ETag mismatch for part {}",
                            part.part_number
                        )))
                    }
                    None => {
                        return Err(StorageError::InvalidPartList(format!(
                            "part {} was never uploaded",
                            part.part_number
                        )))
                    }
                }
            }
            data.freeze()
        };

        if let Some((_, upload)) = self.uploads.remove(upload_id) {
            self.objects.insert(
                upload.key,
                StoredObject {
                    data,
                    content_type: upload.content_type,
                    metadata: upload.metadata,
                },
            );
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        self.uploads
            .remove(upload_id)
            .ok_or_else(|| StorageError::multipart(format!("no such upload: {upload_id}")))?;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        Ok(())
    }
}
