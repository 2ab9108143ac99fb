//! Application state.

use std::sync::Arc;

use mproc_storage::{store_from_env, MultipartUploader, ObjectStore, StorageResult, UploadConfig};

use crate::config::ApiConfig;
use crate::sessions::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn ObjectStore>,
    pub uploader: Arc<MultipartUploader>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// Create state from environment variables.
    pub fn from_env(config: ApiConfig) -> StorageResult<Self> {
        let store = store_from_env()?;
        Ok(Self::new(config, store, UploadConfig::from_env()))
    }

    pub fn new(config: ApiConfig, store: Arc<dyn ObjectStore>, upload: UploadConfig) -> Self {
        Self {
            config,
            uploader: Arc::new(MultipartUploader::new(store.clone(), upload)),
            store,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn upload_config(&self) -> &UploadConfig {
        self.uploader.config()
    }
}
