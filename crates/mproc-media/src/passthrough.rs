//! No-op transform for media that is stored as-is.

use std::path::Path;

use async_trait::async_trait;
use mproc_models::MediaType;
use serde_json::json;

use crate::error::{MediaError, MediaResult};
use crate::transform::{MediaTransformer, TransformOutput};

/// Produces no artifacts; only records the source size.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughTransformer {
    media_type: MediaType,
}

impl PassthroughTransformer {
    pub fn new(media_type: MediaType) -> Self {
        Self { media_type }
    }

    pub fn document() -> Self {
        Self::new(MediaType::Document)
    }
}

#[async_trait]
impl MediaTransformer for PassthroughTransformer {
    fn media_type(&self) -> MediaType {
        self.media_type
    }

    async fn transform(&self, input: &Path, _work_dir: &Path) -> MediaResult<TransformOutput> {
        let meta = tokio::fs::metadata(input)
            .await
            .map_err(|_| MediaError::FileNotFound(input.to_path_buf()))?;
        let mut output = TransformOutput::default();
        output.metadata.insert("size".into(), json!(meta.len()));
        Ok(output)
    }
}
