//! Transform contract shared by every media type.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mproc_models::MediaType;
use serde_json::Value;

use crate::error::{MediaError, MediaResult};

/// What a derived file is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Thumbnail,
    /// Reduced-quality rendition, e.g. `720p` or `medium`
    Version { label: String },
}

/// One file produced by a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

impl Artifact {
    /// File extension used for the uploaded object.
    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
    }

    pub fn label(&self) -> &str {
        match &self.kind {
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Version { label } => label,
        }
    }
}

/// Derived files plus the properties of the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub artifacts: Vec<Artifact>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds, videos only
    pub duration: Option<f64>,
    pub metadata: BTreeMap<String, Value>,
}

impl TransformOutput {
    pub fn thumbnail(&self) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Thumbnail)
    }
}

/// Turns one source file into derived files.
///
/// Implementations only write inside `work_dir`; the caller owns every file
/// they produce.
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    fn media_type(&self) -> MediaType;

    async fn transform(&self, input: &Path, work_dir: &Path) -> MediaResult<TransformOutput>;
}

/// Transformers keyed by media type.
#[derive(Clone, Default)]
pub struct Transformers {
    by_type: HashMap<MediaType, Arc<dyn MediaTransformer>>,
}

impl Transformers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image, video and document transformers.
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(crate::photo::ImageTransformer::default()))
            .with(Arc::new(crate::video::VideoTransformer::default()))
            .with(Arc::new(crate::passthrough::PassthroughTransformer::document()))
    }

    pub fn with(mut self, transformer: Arc<dyn MediaTransformer>) -> Self {
        self.by_type.insert(transformer.media_type(), transformer);
        self
    }

    pub fn get(&self, media_type: MediaType) -> MediaResult<Arc<dyn MediaTransformer>> {
        self.by_type
            .get(&media_type)
            .cloned()
            .ok_or_else(|| MediaError::UnsupportedFormat(format!("no transformer for {media_type}")))
    }
}
