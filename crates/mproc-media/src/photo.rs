//! Still image transform: thumbnail and downscaled versions.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use mproc_models::MediaType;
use serde_json::json;
use tracing::debug;

use crate::error::{MediaError, MediaResult};
use crate::transform::{Artifact, ArtifactKind, MediaTransformer, TransformOutput};

/// Longest edge of image thumbnails.
pub const IMAGE_THUMBNAIL_SIZE: u32 = 256;

/// Width-bounded versions, largest first.
pub const IMAGE_VERSIONS: &[(&str, u32)] = &[("large", 1920), ("medium", 1280), ("small", 640)];

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct ImageTransformer {
    thumbnail_size: u32,
    versions: Vec<(String, u32)>,
}

impl Default for ImageTransformer {
    fn default() -> Self {
        Self {
            thumbnail_size: IMAGE_THUMBNAIL_SIZE,
            versions: IMAGE_VERSIONS
                .iter()
                .map(|(label, width)| (label.to_string(), *width))
                .collect(),
        }
    }
}

impl ImageTransformer {
    pub fn with_versions(mut self, versions: Vec<(String, u32)>) -> Self {
        self.versions = versions;
        self
    }

    fn run(&self, input: &Path, work_dir: &Path) -> MediaResult<TransformOutput> {
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }

        let reader = image::io::Reader::open(input)?.with_guessed_format()?;
        let format = reader.format();
        let img = reader.decode()?;
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidImage("image has no pixels".into()));
        }
        debug!(width, height, ?format, "Decoded image");

        let mut artifacts = Vec::with_capacity(self.versions.len() + 1);

        let thumb = img.thumbnail(self.thumbnail_size, self.thumbnail_size);
        let thumb_path = work_dir.join("thumbnail.jpg");
        write_jpeg(&thumb, &thumb_path)?;
        artifacts.push(jpeg_artifact(ArtifactKind::Thumbnail, thumb_path, &thumb));

        for (label, target_width) in &self.versions {
            if *target_width >= width {
                continue;
            }
            let version = img.resize(*target_width, u32::MAX, FilterType::Lanczos3);
            let path = work_dir.join(format!("{label}.jpg"));
            write_jpeg(&version, &path)?;
            artifacts.push(jpeg_artifact(
                ArtifactKind::Version {
                    label: label.clone(),
                },
                path,
                &version,
            ));
        }

        let mut output = TransformOutput {
            artifacts,
            width: Some(width),
            height: Some(height),
            duration: None,
            metadata: Default::default(),
        };
        if let Some(format) = format {
            output.metadata.insert(
                "format".into(),
                json!(format!("{format:?}").to_ascii_lowercase()),
            );
        }
        output
            .metadata
            .insert("hasAlpha".into(), json!(img.color().has_alpha()));
        Ok(output)
    }
}

fn write_jpeg(img: &DynamicImage, path: &Path) -> MediaResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(())
}

fn jpeg_artifact(kind: ArtifactKind, path: PathBuf, img: &DynamicImage) -> Artifact {
    Artifact {
        kind,
        path,
        content_type: "image/jpeg".into(),
        width: img.width(),
        height: img.height(),
    }
}

#[async_trait]
impl MediaTransformer for ImageTransformer {
    fn media_type(&self) -> MediaType {
        MediaType::Image
    }

    async fn transform(&self, input: &Path, work_dir: &Path) -> MediaResult<TransformOutput> {
        let this = self.clone();
        let input = input.to_path_buf();
        let work_dir = work_dir.to_path_buf();
        tokio::task::spawn_blocking(move || this.run(&input, &work_dir))
            .await
            .map_err(|e| MediaError::internal(format!("image task failed: {e}")))?
    }
}
