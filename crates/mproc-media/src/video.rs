//! Video transform: poster frame and lower-resolution renditions via ffmpeg.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mproc_models::MediaType;
use serde_json::json;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_video, VideoInfo};
use crate::transform::{Artifact, ArtifactKind, MediaTransformer, TransformOutput};

/// Width of the poster frame; height keeps the aspect ratio.
pub const VIDEO_THUMBNAIL_WIDTH: u32 = 256;

/// Height-bounded renditions, largest first.
pub const VIDEO_VERSIONS: &[(&str, u32)] = &[("720p", 720), ("480p", 480)];

#[derive(Debug, Clone)]
pub struct VideoTransformer {
    runner: FfmpegRunner,
    versions: Vec<(String, u32)>,
    crf: u8,
}

impl Default for VideoTransformer {
    fn default() -> Self {
        Self {
            runner: FfmpegRunner::new().with_timeout(Duration::from_secs(30 * 60)),
            versions: VIDEO_VERSIONS
                .iter()
                .map(|(label, height)| (label.to_string(), *height))
                .collect(),
            crf: 23,
        }
    }
}

impl VideoTransformer {
    pub fn with_runner(mut self, runner: FfmpegRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_versions(mut self, versions: Vec<(String, u32)>) -> Self {
        self.versions = versions;
        self
    }

    async fn thumbnail(&self, input: &Path, work_dir: &Path, info: &VideoInfo) -> MediaResult<Artifact> {
        let path = work_dir.join("thumbnail.jpg");
        let cmd = FfmpegCommand::new(input, &path)
            .seek(thumbnail_offset(info.duration))
            .single_frame()
            .video_filter(format!("scale={VIDEO_THUMBNAIL_WIDTH}:-2"));
        self.runner.run(&cmd).await?;

        Ok(Artifact {
            kind: ArtifactKind::Thumbnail,
            path,
            content_type: "image/jpeg".into(),
            width: VIDEO_THUMBNAIL_WIDTH,
            height: scaled_even(info.height, info.width, VIDEO_THUMBNAIL_WIDTH),
        })
    }

    async fn version(
        &self,
        input: &Path,
        work_dir: &Path,
        info: &VideoInfo,
        label: &str,
        height: u32,
    ) -> MediaResult<Artifact> {
        let path = work_dir.join(format!("{label}.mp4"));
        let mut cmd = FfmpegCommand::new(input, &path)
            .video_filter(format!("scale=-2:{height}"))
            .video_codec("libx264")
            .preset("veryfast")
            .crf(self.crf)
            .output_args(["-movflags", "+faststart"]);
        cmd = if info.has_audio {
            cmd.audio_codec("aac").output_args(["-b:a", "128k"])
        } else {
            cmd.output_arg("-an")
        };
        self.runner.run(&cmd).await?;

        Ok(Artifact {
            kind: ArtifactKind::Version {
                label: label.to_string(),
            },
            path,
            content_type: "video/mp4".into(),
            width: scaled_even(info.width, info.height, height),
            height,
        })
    }
}

/// Seek position of the poster frame.
pub fn thumbnail_offset(duration: f64) -> f64 {
    if duration <= 0.0 {
        0.0
    } else {
        (duration / 2.0).min(1.0)
    }
}

/// `other` scaled by `target / side`, rounded to an even number like ffmpeg's `-2`.
fn scaled_even(other: u32, side: u32, target: u32) -> u32 {
    if side == 0 {
        return 0;
    }
    let scaled = (other as f64 * target as f64 / side as f64).round() as u32;
    scaled - scaled % 2
}

#[async_trait]
impl MediaTransformer for VideoTransformer {
    fn media_type(&self) -> MediaType {
        MediaType::Video
    }

    async fn transform(&self, input: &Path, work_dir: &Path) -> MediaResult<TransformOutput> {
        let info = probe_video(input).await?;
        if info.width == 0 || info.height == 0 {
            return Err(MediaError::InvalidVideo("video stream has no dimensions".into()));
        }
        info!(
            width = info.width,
            height = info.height,
            duration = info.duration,
            "Transforming video"
        );

        let mut artifacts = vec![self.thumbnail(input, work_dir, &info).await?];
        for (label, height) in &self.versions {
            if *height >= info.height {
                continue;
            }
            artifacts.push(self.version(input, work_dir, &info, label, *height).await?);
        }

        let mut output = TransformOutput {
            artifacts,
            width: Some(info.width),
            height: Some(info.height),
            duration: Some(info.duration),
            metadata: Default::default(),
        };
        output.metadata.insert("codec".into(), json!(info.codec));
        output.metadata.insert("fps".into(), json!(info.fps));
        output.metadata.insert("bitrate".into(), json!(info.bitrate));
        output.metadata.insert("hasAudio".into(), json!(info.has_audio));
        Ok(output)
    }
}
