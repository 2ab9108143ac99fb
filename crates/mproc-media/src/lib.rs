//! Media transforms for the processing pipeline.
//!
//! This crate provides:
//! - The `MediaTransformer` contract and a registry keyed by media type
//! - Image thumbnails and downscaled versions (`image` crate)
//! - Video poster frames and renditions through the FFmpeg CLI
//! - A passthrough transform for documents

pub mod command;
pub mod error;
pub mod passthrough;
pub mod photo;
pub mod probe;
pub mod transform;
pub mod video;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use passthrough::PassthroughTransformer;
pub use photo::ImageTransformer;
pub use probe::{probe_video, VideoInfo};
pub use transform::{Artifact, ArtifactKind, MediaTransformer, TransformOutput, Transformers};
pub use video::VideoTransformer;
