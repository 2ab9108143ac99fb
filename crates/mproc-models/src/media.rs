//! Media types and archive entry classification.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "heic", "heif", "avif",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "webm", "mkv", "avi", "wmv", "flv", "mpg", "mpeg", "3gp",
];

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "txt", "md", "doc", "docx", "odt", "rtf"];

/// Kind of media a job processes.
///
/// `Document` only appears on child jobs created from archive entries; it has
/// no request queue of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Zip,
    Document,
}

impl MediaType {
    /// Media types that are consumed from a request queue.
    pub const QUEUED: [MediaType; 3] = [MediaType::Image, MediaType::Video, MediaType::Zip];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Zip => "zip",
            MediaType::Document => "document",
        }
    }

    /// Whether this media type has a request queue.
    pub fn is_queued(&self) -> bool {
        Self::QUEUED.contains(self)
    }

    /// Derive the media type from a MIME type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(MediaType::Image)
        } else if mime.starts_with("video/") {
            Some(MediaType::Video)
        } else if matches!(
            mime.as_str(),
            "application/zip" | "application/x-zip-compressed" | "multipart/x-zip"
        ) {
            Some(MediaType::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "zip" => Ok(MediaType::Zip),
            "document" => Ok(MediaType::Document),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

/// Classification of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Image,
    Video,
    Document,
}

impl EntryKind {
    /// Classify by file extension. Returns `None` for unsupported entries.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(EntryKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(EntryKind::Video)
        } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            Some(EntryKind::Document)
        } else {
            None
        }
    }

    /// Classify by a sniffed MIME type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(EntryKind::Image)
        } else if mime.starts_with("video/") {
            Some(EntryKind::Video)
        } else if mime == "application/pdf" || mime.starts_with("text/") {
            Some(EntryKind::Document)
        } else {
            None
        }
    }

    /// Media type of the child job created for this entry.
    pub fn media_type(&self) -> MediaType {
        match self {
            EntryKind::Image => MediaType::Image,
            EntryKind::Video => MediaType::Video,
            EntryKind::Document => MediaType::Document,
        }
    }

    /// Fallback content type from the extension.
    pub fn content_type_for(filename: &str) -> &'static str {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "bmp" => "image/bmp",
            "tif" | "tiff" => "image/tiff",
            "heic" => "image/heic",
            "heif" => "image/heif",
            "avif" => "image/avif",
            "mp4" | "m4v" => "video/mp4",
            "mov" => "video/quicktime",
            "webm" => "video/webm",
            "mkv" => "video/x-matroska",
            "avi" => "video/x-msvideo",
            "wmv" => "video/x-ms-wmv",
            "flv" => "video/x-flv",
            "mpg" | "mpeg" => "video/mpeg",
            "3gp" => "video/3gpp",
            "pdf" => "application/pdf",
            "txt" => "text/plain",
            "md" => "text/markdown",
            _ => "application/octet-stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_extension() {
        assert_eq!(EntryKind::from_filename("a/b/photo.JPG"), Some(EntryKind::Image));
        assert_eq!(EntryKind::from_filename("clip.mov"), Some(EntryKind::Video));
        assert_eq!(EntryKind::from_filename("notes.pdf"), Some(EntryKind::Document));
        assert_eq!(EntryKind::from_filename("setup.exe"), None);
        assert_eq!(EntryKind::from_filename("README"), None);
    }

    #[test]
    fn test_media_type_from_mime() {
        assert_eq!(MediaType::from_mime("image/png"), Some(MediaType::Image));
        assert_eq!(MediaType::from_mime("video/mp4"), Some(MediaType::Video));
        assert_eq!(MediaType::from_mime("application/zip"), Some(MediaType::Zip));
        assert_eq!(MediaType::from_mime("application/x-msdownload"), None);
    }

    #[test]
    fn test_media_type_serde() {
        let json = serde_json::to_string(&MediaType::Zip).unwrap();
        assert_eq!(json, "\"zip\"");
        assert!(MediaType::Zip.is_queued());
        assert!(!MediaType::Document.is_queued());
    }
}
