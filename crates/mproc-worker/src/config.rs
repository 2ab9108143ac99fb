//! Worker configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mproc_models::{MediaType, MAX_BATCH_ERRORS};
use mproc_storage::UploadConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs per media type; unlisted types are unlimited
    pub max_jobs: HashMap<MediaType, usize>,
    /// Child jobs of one archive processed at once
    pub zip_child_concurrency: usize,
    /// Root for per-job temp directories
    pub temp_dir: PathBuf,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often the worker should scan for requests abandoned by dead consumers
    pub claim_interval: Duration,
    /// Minimum idle time before a pending request can be claimed
    pub claim_min_idle: Duration,
    /// Interval for refreshing ownership of in-flight requests
    pub heartbeat_interval: Duration,
    /// Bound on per-entry errors kept in a batch summary
    pub max_batch_errors: usize,
    /// Archives with more entries than this are rejected
    pub max_zip_entries: usize,
    /// MIME prefixes accepted on requests
    pub allowed_mime_prefixes: Vec<String>,
    /// Artifact upload settings; `max_file_size` also bounds accepted requests
    pub upload: UploadConfig,
    /// Prometheus exporter port
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs: HashMap::from([
                (MediaType::Image, 4),
                (MediaType::Video, 2),
                (MediaType::Zip, 1),
            ]),
            zip_child_concurrency: 4,
            temp_dir: std::env::temp_dir().join("mproc"),
            shutdown_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(60),
            max_batch_errors: MAX_BATCH_ERRORS,
            max_zip_entries: 10_000,
            allowed_mime_prefixes: vec![
                "image/".to_string(),
                "video/".to_string(),
                "application/zip".to_string(),
                "application/x-zip-compressed".to_string(),
                "multipart/x-zip".to_string(),
            ],
            upload: UploadConfig::default(),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut max_jobs = defaults.max_jobs.clone();
        for (media_type, key) in [
            (MediaType::Image, "WORKER_MAX_IMAGE_JOBS"),
            (MediaType::Video, "WORKER_MAX_VIDEO_JOBS"),
            (MediaType::Zip, "WORKER_MAX_ZIP_JOBS"),
        ] {
            if let Some(limit) = env_parse::<usize>(key) {
                max_jobs.insert(media_type, limit);
            }
        }

        let allowed_mime_prefixes = std::env::var("WORKER_ALLOWED_MIME_PREFIXES")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.allowed_mime_prefixes);

        Self {
            max_jobs,
            zip_child_concurrency: env_parse("WORKER_ZIP_CHILD_CONCURRENCY")
                .unwrap_or(defaults.zip_child_concurrency)
                .max(1),
            temp_dir: std::env::var("WORKER_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
            heartbeat_interval: env_parse("WORKER_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            max_batch_errors: env_parse("WORKER_MAX_BATCH_ERRORS").unwrap_or(defaults.max_batch_errors),
            max_zip_entries: env_parse("WORKER_MAX_ZIP_ENTRIES").unwrap_or(defaults.max_zip_entries),
            allowed_mime_prefixes,
            upload: UploadConfig::from_env(),
            metrics_port: env_parse("METRICS_PORT"),
        }
    }

    /// Configured limit for a media type, `None` when unlimited.
    pub fn limit_for(&self, media_type: MediaType) -> Option<usize> {
        self.max_jobs.get(&media_type).copied()
    }

    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        let mime = mime_type.trim().to_ascii_lowercase();
        self.allowed_mime_prefixes
            .iter()
            .any(|prefix| mime.starts_with(prefix.as_str()))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.limit_for(MediaType::Image), Some(4));
        assert_eq!(config.limit_for(MediaType::Video), Some(2));
        assert_eq!(config.limit_for(MediaType::Zip), Some(1));
        assert_eq!(config.limit_for(MediaType::Document), None);
    }

    #[test]
    fn test_mime_allow_list() {
        let config = WorkerConfig::default();
        assert!(config.is_mime_allowed("image/png"));
        assert!(config.is_mime_allowed("Video/MP4"));
        assert!(config.is_mime_allowed("application/zip"));
        assert!(!config.is_mime_allowed("application/x-msdownload"));
        assert!(!config.is_mime_allowed("text/html"));
    }
}
