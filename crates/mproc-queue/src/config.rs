//! Queue configuration and topic naming.

use std::time::Duration;

use mproc_models::MediaType;

use crate::error::{QueueError, QueueResult};

/// Broker implementation selected at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Redis URL
    pub redis_url: String,
    /// Deployment namespace prefixed to every topic
    pub namespace: String,
    /// Consumer group shared by all workers
    pub consumer_group: String,
    /// Name of this consumer within the group
    pub consumer_name: String,
    /// How long a receive blocks waiting for messages
    pub block_timeout: Duration,
    /// Max messages per receive
    pub batch_size: usize,
    /// Approximate cap on the updates stream length
    pub updates_maxlen: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "mproc".to_string(),
            consumer_group: "mproc:workers".to_string(),
            consumer_name: default_consumer_name(),
            block_timeout: Duration::from_millis(2000),
            batch_size: 4,
            updates_maxlen: 100_000,
        }
    }
}

fn default_consumer_name() -> String {
    format!("worker-{}", std::process::id())
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        let defaults = Self::default();
        let backend = match std::env::var("QUEUE_BACKEND").as_deref() {
            Ok("memory") => QueueBackend::Memory,
            Ok("redis") | Err(_) => QueueBackend::Redis,
            Ok(other) => {
                return Err(QueueError::config(format!("unknown QUEUE_BACKEND: {other}")))
            }
        };

        Ok(Self {
            backend,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            namespace: std::env::var("QUEUE_NAMESPACE").unwrap_or(defaults.namespace),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            consumer_name: std::env::var("QUEUE_CONSUMER_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or(defaults.consumer_name),
            block_timeout: std::env::var("QUEUE_BLOCK_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.block_timeout),
            batch_size: std::env::var("QUEUE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
            updates_maxlen: std::env::var("QUEUE_UPDATES_MAXLEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.updates_maxlen),
        })
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.namespace)
    }
}

/// Topic names within one deployment namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Request topic for a queued media type, e.g. `mproc:media:image:requests`.
    pub fn requests(&self, media_type: MediaType) -> QueueResult<String> {
        if !media_type.is_queued() {
            return Err(QueueError::NoRequestTopic(media_type.to_string()));
        }
        Ok(format!("{}:media:{}:requests", self.namespace, media_type))
    }

    /// Topic carrying progress/result/error messages.
    pub fn updates(&self) -> String {
        format!("{}:media:updates", self.namespace)
    }

    /// Reverse of [`Topics::requests`].
    pub fn media_type_of(&self, topic: &str) -> Option<MediaType> {
        MediaType::QUEUED
            .into_iter()
            .find(|t| self.requests(*t).ok().as_deref() == Some(topic))
    }
}
