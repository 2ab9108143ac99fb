//! Request and update topics for the media pipeline.
//!
//! This crate provides:
//! - The `QueueTransport` trait with per-type subscribe/unsubscribe
//! - A Redis Streams transport with consumer groups and stale-claim recovery
//! - An in-memory transport for local runs and tests
//! - `UpdatePublisher` for progress/result/error messages

pub mod config;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod streams;
pub mod transport;

use std::sync::Arc;

pub use config::{QueueBackend, QueueConfig, Topics};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryTransport;
pub use publisher::UpdatePublisher;
pub use streams::RedisTransport;
pub use transport::{Delivery, QueueTransport, Subscriptions};

/// Build the transport selected by the config.
pub fn transport_from_config(config: QueueConfig) -> QueueResult<Arc<dyn QueueTransport>> {
    match config.backend {
        QueueBackend::Redis => Ok(Arc::new(RedisTransport::new(config)?)),
        QueueBackend::Memory => Ok(Arc::new(MemoryTransport::new(config.block_timeout))),
    }
}
