//! Queue transport abstraction.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mproc_models::{MediaType, QueueMessage};
use tracing::info;

use crate::error::QueueResult;

/// A request handed to this consumer, pending until acked or released.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker message ID
    pub id: String,
    pub media_type: MediaType,
    pub message: QueueMessage,
}

/// Durable request/update topics with per-type subscription control.
///
/// A consumer only receives requests for the media types it is currently
/// subscribed to; unsubscribing leaves the backlog to other consumers.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create topics and consumer groups as needed.
    async fn init(&self) -> QueueResult<()>;

    /// Enqueue a request on its media type's request topic.
    async fn publish_request(&self, message: &QueueMessage) -> QueueResult<String>;

    /// Publish a progress/result/error message on the updates topic.
    async fn publish_update(&self, message: &QueueMessage) -> QueueResult<String>;

    async fn subscribe(&self, media_type: MediaType) -> QueueResult<()>;

    async fn unsubscribe(&self, media_type: MediaType) -> QueueResult<()>;

    fn is_subscribed(&self, media_type: MediaType) -> bool;

    /// Receive up to `max` requests from subscribed topics.
    ///
    /// Blocks up to the configured timeout and may return an empty batch.
    async fn receive(&self, max: usize) -> QueueResult<Vec<Delivery>>;

    /// Mark a delivery as done.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Hand a delivery back to the broker for another consumer.
    async fn release(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Reset the idle timer of deliveries still being worked on.
    async fn touch(&self, _deliveries: &[Delivery]) -> QueueResult<()> {
        Ok(())
    }

    /// Take over requests left pending by consumers idle for `min_idle`.
    async fn claim_stale(&self, min_idle: Duration, max: usize) -> QueueResult<Vec<Delivery>>;
}

/// Set of media types a consumer is subscribed to.
#[derive(Debug, Default)]
pub struct Subscriptions {
    active: Mutex<BTreeSet<MediaType>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the subscription changed.
    pub fn add(&self, media_type: MediaType) -> bool {
        let changed = self
            .active
            .lock()
            .map(|mut set| set.insert(media_type))
            .unwrap_or(false);
        if changed {
            info!(media_type = %media_type, "Subscribed to request topic");
            metrics::counter!("mproc_queue_subscriptions_total", "media_type" => media_type.as_str(), "action" => "subscribe").increment(1);
        }
        changed
    }

    /// Returns true if the subscription changed.
    pub fn remove(&self, media_type: MediaType) -> bool {
        let changed = self
            .active
            .lock()
            .map(|mut set| set.remove(&media_type))
            .unwrap_or(false);
        if changed {
            info!(media_type = %media_type, "Unsubscribed from request topic");
            metrics::counter!("mproc_queue_subscriptions_total", "media_type" => media_type.as_str(), "action" => "unsubscribe").increment(1);
        }
        changed
    }

    pub fn contains(&self, media_type: MediaType) -> bool {
        self.active
            .lock()
            .map(|set| set.contains(&media_type))
            .unwrap_or(false)
    }

    /// Subscribed types in a stable order.
    pub fn snapshot(&self) -> Vec<MediaType> {
        self.active
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
