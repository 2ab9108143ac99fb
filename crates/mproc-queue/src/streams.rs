//! Queue transport on Redis Streams.
//!
//! Each queued media type has its own request stream read through a shared
//! consumer group; updates go to one capped stream. Backpressure is applied by
//! leaving unsubscribed streams out of `XREADGROUP`.

use std::time::Duration;

use async_trait::async_trait;
use mproc_models::{MediaType, QueueMessage};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, Topics};
use crate::error::{QueueError, QueueResult};
use crate::transport::{Delivery, QueueTransport, Subscriptions};

const PAYLOAD_FIELD: &str = "message";

/// Redis Streams transport.
pub struct RedisTransport {
    client: redis::Client,
    config: QueueConfig,
    topics: Topics,
    subscriptions: Subscriptions,
}

impl RedisTransport {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let topics = config.topics();
        Ok(Self {
            client,
            config,
            topics,
            subscriptions: Subscriptions::new(),
        })
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    async fn ensure_group(&self, stream: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", self.config.consumer_group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists on {}", stream);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }
        Ok(())
    }

    /// Decode a stream entry; malformed entries are acked and dropped.
    async fn decode(&self, stream: &str, entry: &StreamId) -> Option<Delivery> {
        let media_type = self.topics.media_type_of(stream)?;
        let parsed = match entry.map.get(PAYLOAD_FIELD) {
            Some(redis::Value::BulkString(payload)) => {
                serde_json::from_slice::<QueueMessage>(payload).map_err(|e| e.to_string())
            }
            _ => Err("missing payload field".to_string()),
        };

        match parsed {
            Ok(message) => Some(Delivery {
                id: entry.id.clone(),
                media_type,
                message,
            }),
            Err(e) => {
                warn!(stream, id = %entry.id, "Dropping malformed request: {}", e);
                if let Err(e) = self.ack_raw(stream, &entry.id).await {
                    warn!("Failed to ack malformed request {}: {}", entry.id, e);
                }
                None
            }
        }
    }

    async fn ack_raw(&self, stream: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg(id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(stream)
            .arg(id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn xadd(&self, stream: &str, message: &QueueMessage, maxlen: Option<usize>) -> QueueResult<String> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(maxlen) = maxlen {
            cmd.arg("MAXLEN").arg("~").arg(maxlen);
        }
        cmd.arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .arg("messageType")
            .arg(message.message_type().as_str())
            .arg("mediaId")
            .arg(message.media_id.as_str());

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(format!("{stream}: {e}")))?;
        Ok(id)
    }

    /// Length of a media type's request stream.
    pub async fn backlog(&self, media_type: MediaType) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(self.topics.requests(media_type)?).await?;
        Ok(len)
    }
}

#[async_trait]
impl QueueTransport for RedisTransport {
    async fn init(&self) -> QueueResult<()> {
        for media_type in MediaType::QUEUED {
            self.ensure_group(&self.topics.requests(media_type)?).await?;
        }
        Ok(())
    }

    async fn publish_request(&self, message: &QueueMessage) -> QueueResult<String> {
        let stream = self.topics.requests(message.media_type)?;
        let id = self.xadd(&stream, message, None).await?;
        info!(
            media_id = %message.media_id,
            media_type = %message.media_type,
            "Enqueued request with message ID {}",
            id
        );
        Ok(id)
    }

    async fn publish_update(&self, message: &QueueMessage) -> QueueResult<String> {
        let stream = self.topics.updates();
        self.xadd(&stream, message, Some(self.config.updates_maxlen))
            .await
    }

    async fn subscribe(&self, media_type: MediaType) -> QueueResult<()> {
        self.topics.requests(media_type)?;
        self.subscriptions.add(media_type);
        Ok(())
    }

    async fn unsubscribe(&self, media_type: MediaType) -> QueueResult<()> {
        self.subscriptions.remove(media_type);
        Ok(())
    }

    fn is_subscribed(&self, media_type: MediaType) -> bool {
        self.subscriptions.contains(media_type)
    }

    async fn receive(&self, max: usize) -> QueueResult<Vec<Delivery>> {
        let streams = self
            .subscriptions
            .snapshot()
            .into_iter()
            .map(|t| self.topics.requests(t))
            .collect::<QueueResult<Vec<_>>>()?;

        if streams.is_empty() || max == 0 {
            tokio::time::sleep(self.config.block_timeout).await;
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(self.config.block_timeout.as_millis() as u64)
            .arg("STREAMS");
        for stream in &streams {
            cmd.arg(stream);
        }
        for _ in &streams {
            cmd.arg(">"); // Only new messages
        }

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::ReceiveFailed(e.to_string()))?;

        let mut deliveries = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream_key.ids {
                if let Some(delivery) = self.decode(&stream_key.key, entry).await {
                    debug!(id = %delivery.id, media_id = %delivery.message.media_id, "Received request");
                    deliveries.push(delivery);
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let stream = self.topics.requests(delivery.media_type)?;
        self.ack_raw(&stream, &delivery.id).await?;
        debug!("Acknowledged request: {}", delivery.id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        // Re-add before acking so the request is never lost.
        let stream = self.topics.requests(delivery.media_type)?;
        let new_id = self.xadd(&stream, &delivery.message, None).await?;
        self.ack_raw(&stream, &delivery.id).await?;
        debug!("Released request {} as {}", delivery.id, new_id);
        Ok(())
    }

    async fn touch(&self, deliveries: &[Delivery]) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        for media_type in MediaType::QUEUED {
            let ids: Vec<&str> = deliveries
                .iter()
                .filter(|d| d.media_type == media_type)
                .map(|d| d.id.as_str())
                .collect();
            if ids.is_empty() {
                continue;
            }
            redis::cmd("XCLAIM")
                .arg(self.topics.requests(media_type)?)
                .arg(&self.config.consumer_group)
                .arg(&self.config.consumer_name)
                .arg(0)
                .arg(&ids)
                .arg("JUSTID")
                .query_async::<redis::Value>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn claim_stale(&self, min_idle: Duration, max: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let mut claimed = Vec::new();

        for media_type in self.subscriptions.snapshot() {
            let stream = self.topics.requests(media_type)?;

            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("IDLE")
                .arg(min_idle_ms)
                .arg("-")
                .arg("+")
                .arg(max)
                .query_async(&mut conn)
                .await?;

            let ids: Vec<String> = pending
                .ids
                .into_iter()
                .filter(|p| p.consumer != self.config.consumer_name)
                .map(|p| p.id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let reply: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg(&self.config.consumer_name)
                .arg(min_idle_ms)
                .arg(&ids)
                .query_async(&mut conn)
                .await?;

            for entry in &reply.ids {
                if let Some(delivery) = self.decode(&stream, entry).await {
                    info!(
                        media_id = %delivery.message.media_id,
                        "Claimed pending request {} from stream",
                        delivery.id
                    );
                    claimed.push(delivery);
                }
            }
        }

        Ok(claimed)
    }
}
