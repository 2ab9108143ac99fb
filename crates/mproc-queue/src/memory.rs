//! In-process queue transport for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mproc_models::{MediaType, QueueMessage};
use tokio::sync::{broadcast, Notify};

use crate::error::{QueueError, QueueResult};
use crate::transport::{Delivery, QueueTransport, Subscriptions};

#[derive(Debug, Default)]
struct State {
    requests: HashMap<MediaType, VecDeque<Delivery>>,
    in_flight: HashMap<String, Delivery>,
    updates: Vec<QueueMessage>,
}

/// Queue transport kept in memory.
pub struct MemoryTransport {
    state: Mutex<State>,
    subscriptions: Subscriptions,
    notify: Notify,
    updates_tx: broadcast::Sender<QueueMessage>,
    next_id: AtomicU64,
    block_timeout: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl MemoryTransport {
    pub fn new(block_timeout: Duration) -> Self {
        let (updates_tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            subscriptions: Subscriptions::new(),
            notify: Notify::new(),
            updates_tx,
            next_id: AtomicU64::new(1),
            block_timeout,
        }
    }

    fn lock(&self) -> QueueResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QueueError::ReceiveFailed("queue state poisoned".into()))
    }

    /// Live feed of published updates.
    pub fn updates(&self) -> broadcast::Receiver<QueueMessage> {
        self.updates_tx.subscribe()
    }

    /// Every update published so far, in order.
    pub fn published_updates(&self) -> Vec<QueueMessage> {
        self.lock().map(|s| s.updates.clone()).unwrap_or_default()
    }

    /// Requests waiting on a media type's topic.
    pub fn backlog(&self, media_type: MediaType) -> usize {
        self.lock()
            .map(|s| s.requests.get(&media_type).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Deliveries received but not yet acked or released.
    pub fn in_flight(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn take_ready(&self, max: usize) -> QueueResult<Vec<Delivery>> {
        let subscribed = self.subscriptions.snapshot();
        let mut state = self.lock()?;
        let mut out = Vec::new();

        // Round-robin across subscribed topics.
        'outer: loop {
            let mut progressed = false;
            for media_type in &subscribed {
                if out.len() >= max {
                    break 'outer;
                }
                if let Some(delivery) = state
                    .requests
                    .get_mut(media_type)
                    .and_then(VecDeque::pop_front)
                {
                    state.in_flight.insert(delivery.id.clone(), delivery.clone());
                    out.push(delivery);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn init(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn publish_request(&self, message: &QueueMessage) -> QueueResult<String> {
        if !message.media_type.is_queued() {
            return Err(QueueError::NoRequestTopic(message.media_type.to_string()));
        }
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock()?
            .requests
            .entry(message.media_type)
            .or_default()
            .push_back(Delivery {
                id: id.clone(),
                media_type: message.media_type,
                message: message.clone(),
            });
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn publish_update(&self, message: &QueueMessage) -> QueueResult<String> {
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock()?.updates.push(message.clone());
        let _ = self.updates_tx.send(message.clone());
        Ok(id)
    }

    async fn subscribe(&self, media_type: MediaType) -> QueueResult<()> {
        if !media_type.is_queued() {
            return Err(QueueError::NoRequestTopic(media_type.to_string()));
        }
        self.subscriptions.add(media_type);
        self.notify.notify_waiters();
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
        let notified = self.notify.notified();
        let ready = self.take_ready(max)?;
        if !ready.is_empty() {
            return Ok(ready);
        }
        let _ = tokio::time::timeout(self.block_timeout, notified).await;
        self.take_ready(max)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.lock()?.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock()?;
        if let Some(delivery) = state.in_flight.remove(&delivery.id) {
            state
                .requests
                .entry(delivery.media_type)
                .or_default()
                .push_front(delivery);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim_stale(&self, _min_idle: Duration, _max: usize) -> QueueResult<Vec<Delivery>> {
        // A single process owns every in-flight delivery.
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproc_models::{MediaId, RequestBody};

    fn request(media_type: MediaType) -> QueueMessage {
        QueueMessage::request(
            media_type,
            MediaId::new(),
            "u",
            RequestBody {
                s3_key: "k".into(),
                original_filename: "f".into(),
                mime_type: "image/png".into(),
                file_size: 1,
                metadata: None,
                attempt: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_unsubscribed_topic_is_not_consumed() {
        let transport = MemoryTransport::new(Duration::from_millis(5));
        transport.publish_request(&request(MediaType::Video)).await.unwrap();
        transport.publish_request(&request(MediaType::Image)).await.unwrap();
        transport.subscribe(MediaType::Image).await.unwrap();

        let batch = transport.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].media_type, MediaType::Image);
        assert_eq!(transport.backlog(MediaType::Video), 1);

        transport.subscribe(MediaType::Video).await.unwrap();
        let batch = transport.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].media_type, MediaType::Video);
    }

    #[tokio::test]
    async fn test_release_requeues_at_front() {
        let transport = MemoryTransport::new(Duration::from_millis(5));
        transport.subscribe(MediaType::Zip).await.unwrap();
        let first = request(MediaType::Zip);
        transport.publish_request(&first).await.unwrap();
        transport.publish_request(&request(MediaType::Zip)).await.unwrap();

        let batch = transport.receive(1).await.unwrap();
        assert_eq!(transport.in_flight(), 1);
        transport.release(&batch[0]).await.unwrap();
        assert_eq!(transport.in_flight(), 0);

        let again = transport.receive(1).await.unwrap();
        assert_eq!(again[0].message.media_id, first.media_id);
        transport.ack(&again[0]).await.unwrap();
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.backlog(MediaType::Zip), 1);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let transport = std::sync::Arc::new(MemoryTransport::new(Duration::from_secs(5)));
        transport.subscribe(MediaType::Image).await.unwrap();

        let consumer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive(1).await })
        };
        tokio::task::yield_now().await;
        transport.publish_request(&request(MediaType::Image)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_document_has_no_request_topic() {
        let transport = MemoryTransport::default();
        assert!(transport.subscribe(MediaType::Document).await.is_err());
        assert!(transport
            .publish_request(&request(MediaType::Document))
            .await
            .is_err());
    }
}
