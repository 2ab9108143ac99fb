//! Per-media-type job limits with queue backpressure.
//!
//! Taking the last slot of a media type unsubscribes this worker from that
//! type's request topic so other consumers pick up the load; freeing a slot
//! subscribes again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mproc_models::{JobId, MediaType};
use mproc_queue::{QueueResult, QueueTransport};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Ownership of one job slot. Hand it back with [`ConcurrencyLimiter::finish_job`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a token must be returned with finish_job"]
pub struct ConcurrencyToken {
    pub media_type: MediaType,
    pub job_id: JobId,
}

#[derive(Debug)]
struct Slot {
    max: usize,
    active: AtomicUsize,
    freed: Notify,
}

impl Slot {
    /// Increment-then-check: take a slot if one is free.
    fn try_take(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Bounded counters per media type. Types without a configured limit are
/// unlimited.
pub struct ConcurrencyLimiter {
    transport: Arc<dyn QueueTransport>,
    slots: HashMap<MediaType, Slot>,
    unlimited_active: AtomicUsize,
    /// Set while the worker should consume nothing (shutdown)
    paused: AtomicBool,
    toggle: Mutex<()>,
}

impl ConcurrencyLimiter {
    pub fn new(transport: Arc<dyn QueueTransport>, limits: &HashMap<MediaType, usize>) -> Self {
        let slots = limits
            .iter()
            .map(|(media_type, max)| {
                (
                    *media_type,
                    Slot {
                        max: (*max).max(1),
                        active: AtomicUsize::new(0),
                        freed: Notify::new(),
                    },
                )
            })
            .collect();
        Self {
            transport,
            slots,
            unlimited_active: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            toggle: Mutex::new(()),
        }
    }

    pub fn max_for(&self, media_type: MediaType) -> Option<usize> {
        self.slots.get(&media_type).map(|s| s.max)
    }

    pub fn active(&self, media_type: MediaType) -> usize {
        self.slots
            .get(&media_type)
            .map(|s| s.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.slots
            .values()
            .map(|s| s.active.load(Ordering::Acquire))
            .sum::<usize>()
            + self.unlimited_active.load(Ordering::Acquire)
    }

    pub fn is_saturated(&self, media_type: MediaType) -> bool {
        self.slots
            .get(&media_type)
            .is_some_and(|s| s.active.load(Ordering::Acquire) >= s.max)
    }

    /// Subscribe to every queued media type that has a free slot.
    pub async fn subscribe_all(&self) -> QueueResult<()> {
        self.paused.store(false, Ordering::Release);
        for media_type in MediaType::QUEUED {
            self.sync_subscription(media_type).await?;
        }
        Ok(())
    }

    /// Stop consuming every request topic.
    pub async fn pause(&self) -> QueueResult<()> {
        self.paused.store(true, Ordering::Release);
        let _guard = self.toggle.lock().await;
        for media_type in MediaType::QUEUED {
            self.transport.unsubscribe(media_type).await?;
        }
        Ok(())
    }

    /// Take a slot for a job accepted from the queue. Returns `None` when the
    /// media type is saturated.
    pub async fn start_job(&self, media_type: MediaType, job_id: &JobId) -> Option<ConcurrencyToken> {
        let taken = match self.slots.get(&media_type) {
            Some(slot) => slot.try_take(),
            None => {
                self.unlimited_active.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if !taken {
            debug!(media_type = %media_type, "No free slot");
            return None;
        }
        Some(self.granted(media_type, job_id).await)
    }

    /// Wait for a slot. Used for archive children, which never come from a queue.
    pub async fn acquire(&self, media_type: MediaType, job_id: &JobId) -> ConcurrencyToken {
        if let Some(slot) = self.slots.get(&media_type) {
            loop {
                let freed = slot.freed.notified();
                if slot.try_take() {
                    break;
                }
                freed.await;
            }
        } else {
            self.unlimited_active.fetch_add(1, Ordering::AcqRel);
        }
        self.granted(media_type, job_id).await
    }

    async fn granted(&self, media_type: MediaType, job_id: &JobId) -> ConcurrencyToken {
        metrics::gauge!("mproc_active_jobs", "media_type" => media_type.as_str()).increment(1.0);
        if self.is_saturated(media_type) {
            info!(media_type = %media_type, "Job limit reached, pausing request topic");
            self.sync_logged(media_type).await;
        }
        ConcurrencyToken {
            media_type,
            job_id: job_id.clone(),
        }
    }

    /// Return a slot. Decrement-then-check: resubscribes if the type had
    /// been saturated.
    pub async fn finish_job(&self, token: ConcurrencyToken) {
        let media_type = token.media_type;
        metrics::gauge!("mproc_active_jobs", "media_type" => media_type.as_str()).decrement(1.0);
        match self.slots.get(&media_type) {
            Some(slot) => {
                let before = slot.active.fetch_sub(1, Ordering::AcqRel);
                slot.freed.notify_one();
                if before >= slot.max {
                    info!(media_type = %media_type, "Job slot freed, resuming request topic");
                    self.sync_logged(media_type).await;
                }
            }
            None => {
                self.unlimited_active.fetch_sub(1, Ordering::AcqRel);
            }
        }
        debug!(job_id = %token.job_id, media_type = %media_type, "Job slot released");
    }

    async fn sync_logged(&self, media_type: MediaType) {
        if let Err(e) = self.sync_subscription(media_type).await {
            warn!(media_type = %media_type, "Failed to update subscription: {}", e);
        }
    }

    /// Bring the subscription for `media_type` in line with the counter.
    async fn sync_subscription(&self, media_type: MediaType) -> QueueResult<()> {
        if !media_type.is_queued() {
            return Ok(());
        }
        let _guard = self.toggle.lock().await;
        let want = !self.paused.load(Ordering::Acquire) && !self.is_saturated(media_type);
        let have = self.transport.is_subscribed(media_type);
        match (want, have) {
            (true, false) => self.transport.subscribe(media_type).await,
            (false, true) => self.transport.unsubscribe(media_type).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproc_queue::MemoryTransport;
    use std::time::Duration;

    fn limiter(transport: Arc<MemoryTransport>) -> ConcurrencyLimiter {
        let limits = HashMap::from([(MediaType::Image, 2), (MediaType::Video, 1)]);
        ConcurrencyLimiter::new(transport, &limits)
    }

    #[tokio::test]
    async fn test_saturation_unsubscribes_only_that_type() {
        let transport = Arc::new(MemoryTransport::default());
        let limiter = limiter(transport.clone());
        limiter.subscribe_all().await.unwrap();
        assert!(transport.is_subscribed(MediaType::Image));
        assert!(transport.is_subscribed(MediaType::Zip));

        let a = limiter.start_job(MediaType::Image, &JobId::new()).await.unwrap();
        assert!(transport.is_subscribed(MediaType::Image));
        let b = limiter.start_job(MediaType::Image, &JobId::new()).await.unwrap();
        assert!(!transport.is_subscribed(MediaType::Image));
        assert!(transport.is_subscribed(MediaType::Video));

        assert!(limiter.start_job(MediaType::Image, &JobId::new()).await.is_none());
        assert_eq!(limiter.active(MediaType::Image), 2);

        // Other types are accepted immediately.
        let v = limiter.start_job(MediaType::Video, &JobId::new()).await.unwrap();
        assert!(!transport.is_subscribed(MediaType::Video));

        limiter.finish_job(a).await;
        assert!(transport.is_subscribed(MediaType::Image));
        assert_eq!(limiter.active(MediaType::Image), 1);

        limiter.finish_job(b).await;
        limiter.finish_job(v).await;
        assert_eq!(limiter.total_active(), 0);
        assert!(transport.is_subscribed(MediaType::Video));
    }

    #[tokio::test]
    async fn test_unlimited_type() {
        let transport = Arc::new(MemoryTransport::default());
        let limiter = limiter(transport);
        let tokens = futures::future::join_all(
            (0..10).map(|_| {
                let limiter = &limiter;
                async move { limiter.acquire(MediaType::Document, &JobId::new()).await }
            }),
        )
        .await;
        assert_eq!(limiter.total_active(), 10);
        for token in tokens {
            limiter.finish_job(token).await;
        }
        assert_eq!(limiter.total_active(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_free_slot() {
        let transport = Arc::new(MemoryTransport::default());
        let limiter = Arc::new(limiter(transport));
        let held = limiter.start_job(MediaType::Video, &JobId::new()).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(MediaType::Video, &JobId::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        limiter.finish_job(held).await;
        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(limiter.active(MediaType::Video), 1);
        limiter.finish_job(token).await;
    }

    #[tokio::test]
    async fn test_pause_keeps_topics_closed() {
        let transport = Arc::new(MemoryTransport::default());
        let limiter = limiter(transport.clone());
        limiter.subscribe_all().await.unwrap();
        let token = limiter.start_job(MediaType::Video, &JobId::new()).await.unwrap();

        limiter.pause().await.unwrap();
        limiter.finish_job(token).await;
        for media_type in MediaType::QUEUED {
            assert!(!transport.is_subscribed(media_type));
        }
    }
}
