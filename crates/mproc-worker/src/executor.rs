//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mproc_models::{MediaId, MediaJob, MediaType, MessageBody, QueueMessage, RequestBody};
use mproc_queue::{Delivery, QueueTransport, UpdatePublisher};
use mproc_storage::ObjectStore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::limiter::ConcurrencyLimiter;
use crate::pipeline::MediaPipeline;
use crate::temp_files::TempFileTracker;

/// Consumes request topics and runs each accepted request through the pipeline.
pub struct JobExecutor {
    config: Arc<WorkerConfig>,
    transport: Arc<dyn QueueTransport>,
    limiter: Arc<ConcurrencyLimiter>,
    pipeline: Arc<MediaPipeline>,
    publisher: UpdatePublisher,
    /// Cancellation handles of running jobs
    active: Arc<DashMap<MediaId, CancellationToken>>,
    /// Deliveries being worked on, by broker message ID
    in_flight: Arc<DashMap<String, Delivery>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    batch_size: usize,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn QueueTransport>,
    ) -> Self {
        let tracker = Arc::new(TempFileTracker::new(&config.temp_dir));
        let limiter = Arc::new(ConcurrencyLimiter::new(transport.clone(), &config.max_jobs));
        let pipeline = MediaPipeline::new(&config, store, transport.clone(), tracker, limiter.clone());
        Self::with_pipeline(config, transport, limiter, pipeline)
    }

    /// Build around an existing pipeline, which must share `limiter`.
    pub fn with_pipeline(
        config: WorkerConfig,
        transport: Arc<dyn QueueTransport>,
        limiter: Arc<ConcurrencyLimiter>,
        pipeline: MediaPipeline,
    ) -> Self {
        Self {
            config: Arc::new(config),
            publisher: UpdatePublisher::new(transport.clone()),
            transport,
            limiter,
            pipeline: Arc::new(pipeline),
            active: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            batch_size: 4,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn pipeline(&self) -> &Arc<MediaPipeline> {
        &self.pipeline
    }

    /// Token that stops the consumer loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel a running job. Returns false if no such job is active.
    pub fn cancel(&self, media_id: &MediaId) -> bool {
        match self.active.get(media_id) {
            Some(token) => {
                info!(media_id = %media_id, "Cancelling job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Consume until shutdown, then wait for in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            batch_size = self.batch_size,
            limits = ?self.config.max_jobs,
            "Starting job executor"
        );

        self.transport.init().await?;
        let swept = self.pipeline.tracker().sweep_orphans().await?;
        debug!(swept, "Temp root ready");
        self.limiter.subscribe_all().await?;

        let maintenance = self.spawn_maintenance();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping executor");
                    break;
                }
                result = self.transport.receive(self.batch_size) => {
                    match result {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                self.dispatch(delivery).await;
                            }
                        }
                        Err(e) => {
                            error!("Error receiving requests: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.limiter.pause().await {
            warn!("Failed to unsubscribe on shutdown: {}", e);
        }
        maintenance.abort();

        info!(in_flight = self.tasks.len(), "Waiting for in-flight jobs to complete...");
        self.tasks.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "Shutdown timeout reached with jobs still running"
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Validate a delivery, take a slot for it and start its job.
    pub async fn dispatch(&self, delivery: Delivery) {
        let request = match &delivery.message.body {
            MessageBody::Request(request) => request.clone(),
            other => {
                warn!(
                    id = %delivery.id,
                    message_type = ?other,
                    "Ignoring non-request message on request topic"
                );
                self.ack(&delivery).await;
                return;
            }
        };

        if let Err(e) = self.validate(&delivery.message, &request) {
            warn!(
                media_id = %delivery.message.media_id,
                "Rejecting request: {}", e
            );
            if let Err(e) = self.publisher.reject(&delivery.message, e.to_string()).await {
                error!("Failed to publish rejection: {}", e);
            }
            self.ack(&delivery).await;
            return;
        }

        let message = &delivery.message;
        let mut job = MediaJob::from_request(
            message.media_type,
            message.media_id.clone(),
            message.user_id.clone(),
            &request,
        );

        let Some(token) = self.limiter.start_job(job.media_type, &job.job_id).await else {
            // Saturated: leave the request to another consumer.
            debug!(media_id = %job.media_id, "No slot, releasing request");
            if let Err(e) = self.transport.release(&delivery).await {
                error!("Failed to release request: {}", e);
            }
            return;
        };

        let cancel = CancellationToken::new();
        self.active.insert(job.media_id.clone(), cancel.clone());
        self.in_flight.insert(delivery.id.clone(), delivery.clone());

        let pipeline = self.pipeline.clone();
        let limiter = self.limiter.clone();
        let transport = self.transport.clone();
        let active = self.active.clone();
        let in_flight = self.in_flight.clone();

        self.tasks.spawn(async move {
            let outcome = pipeline.process(&mut job, &cancel).await;

            let settled = if outcome.reported {
                transport.ack(&delivery).await
            } else {
                // The terminal message was lost; let the request run again.
                transport.release(&delivery).await
            };
            if let Err(e) = settled {
                error!(media_id = %job.media_id, "Failed to settle request: {}", e);
            }

            in_flight.remove(&delivery.id);
            active.remove(&job.media_id);
            limiter.finish_job(token).await;
        });
    }

    /// Reject requests that can never succeed before they take a slot.
    fn validate(&self, message: &QueueMessage, request: &RequestBody) -> WorkerResult<()> {
        if !message.media_type.is_queued() {
            return Err(WorkerError::invalid_request(format!(
                "{} has no request queue",
                message.media_type
            )));
        }
        if request.s3_key.trim().is_empty() {
            return Err(WorkerError::invalid_request("missing s3Key"));
        }
        let max = self.config.upload.max_file_size;
        if request.file_size > max {
            return Err(WorkerError::invalid_request(format!(
                "file size {} exceeds maximum {}",
                request.file_size, max
            )));
        }
        if !self.config.is_mime_allowed(&request.mime_type) {
            return Err(WorkerError::Unsupported(request.mime_type.clone()));
        }
        match MediaType::from_mime(&request.mime_type) {
            Some(media_type) if media_type == message.media_type => Ok(()),
            _ => Err(WorkerError::invalid_request(format!(
                "mime type {} does not match media type {}",
                request.mime_type, message.media_type
            ))),
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.transport.ack(delivery).await {
            error!(id = %delivery.id, "Failed to ack: {}", e);
        }
    }

    /// Refresh ownership of in-flight requests and claim abandoned ones.
    fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let transport = self.transport.clone();
        let in_flight = self.in_flight.clone();
        let shutdown = self.shutdown.clone();
        let claim_interval = self.config.claim_interval;
        let claim_min_idle = self.config.claim_min_idle;
        let heartbeat_interval = self.config.heartbeat_interval;
        let (claimed_tx, mut claimed_rx) = tokio::sync::mpsc::channel::<Delivery>(16);

        let handle = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            let mut claim = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = heartbeat.tick() => {
                        let deliveries: Vec<Delivery> =
                            in_flight.iter().map(|e| e.value().clone()).collect();
                        if !deliveries.is_empty() {
                            if let Err(e) = transport.touch(&deliveries).await {
                                warn!("Failed to refresh in-flight requests: {}", e);
                            }
                        }
                    }
                    _ = claim.tick() => {
                        match transport.claim_stale(claim_min_idle, 5).await {
                            Ok(claimed) if !claimed.is_empty() => {
                                info!(count = claimed.len(), "Claimed abandoned requests");
                                for delivery in claimed {
                                    if claimed_tx.send(delivery).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim abandoned requests: {}", e),
                        }
                    }
                }
            }
        });

        // Claimed deliveries go through the same dispatch path.
        let executor = self.dispatcher();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delivery = claimed_rx.recv() => match delivery {
                        Some(delivery) => executor.dispatch(delivery).await,
                        None => break,
                    },
                }
            }
        });

        handle
    }

    /// A handle sharing this executor's state, for use from background tasks.
    fn dispatcher(&self) -> JobExecutor {
        JobExecutor {
            config: self.config.clone(),
            transport: self.transport.clone(),
            limiter: self.limiter.clone(),
            pipeline: self.pipeline.clone(),
            publisher: self.publisher.clone(),
            active: self.active.clone(),
            in_flight: self.in_flight.clone(),
            tasks: self.tasks.clone(),
            shutdown: self.shutdown.clone(),
            batch_size: self.batch_size,
        }
    }
}
