//! Queue processing loop
//!
//! Every poll interval the processor claims a batch of due entries and hands
//! each to its own task. Claims are atomic in the store, so several
//! processors may share one database without delivering an entry twice.
//! Entries for local recipients are appended to their INBOX instead of
//! going through the transport.

use crate::config::Config;
use crate::error::{DeliveryError, MailError, Result};
use crate::model::{QueueEntry, QueueStatus};
use crate::queue::backoff::Backoff;
use crate::queue::bounce::BounceSender;
use crate::queue::transport::DeliveryTransport;
use crate::smtp::LocalDelivery;
use crate::store::MailStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const STATUS_WRITE_ATTEMPTS: u32 = 3;
const STATUS_WRITE_PAUSE: Duration = Duration::from_millis(200);

pub struct QueueProcessor {
    store: Arc<dyn MailStore>,
    delivery: Arc<LocalDelivery>,
    transport: Arc<dyn DeliveryTransport>,
    bounces: BounceSender,
    backoff: Backoff,
    batch_size: usize,
    poll_interval: Duration,
    delivery_timeout: Duration,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

impl QueueProcessor {
    pub fn new(
        config: &Config,
        delivery: Arc<LocalDelivery>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let queue = &config.queue;
        Self {
            store: delivery.store().clone(),
            delivery: delivery.clone(),
            transport,
            bounces: BounceSender::new(delivery, config.server.hostname.clone(), queue.max_attempts),
            backoff: Backoff::new(queue.retry_base_delay(), queue.max_retry_delay()),
            batch_size: queue.batch_size,
            poll_interval: queue.poll_interval(),
            delivery_timeout: queue.delivery_timeout(),
            max_concurrent: queue.max_concurrent_deliveries,
            permits: Arc::new(Semaphore::new(queue.max_concurrent_deliveries)),
        }
    }

    /// Poll until `shutdown` fires, then wait for in-flight deliveries
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let released = self.store.release_stale_claims(Utc::now()).await?;
        if released > 0 {
            warn!("Released {} queue entries left in processing", released);
        }
        info!(
            "Queue processor started (interval {:?}, batch {})",
            self.poll_interval, self.batch_size
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Queue cycle failed: {}", e);
                    }
                }
            }
        }

        info!("Queue processor stopping, waiting for in-flight deliveries");
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        if tokio::time::timeout(self.delivery_timeout, self.permits.acquire_many(all))
            .await
            .is_err()
        {
            warn!("In-flight deliveries did not finish before shutdown");
        }
        Ok(())
    }

    /// Claim due entries and spawn one delivery task per entry
    ///
    /// Never claims more than there are free delivery slots, so claimed
    /// entries do not sit in `processing` waiting for a permit.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let limit = self.batch_size.min(self.permits.available_permits());
        if limit == 0 {
            debug!("All delivery slots busy, skipping cycle");
            return Ok(Vec::new());
        }

        let claimed = self.store.claim_due(Utc::now(), limit).await?;
        if !claimed.is_empty() {
            debug!("Claimed {} queue entries", claimed.len());
        }

        let mut handles = Vec::with_capacity(claimed.len());
        for entry in claimed {
            let this = Arc::clone(self);
            let span = info_span!("delivery", entry = %entry.id, to = %entry.to_addr);
            handles.push(tokio::spawn(
                async move {
                    let Ok(_permit) = this.permits.clone().acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = this.process(entry).await {
                        error!("Queue entry processing failed: {}", e);
                    }
                }
                .instrument(span),
            ));
        }
        Ok(handles)
    }

    /// Deliver one entry immediately, regardless of its schedule
    ///
    /// Returns `false` when the entry does not exist or is not claimable.
    pub async fn trigger(&self, id: Uuid) -> Result<bool> {
        match self.store.claim_entry(id, Utc::now()).await? {
            Some(entry) => {
                self.process(entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Make a deferred entry due at the next cycle
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        self.store.requeue(id, Utc::now()).await
    }

    async fn process(&self, entry: QueueEntry) -> Result<()> {
        let result = self.deliver_and_record(&entry).await;
        if let Err(e) = &result {
            self.release_claim(&entry, e).await;
        }
        result
    }

    async fn deliver_and_record(&self, entry: &QueueEntry) -> Result<()> {
        let outcome = match self.store.outbound_message(entry.message_id).await? {
            Some(message) if self.delivery.is_local(&entry.to_addr) => {
                self.attempt_local(entry, &message).await
            }
            Some(message) => self.attempt(entry, &message).await,
            None => Err(DeliveryError::Permanent(
                "message content is missing".to_string(),
            )),
        };
        self.apply_outcome(entry, outcome).await
    }

    /// Put an entry still in `processing` back on the retry schedule
    ///
    /// Cycles never claim `processing` entries, so one left there after a
    /// store error would wait for the next restart.
    async fn release_claim(&self, entry: &QueueEntry, cause: &MailError) {
        match self.store.get_queue_entry(entry.id).await {
            Ok(Some(current)) if current.status != QueueStatus::Processing => return,
            Ok(None) => return,
            _ => {}
        }

        let next_attempt = Utc::now() + self.retry_delay(entry.attempts);
        let reason = format!("local error: {}", cause);
        let reason = reason.as_str();
        match self
            .write_status(move || self.store.mark_deferred(entry.id, reason, next_attempt))
            .await
        {
            Ok(()) => warn!(
                "Released <{}> after a store error, next attempt at {}",
                entry.to_addr, next_attempt
            ),
            Err(e) => error!(
                "Could not release <{}>, it stays in processing until restart: {}",
                entry.to_addr, e
            ),
        }
    }

    /// Run a queue status write, retrying store errors a few times
    async fn write_status<F, Fut>(&self, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < STATUS_WRITE_ATTEMPTS => {
                    warn!("Queue status write failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(STATUS_WRITE_PAUSE * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_delay(&self, attempts: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.backoff.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    async fn attempt(&self, entry: &QueueEntry, message: &[u8]) -> std::result::Result<(), DeliveryError> {
        info!(
            "Delivery attempt {}/{} for <{}>",
            entry.attempts, entry.max_attempts, entry.to_addr
        );
        tokio::time::timeout(
            self.delivery_timeout,
            self.transport.deliver(&entry.from_addr, &entry.to_addr, message),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DeliveryError::Transient(format!(
                "delivery timed out after {:?}",
                self.delivery_timeout
            )))
        })
    }

    async fn attempt_local(
        &self,
        entry: &QueueEntry,
        message: &[u8],
    ) -> std::result::Result<(), DeliveryError> {
        info!(
            "Local delivery attempt {}/{} for <{}>",
            entry.attempts, entry.max_attempts, entry.to_addr
        );
        match self.delivery.deliver_local(&entry.to_addr, message).await {
            Ok(_) => Ok(()),
            Err(MailError::NotFound(what)) => Err(DeliveryError::Permanent(format!(
                "550 5.1.1 {} unavailable",
                what
            ))),
            Err(e) => Err(DeliveryError::Transient(e.to_string())),
        }
    }

    async fn apply_outcome(
        &self,
        entry: &QueueEntry,
        outcome: std::result::Result<(), DeliveryError>,
    ) -> Result<()> {
        let now = Utc::now();
        match outcome {
            Ok(()) => {
                self.write_status(move || self.store.mark_sent(entry.id, now))
                    .await?;
                info!("Delivered to <{}>", entry.to_addr);
            }
            Err(DeliveryError::Permanent(reason)) => {
                warn!("Permanent failure for <{}>: {}", entry.to_addr, reason);
                let error = reason.as_str();
                self.write_status(move || self.store.mark_bounced(entry.id, error))
                    .await?;
                self.bounces.send(entry, &reason).await?;
            }
            Err(DeliveryError::Transient(reason)) if entry.attempts_exhausted() => {
                warn!(
                    "Giving up on <{}> after {} attempts: {}",
                    entry.to_addr, entry.attempts, reason
                );
                let error = reason.as_str();
                self.write_status(move || self.store.mark_failed(entry.id, error))
                    .await?;
                self.bounces.send(entry, &reason).await?;
            }
            Err(DeliveryError::Transient(reason)) => {
                let next_attempt = now + self.retry_delay(entry.attempts);
                info!(
                    "Deferring <{}> until {}: {}",
                    entry.to_addr, next_attempt, reason
                );
                let error = reason.as_str();
                self.write_status(move || self.store.mark_deferred(entry.id, error, next_attempt))
                    .await?;
            }
        }
        Ok(())
    }
}
