//! Promotion and expiry sweeps over a [`DeferredStore`]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_broker::EnvelopeRouter;
use courier_common::DeliveryState;
use courier_ledger::StatusLedgerService;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::store::{DeferredEntry, DeferredStore};
use crate::{Result, SchedulerError};

#[derive(Debug, Clone)]
pub struct DeferredSchedulerConfig {
    pub enabled: bool,
    pub sweep_interval: Duration,
    pub expiry_interval: Duration,
    /// Entries scheduled further back than this are expired by the expiry sweep
    pub stale_after: Duration,
    pub max_promotion_attempts: u32,
}

impl Default for DeferredSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(30),
            expiry_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(24 * 3600),
            max_promotion_attempts: 3,
        }
    }
}

/// What happened to one claimed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Published to the direct exchange
    Promoted,
    /// Publish failed; the entry is back in the store
    Requeued { attempts: u32 },
}

#[derive(Clone)]
pub struct DeferredScheduler {
    config: DeferredSchedulerConfig,
    store: Arc<dyn DeferredStore>,
    router: EnvelopeRouter,
    ledger: StatusLedgerService,
    running: Arc<RwLock<bool>>,
}

impl DeferredScheduler {
    pub fn new(
        config: DeferredSchedulerConfig,
        store: Arc<dyn DeferredStore>,
        router: EnvelopeRouter,
        ledger: StatusLedgerService,
    ) -> Self {
        Self {
            config,
            store,
            router,
            ledger,
            running: Arc::new(RwLock::new(false)),
        }
    }

    // ========================================================================
    // Entry operations
    // ========================================================================

    /// Park an envelope until `at`
    pub async fn schedule(&self, entry: DeferredEntry) {
        debug!(
            message_id = %entry.message_id(),
            scheduled_at = %entry.scheduled_at,
            "Envelope held in deferred store"
        );
        self.store.insert(entry).await;
        metrics::gauge!("courier.scheduler.pending").set(self.store.count().await as f64);
    }

    /// Cancel a pending entry and mark its records CANCELLED. Returns false
    /// when the id is absent, including when a sweep already claimed it.
    pub async fn cancel(&self, message_id: &str) -> Result<bool> {
        if self.store.take(message_id).await.is_none() {
            debug!(message_id = %message_id, "Cancel requested for absent deferred entry");
            return Ok(false);
        }

        self.ledger
            .transition(message_id, DeliveryState::Cancelled, Some("cancelled before delivery".to_string()))
            .await?;
        info!(message_id = %message_id, "Deferred entry cancelled");
        Ok(true)
    }

    pub async fn count(&self) -> usize {
        self.store.count().await
    }

    pub async fn entries_for_owner(&self, owner_id: &str) -> Vec<DeferredEntry> {
        self.store.entries_for_owner(owner_id).await
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Claim every entry due at `now` and publish each on its own task
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<Result<PromotionOutcome>>> {
        let due = self.store.due(now).await;
        if !due.is_empty() {
            debug!(count = due.len(), "Promoting due deferred entries");
        }

        let mut handles = Vec::with_capacity(due.len());
        for message_id in due {
            // Lost to a concurrent cancel
            let Some(entry) = self.store.take(&message_id).await else {
                continue;
            };

            let scheduler = self.clone();
            let span = info_span!("promote", message_id = %message_id, channel = %entry.envelope.channel);
            handles.push(tokio::spawn(
                async move {
                    let result = scheduler.promote(entry).await;
                    match &result {
                        Err(SchedulerError::RetryExhausted { .. }) | Ok(_) => {}
                        Err(e) => error!(error = %e, "Deferred promotion failed"),
                    }
                    result
                }
                .instrument(span),
            ));
        }

        metrics::gauge!("courier.scheduler.pending").set(self.store.count().await as f64);
        handles
    }

    /// Move the records to QUEUED, then publish. The record is written before
    /// the publish so a consumer can never see the envelope while the record
    /// still says SCHEDULED. A failed publish leaves the record QUEUED and the
    /// entry back in the store; cancel, expiry and exhaustion all move on
    /// from QUEUED.
    async fn promote(&self, mut entry: DeferredEntry) -> Result<PromotionOutcome> {
        let message_id = entry.message_id().to_string();

        // Later attempts already moved the record
        if entry.attempts == 0 {
            if let Err(e) = self.ledger.transition(&message_id, DeliveryState::Queued, None).await {
                self.store.insert(entry).await;
                return Err(e.into());
            }
        }

        match self.router.publish_direct(&entry.envelope).await {
            Ok(()) => {
                metrics::counter!("courier.scheduler.promoted_total").increment(1);
                info!(message_id = %message_id, "Deferred envelope promoted");
                Ok(PromotionOutcome::Promoted)
            }
            Err(e) => {
                entry.attempts += 1;
                entry.envelope.retry_count += 1;
                metrics::counter!("courier.scheduler.promotion_failures_total").increment(1);

                if entry.attempts >= self.config.max_promotion_attempts {
                    error!(
                        message_id = %message_id,
                        attempts = entry.attempts,
                        error = %e,
                        "Deferred envelope retries exhausted"
                    );
                    self.ledger
                        .transition(&message_id, DeliveryState::Failed, Some(format!("retries exhausted: {e}")))
                        .await?;
                    metrics::counter!("courier.scheduler.retries_exhausted_total").increment(1);
                    return Err(SchedulerError::RetryExhausted {
                        message_id,
                        attempts: entry.attempts,
                    });
                }

                warn!(
                    message_id = %message_id,
                    attempts = entry.attempts,
                    error = %e,
                    "Deferred promotion failed, entry kept for next sweep"
                );
                let attempts = entry.attempts;
                self.store.insert(entry).await;
                Ok(PromotionOutcome::Requeued { attempts })
            }
        }
    }

    /// Drop entries scheduled more than `stale_after` before `now`, marking
    /// their records FAILED. Returns how many were expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::days(1));
        let cutoff = now - stale_after;

        let mut expired = 0;
        for message_id in self.store.stale(cutoff).await {
            let Some(entry) = self.store.take(&message_id).await else {
                continue;
            };
            warn!(
                message_id = %message_id,
                scheduled_at = %entry.scheduled_at,
                attempts = entry.attempts,
                "Deferred entry expired without delivery"
            );
            self.ledger
                .transition(&message_id, DeliveryState::Failed, Some("expired before delivery".to_string()))
                .await?;
            expired += 1;
        }

        if expired > 0 {
            metrics::counter!("courier.scheduler.expired_total").increment(expired as u64);
            metrics::gauge!("courier.scheduler.pending").set(self.store.count().await as f64);
            info!(expired, "Expired stale deferred entries");
        }
        Ok(expired)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Deferred scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Deferred scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            expiry_interval_ms = self.config.expiry_interval.as_millis() as u64,
            max_promotion_attempts = self.config.max_promotion_attempts,
            "Starting deferred scheduler"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.sweep_interval);
            loop {
                ticker.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                // Promotions run detached; the sweep never waits on a publish
                drop(scheduler.promote_due(Utc::now()).await);
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.expiry_interval);
            loop {
                ticker.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                if let Err(e) = scheduler.expire_stale(Utc::now()).await {
                    error!(error = %e, "Error in deferred expiry sweep");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Deferred scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
