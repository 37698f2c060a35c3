//! Promotion, retry exhaustion, cancellation and expiry against the in-memory broker

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use courier_broker::{BrokerPublisher, EnvelopeRouter, InMemoryBroker, PublishOptions, Topology};
use courier_common::{ChannelType, DeliveryState, Envelope};
use courier_ledger::{InMemoryStatusLedger, StatusLedgerService};
use courier_scheduler::{
    DeferredEntry, DeferredScheduler, DeferredSchedulerConfig, InMemoryDeferredStore, PromotionOutcome,
    SchedulerError,
};

struct Harness {
    broker: InMemoryBroker,
    ledger: StatusLedgerService,
    scheduler: DeferredScheduler,
}

fn harness() -> Harness {
    let topology = Arc::new(Topology::standard());
    let broker = InMemoryBroker::with_topology(&topology).unwrap();
    let router = EnvelopeRouter::new(Arc::new(broker.clone()), topology);
    let ledger = StatusLedgerService::new(Arc::new(InMemoryStatusLedger::new()));
    let scheduler = DeferredScheduler::new(
        DeferredSchedulerConfig::default(),
        Arc::new(InMemoryDeferredStore::new()),
        router,
        ledger.clone(),
    );
    Harness {
        broker,
        ledger,
        scheduler,
    }
}

async fn schedule(h: &Harness, offset: Duration) -> String {
    let at = Utc::now() + offset;
    let envelope = Envelope::unicast(ChannelType::Email, "a@x.com", "reminder").scheduled_for(at);
    let id = envelope.id.clone();
    h.ledger
        .create_entry_with_state(&id, "a@x.com", ChannelType::Email, "u1", DeliveryState::Scheduled)
        .await
        .unwrap();
    h.scheduler.schedule(DeferredEntry::new(envelope, at)).await;
    id
}

#[tokio::test]
async fn test_entry_not_promoted_before_its_time() {
    let h = harness();
    let id = schedule(&h, Duration::seconds(20)).await;

    assert!(h.scheduler.promote_due(Utc::now()).await.is_empty());
    assert_eq!(h.scheduler.count().await, 1);
    assert_eq!(h.broker.ready_count("email.queue"), 0);

    let handles = h.scheduler.promote_due(Utc::now() + Duration::seconds(21)).await;
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), PromotionOutcome::Promoted);
    }

    assert_eq!(h.scheduler.count().await, 0);
    assert_eq!(h.broker.peek("email.queue")[0].id, id);
    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Queued);
}

#[tokio::test]
async fn test_three_failed_promotions_exhaust_entry() {
    let h = harness();
    let id = schedule(&h, Duration::seconds(-1)).await;
    h.broker.set_available(false);

    for attempt in 1..=2 {
        let handles = h.scheduler.promote_due(Utc::now()).await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap(),
                PromotionOutcome::Requeued { attempts: attempt }
            );
        }
        assert_eq!(h.scheduler.count().await, 1);
    }

    let handles = h.scheduler.promote_due(Utc::now()).await;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::RetryExhausted { attempts: 3, .. })));
    }

    assert_eq!(h.scheduler.count().await, 0);
    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Failed);
    assert!(record.error_detail.unwrap().contains("retries exhausted"));
}

#[tokio::test]
async fn test_failed_promotion_counts_retry_and_keeps_record_queued() {
    let h = harness();
    let id = schedule(&h, Duration::seconds(-1)).await;
    h.broker.set_available(false);

    for handle in h.scheduler.promote_due(Utc::now()).await {
        assert_eq!(handle.await.unwrap().unwrap(), PromotionOutcome::Requeued { attempts: 1 });
    }
    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Queued);

    h.broker.set_available(true);
    for handle in h.scheduler.promote_due(Utc::now()).await {
        assert_eq!(handle.await.unwrap().unwrap(), PromotionOutcome::Promoted);
    }

    let published = h.broker.peek("email.queue");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].retry_count, 1);
    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Queued);
    assert!(record.error_detail.is_none());
}

#[tokio::test]
async fn test_cancel_present_and_absent() {
    let h = harness();
    let id = schedule(&h, Duration::seconds(20)).await;

    assert!(h.scheduler.cancel(&id).await.unwrap());
    assert!(!h.scheduler.cancel(&id).await.unwrap());
    assert!(!h.scheduler.cancel("never-scheduled").await.unwrap());

    assert!(h.scheduler.promote_due(Utc::now() + Duration::minutes(5)).await.is_empty());
    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Cancelled);
    assert_eq!(h.broker.ready_count("email.queue"), 0);
}

#[tokio::test]
async fn test_expiry_sweep_drops_stale_entries() {
    let h = harness();
    let stale = schedule(&h, Duration::days(-2)).await;
    let fresh = schedule(&h, Duration::minutes(10)).await;

    let expired = h.scheduler.expire_stale(Utc::now()).await.unwrap();
    assert_eq!(expired, 1);
    assert_eq!(h.scheduler.count().await, 1);

    let record = h.ledger.find_by_key(&stale, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Failed);
    assert_eq!(record.error_detail.as_deref(), Some("expired before delivery"));
    let record = h.ledger.find_by_key(&fresh, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Scheduled);
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_halts() {
    let h = harness();
    h.scheduler.start().await;
    h.scheduler.start().await;
    assert!(h.scheduler.is_running().await);
    h.scheduler.stop().await;
    assert!(!h.scheduler.is_running().await);
}

/// Publisher that notes the ledger state of each envelope as it is published
struct LedgerAwarePublisher {
    ledger: StatusLedgerService,
    seen: tokio::sync::Mutex<Vec<Option<DeliveryState>>>,
}

#[async_trait]
impl BrokerPublisher for LedgerAwarePublisher {
    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        envelope: &Envelope,
        _options: PublishOptions,
    ) -> courier_broker::Result<()> {
        let state = self
            .ledger
            .find_by_key(&envelope.id, &envelope.recipients[0])
            .await
            .unwrap()
            .map(|r| r.state);
        self.seen.lock().await.push(state);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_record_is_queued_before_publish() {
    let ledger = StatusLedgerService::new(Arc::new(InMemoryStatusLedger::new()));
    let publisher = Arc::new(LedgerAwarePublisher {
        ledger: ledger.clone(),
        seen: tokio::sync::Mutex::new(Vec::new()),
    });
    let router = EnvelopeRouter::new(publisher.clone(), Arc::new(Topology::standard()));
    let scheduler = DeferredScheduler::new(
        DeferredSchedulerConfig::default(),
        Arc::new(InMemoryDeferredStore::new()),
        router,
        ledger.clone(),
    );

    let at = Utc::now() - Duration::seconds(1);
    let envelope = Envelope::unicast(ChannelType::Sms, "+34600000000", "ping").scheduled_for(at);
    ledger
        .create_entry_with_state(&envelope.id, "+34600000000", ChannelType::Sms, "u1", DeliveryState::Scheduled)
        .await
        .unwrap();
    scheduler.schedule(DeferredEntry::new(envelope, at)).await;

    for handle in scheduler.promote_due(Utc::now()).await {
        assert_eq!(handle.await.unwrap().unwrap(), PromotionOutcome::Promoted);
    }
    assert_eq!(*publisher.seen.lock().await, vec![Some(DeliveryState::Queued)]);
}
