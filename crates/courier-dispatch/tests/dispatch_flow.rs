//! End-to-end flows: gateway -> in-memory broker -> channel consumers -> ledger

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_broker::{BrokerPublisher, EnvelopeRouter, InMemoryBroker, PublishOptions, Topology};
use courier_common::{ChannelSelection, ChannelType, DeliveryState, Envelope, StatusRecord};
use courier_dispatch::{
    BroadcastRequest, ChannelSender, ConsumerGroup, ConsumerSettings, DeadLetterFailureHook, DeliveryProcessor,
    DispatchError, DispatchGateway, GatewayConfig, MultiChannelRequest, UnicastRequest, WorkerPool,
};
use courier_ledger::{InMemoryStatusLedger, StatusLedgerRepository, StatusLedgerService};
use courier_scheduler::{DeferredScheduler, DeferredSchedulerConfig, InMemoryDeferredStore};
use parking_lot::Mutex;

/// Records every delivery; fails recipients listed in `reject`
struct RecordingSender {
    channel: ChannelType,
    reject: Vec<String>,
    delivered: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    fn new(channel: ChannelType, reject: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            channel,
            reject: reject.iter().map(|r| r.to_string()).collect(),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        let recipient = envelope.recipients[0].clone();
        let ok = !self.reject.contains(&recipient);
        self.delivered.lock().push((envelope.id.clone(), recipient));
        ok
    }
}

/// In-memory ledger whose message-id lookups take `delay`, like a remote database
struct SlowLookupLedger {
    inner: InMemoryStatusLedger,
    delay: Duration,
}

#[async_trait]
impl StatusLedgerRepository for SlowLookupLedger {
    async fn save(&self, record: &StatusRecord) -> courier_ledger::Result<()> {
        self.inner.save(record).await
    }

    async fn delete_by_message_id(&self, message_id: &str) -> courier_ledger::Result<u64> {
        self.inner.delete_by_message_id(message_id).await
    }

    async fn find_by_key(&self, message_id: &str, recipient: &str) -> courier_ledger::Result<Option<StatusRecord>> {
        self.inner.find_by_key(message_id, recipient).await
    }

    async fn find_by_message_id(&self, message_id: &str) -> courier_ledger::Result<Vec<StatusRecord>> {
        let records = self.inner.find_by_message_id(message_id).await;
        tokio::time::sleep(self.delay).await;
        records
    }

    async fn find_by_recipient(&self, recipient: &str) -> courier_ledger::Result<Vec<StatusRecord>> {
        self.inner.find_by_recipient(recipient).await
    }

    async fn find_by_state(&self, state: DeliveryState) -> courier_ledger::Result<Vec<StatusRecord>> {
        self.inner.find_by_state(state).await
    }

    async fn find_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> courier_ledger::Result<Vec<StatusRecord>> {
        self.inner.find_by_time_range(from, to).await
    }

    async fn find_by_owner_order_by_time_desc(&self, owner_id: &str) -> courier_ledger::Result<Vec<StatusRecord>> {
        self.inner.find_by_owner_order_by_time_desc(owner_id).await
    }

    async fn count_by_state(&self, state: DeliveryState) -> courier_ledger::Result<u64> {
        self.inner.count_by_state(state).await
    }
}

struct Harness {
    broker: InMemoryBroker,
    ledger: StatusLedgerService,
    scheduler: DeferredScheduler,
    gateway: DispatchGateway,
    pool: Arc<WorkerPool>,
    consumers: ConsumerGroup,
    email: Arc<RecordingSender>,
    sms: Arc<RecordingSender>,
}

impl Harness {
    async fn new(horizon: Duration, reject: &[&str]) -> Self {
        Self::with_repository(horizon, reject, Arc::new(InMemoryStatusLedger::new())).await
    }

    async fn with_repository(horizon: Duration, reject: &[&str], repository: Arc<dyn StatusLedgerRepository>) -> Self {
        let topology = Arc::new(Topology::standard());
        let broker = InMemoryBroker::with_topology(&topology).unwrap();
        let router = EnvelopeRouter::new(Arc::new(broker.clone()), topology.clone());
        let ledger = StatusLedgerService::new(repository);
        let pool = Arc::new(WorkerPool::new(4, 64));

        let scheduler = DeferredScheduler::new(
            DeferredSchedulerConfig {
                sweep_interval: Duration::from_millis(100),
                ..Default::default()
            },
            Arc::new(InMemoryDeferredStore::new()),
            router.clone(),
            ledger.clone(),
        );

        let gateway = DispatchGateway::new(
            GatewayConfig {
                broker_horizon: horizon,
                ..Default::default()
            },
            Arc::new(broker.clone()),
            router.clone(),
            ledger.clone(),
            scheduler.clone(),
            pool.clone(),
        );

        Self {
            broker,
            ledger,
            scheduler,
            gateway,
            pool,
            consumers: ConsumerGroup::new(),
            email: RecordingSender::new(ChannelType::Email, reject),
            sms: RecordingSender::new(ChannelType::Sms, reject),
        }
    }

    async fn start_consumers(&self) {
        let topology = Topology::standard();
        let router = EnvelopeRouter::new(Arc::new(self.broker.clone()), Arc::new(topology.clone()));
        let settings = ConsumerSettings {
            workers_per_queue: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
        };

        let senders: [Arc<dyn ChannelSender>; 2] = [self.email.clone(), self.sms.clone()];
        for sender in senders {
            let queue = topology.route(sender.channel()).queue.clone();
            let hook = Arc::new(DeadLetterFailureHook::new(router.clone()));
            let processor = Arc::new(DeliveryProcessor::new(sender, self.ledger.clone(), hook));
            self.consumers.spawn(&self.broker, &queue, processor, &settings).await.unwrap();
        }
    }

    async fn state_of(&self, message_id: &str, recipient: &str) -> Option<DeliveryState> {
        self.ledger
            .find_by_key(message_id, recipient)
            .await
            .unwrap()
            .map(|r| r.state)
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_record_exists_before_send_returns() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    let submission = h
        .gateway
        .send_unicast(UnicastRequest::email("a@x.com", "Hi", "Hello there"))
        .await
        .unwrap();

    let state = h.state_of(submission.message_id(), "a@x.com").await;
    assert!(state.is_some());
    submission.wait().await.unwrap();
    assert_eq!(h.broker.ready_count("email.queue"), 1);
}

#[tokio::test]
async fn test_validation_rejects_before_side_effects() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;

    let blank_recipient = h.gateway.send_unicast(UnicastRequest::sms("  ", "code")).await;
    assert!(matches!(blank_recipient, Err(DispatchError::Validation(_))));

    let blank_body = h.gateway.send_unicast(UnicastRequest::email("a@x.com", "s", "")).await;
    assert!(matches!(blank_body, Err(DispatchError::Validation(_))));

    let empty_broadcast = h.gateway.broadcast(BroadcastRequest::email(vec![], None, "hi")).await;
    assert!(matches!(empty_broadcast, Err(DispatchError::Validation(_))));

    assert_eq!(h.ledger.report(Utc::now()).await.unwrap().total, 0);
    assert_eq!(h.broker.ready_count("email.queue"), 0);
}

#[tokio::test]
async fn test_broadcast_delivers_each_recipient_once() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.start_consumers().await;

    let submission = h
        .gateway
        .broadcast(BroadcastRequest::email(
            vec!["a@x.com".into(), "b@x.com".into()],
            Some("News".into()),
            "Quarterly update",
        ))
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    let records = h.ledger.find_by_message_id(&id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| matches!(r.state, DeliveryState::Queued | DeliveryState::Processing | DeliveryState::Sent)));

    assert!(
        eventually(|| async move {
            h.state_of(&id, "a@x.com").await == Some(DeliveryState::Sent)
                && h.state_of(&id, "b@x.com").await == Some(DeliveryState::Sent)
        })
        .await
    );

    // The SMS queue got a fan-out copy too; it must be drained without delivery
    assert!(eventually(|| async move { h.broker.ready_count("sms.queue") == 0 }).await);
    assert_eq!(h.email.count(), 2);
    assert_eq!(h.sms.count(), 0);
    h.consumers.stop().await;
}

#[tokio::test]
async fn test_broadcast_partial_failure_is_isolated() {
    let h = &Harness::new(Duration::from_secs(60), &["bad@x.com"]).await;
    h.start_consumers().await;

    let submission = h
        .gateway
        .broadcast(BroadcastRequest::email(
            vec!["a@x.com".into(), "bad@x.com".into(), "c@x.com".into()],
            None,
            "Hello",
        ))
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    assert!(
        eventually(|| async move {
            h.ledger
                .find_by_message_id(&id)
                .await
                .unwrap()
                .iter()
                .all(|r| r.state.is_terminal())
        })
        .await
    );

    assert_eq!(h.state_of(&id, "a@x.com").await, Some(DeliveryState::Sent));
    assert_eq!(h.state_of(&id, "bad@x.com").await, Some(DeliveryState::Failed));
    assert_eq!(h.state_of(&id, "c@x.com").await, Some(DeliveryState::Sent));

    // Dead-letter hook parked a single-recipient copy
    let dead = h.broker.peek("email.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].recipients, vec!["bad@x.com".to_string()]);
    h.consumers.stop().await;
}

#[tokio::test]
async fn test_publish_failure_marks_record_failed() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.broker.set_available(false);

    let submission = h
        .gateway
        .send_unicast(UnicastRequest::sms("+34600000000", "code 1234"))
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    assert!(matches!(submission.wait().await, Err(DispatchError::Publish(_))));
    let record = h.ledger.find_by_key(&id, "+34600000000").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Failed);
    assert!(record.error_detail.unwrap().starts_with("publish failed"));
}

#[tokio::test]
async fn test_retry_republishes_failed_recipients() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.broker.set_available(false);

    let request = UnicastRequest::email("a@x.com", "Invoice", "Attached").with_attachment("invoice-42.pdf");
    let submission = h.gateway.send_unicast(request).await.unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();
    let _ = submission.wait().await;

    h.broker.set_available(true);
    let envelope = Envelope {
        id: id.to_string(),
        ..Envelope::unicast(ChannelType::Email, "a@x.com", "Attached")
    };
    h.gateway.retry(envelope).await.unwrap().wait().await.unwrap();

    let record = h.ledger.find_by_key(&id, "a@x.com").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Queued);
    assert_eq!(record.retry_count, 1);
    assert_eq!(h.broker.peek("email.queue")[0].retry_count, 1);

    let unknown = Envelope::unicast(ChannelType::Email, "z@x.com", "x");
    assert!(matches!(h.gateway.retry(unknown).await, Err(DispatchError::UnknownMessage(_))));
}

#[tokio::test]
async fn test_redelivery_does_not_duplicate_or_regress() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.start_consumers().await;

    let submission = h
        .gateway
        .send_unicast(UnicastRequest::email("a@x.com", "Hi", "Once"))
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();
    assert!(eventually(|| async move { h.state_of(&id, "a@x.com").await == Some(DeliveryState::Sent) }).await);

    // Same envelope again, as a broker redelivery would
    let replay = Envelope {
        id: id.to_string(),
        ..Envelope::unicast(ChannelType::Email, "a@x.com", "Once")
    };
    h.broker
        .publish("messaging.direct", "message.email", &replay, PublishOptions::default())
        .await
        .unwrap();
    assert!(eventually(|| async move { h.broker.ready_count("email.queue") == 0 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.ledger.find_by_message_id(&id).await.unwrap().len(), 1);
    assert_eq!(h.state_of(&id, "a@x.com").await, Some(DeliveryState::Sent));
    assert_eq!(h.email.count(), 1);
    h.consumers.stop().await;
}

#[tokio::test]
async fn test_scheduled_message_promoted_after_its_time() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.start_consumers().await;
    h.scheduler.start().await;

    let at = Utc::now() + chrono::Duration::milliseconds(600);
    let submission = h
        .gateway
        .schedule_unicast(UnicastRequest::email("a@x.com", "Reminder", "Meeting soon"), at)
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    let state = h.state_of(&id, "a@x.com").await.unwrap();
    assert!(matches!(state, DeliveryState::Scheduled | DeliveryState::Queued));
    assert_eq!(h.gateway.get_scheduled_count().await, 1);

    assert!(eventually(|| async move { h.state_of(&id, "a@x.com").await == Some(DeliveryState::Sent) }).await);
    assert!(Utc::now() >= at);
    assert_eq!(h.gateway.get_scheduled_count().await, 0);

    h.scheduler.stop().await;
    h.consumers.stop().await;
}

#[tokio::test]
async fn test_long_horizon_schedule_uses_broker_deferred_queue() {
    let h = &Harness::new(Duration::from_millis(100), &[]).await;
    h.start_consumers().await;

    let at = Utc::now() + chrono::Duration::milliseconds(500);
    let submission = h
        .gateway
        .schedule_unicast(UnicastRequest::sms("+34600000000", "Your table is ready"), at)
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();
    submission.wait().await.unwrap();

    assert_eq!(h.gateway.get_scheduled_count().await, 0);
    assert_eq!(h.broker.ready_count("scheduled.sms.queue"), 1);
    assert_eq!(h.state_of(&id, "+34600000000").await, Some(DeliveryState::Scheduled));

    assert!(eventually(|| async move { h.state_of(&id, "+34600000000").await == Some(DeliveryState::Sent) }).await);
    assert!(Utc::now() >= at);
    h.consumers.stop().await;
}

#[tokio::test]
async fn test_cancel_scheduled() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;

    let at = Utc::now() + chrono::Duration::seconds(20);
    let submission = h
        .gateway
        .schedule_unicast(UnicastRequest::email("a@x.com", "Later", "Body"), at)
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    assert!(h.gateway.cancel_scheduled(&id).await.unwrap());
    assert!(!h.gateway.cancel_scheduled(&id).await.unwrap());
    assert_eq!(h.state_of(&id, "a@x.com").await, Some(DeliveryState::Cancelled));
    assert_eq!(h.gateway.get_scheduled_count().await, 0);
}

#[tokio::test]
async fn test_past_schedule_publishes_immediately() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    let at = Utc::now() - chrono::Duration::seconds(5);
    let submission = h
        .gateway
        .schedule_unicast(UnicastRequest::email("a@x.com", "Now", "Body"), at)
        .await
        .unwrap();
    submission.wait().await.unwrap();

    assert_eq!(h.gateway.get_scheduled_count().await, 0);
    assert_eq!(h.broker.ready_count("email.queue"), 1);
}

#[tokio::test]
async fn test_multi_channel_both_splits_envelopes() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;

    let submissions = h
        .gateway
        .send_multi_channel(MultiChannelRequest {
            email: Some("a@x.com".into()),
            phone: Some("+34600000000".into()),
            selection: ChannelSelection::Both,
            subject: Some("Hello".into()),
            body: "Both channels".into(),
            owner_id: Some("u1".into()),
        })
        .await
        .unwrap();
    assert_eq!(submissions.len(), 2);
    assert_ne!(submissions[0].message_id(), submissions[1].message_id());
    for submission in submissions {
        submission.wait().await.unwrap();
    }

    assert_eq!(h.broker.ready_count("email.queue"), 1);
    assert_eq!(h.broker.ready_count("sms.queue"), 1);
    let sms = h.broker.peek("sms.queue");
    assert_eq!(sms[0].sender.as_deref(), Some("Courier"));
    assert!(sms[0].subject.is_none());

    let missing_phone = h
        .gateway
        .send_multi_channel(MultiChannelRequest {
            email: Some("a@x.com".into()),
            phone: None,
            selection: ChannelSelection::Both,
            subject: None,
            body: "x".into(),
            owner_id: None,
        })
        .await;
    assert!(matches!(missing_phone, Err(DispatchError::Validation(_))));
    assert_eq!(h.broker.ready_count("email.queue"), 1);
}

#[tokio::test]
async fn test_queue_status() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.gateway
        .send_unicast(UnicastRequest::email("a@x.com", "s", "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let status = h.gateway.get_queue_status().await.unwrap();
    assert!(status.broker_healthy);
    assert_eq!(status.queues.len(), 6);
    let email = status.queues.iter().find(|q| q.queue == "email.queue").unwrap();
    assert_eq!(email.message_count, 1);
    assert_eq!(status.scheduled_count, 0);
}

#[tokio::test]
async fn test_closed_pool_fails_records_instead_of_orphaning_them() {
    let h = &Harness::new(Duration::from_secs(60), &[]).await;
    h.pool.shutdown().await;

    let result = h
        .gateway
        .send_unicast(UnicastRequest::email("a@x.com", "Hi", "Never published"))
        .await;
    assert!(matches!(result, Err(DispatchError::PoolClosed)));

    let broadcast = h
        .gateway
        .broadcast(BroadcastRequest::email(vec!["b@x.com".into(), "c@x.com".into()], None, "Hello"))
        .await;
    assert!(matches!(broadcast, Err(DispatchError::PoolClosed)));

    let at = Utc::now() + chrono::Duration::minutes(10);
    let scheduled = h
        .gateway
        .schedule_unicast(UnicastRequest::sms("+34600000000", "later"), at)
        .await;
    assert!(matches!(scheduled, Err(DispatchError::PoolClosed)));

    assert_eq!(h.ledger.pending_count().await.unwrap(), 0);
    assert!(h.ledger.find_by_state(DeliveryState::Scheduled).await.unwrap().is_empty());
    let failed = h.ledger.find_by_state(DeliveryState::Failed).await.unwrap();
    assert_eq!(failed.len(), 4);
    assert!(failed
        .iter()
        .all(|r| r.error_detail.as_deref().is_some_and(|d| d.starts_with("publish failed"))));
    assert_eq!(h.broker.ready_count("email.queue"), 0);
}

#[tokio::test]
async fn test_promotion_never_regresses_a_delivered_record() {
    let slow = Arc::new(SlowLookupLedger {
        inner: InMemoryStatusLedger::new(),
        delay: Duration::from_millis(300),
    });
    let h = &Harness::with_repository(Duration::from_secs(60), &[], slow).await;
    h.start_consumers().await;
    h.scheduler.start().await;

    let at = Utc::now() + chrono::Duration::milliseconds(200);
    let submission = h
        .gateway
        .schedule_unicast(UnicastRequest::email("a@x.com", "Reminder", "Soon"), at)
        .await
        .unwrap();
    let id = submission.message_id().to_string();
    let id = id.as_str();

    assert!(eventually(|| async move { h.state_of(id, "a@x.com").await == Some(DeliveryState::Sent) }).await);

    // Outlast any promotion still finishing its ledger write
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(h.state_of(id, "a@x.com").await, Some(DeliveryState::Sent));
    assert_eq!(h.email.count(), 1);

    h.scheduler.stop().await;
    h.consumers.stop().await;
}
