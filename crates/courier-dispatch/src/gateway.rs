//! Dispatch gateway
//!
//! Accepts submissions, writes the ledger entry, then hands the broker
//! publish to the worker pool. Validation errors are the only failures a
//! caller sees synchronously; everything after the ledger write is reported
//! through the ledger (and, optionally, the returned [`Submission`]).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_broker::{Broker, EnvelopeRouter, QueueStats};
use courier_common::{ChannelSelection, ChannelType, DeliveryState, Envelope};
use courier_ledger::StatusLedgerService;
use courier_scheduler::{DeferredEntry, DeferredScheduler};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::pool::{Submission, WorkerPool};
use crate::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Owner recorded when a request carries none
    pub default_owner: String,
    /// Sender identity stamped on SMS envelopes without one
    pub default_sms_sender: String,
    /// Schedules further out than this go to the broker's deferred queues
    pub broker_horizon: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_owner: "system".to_string(),
            default_sms_sender: "Courier".to_string(),
            broker_horizon: Duration::from_secs(60),
        }
    }
}

/// One message to one recipient
#[derive(Debug, Clone)]
pub struct UnicastRequest {
    pub channel: ChannelType,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub attachment: Option<String>,
    pub html: bool,
    pub sender: Option<String>,
    pub owner_id: Option<String>,
}

impl UnicastRequest {
    pub fn email(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::new(ChannelType::Email, recipient, body)
        }
    }

    pub fn sms(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(ChannelType::Sms, recipient, body)
    }

    pub fn new(channel: ChannelType, recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
            subject: None,
            body: body.into(),
            attachment: None,
            html: false,
            sender: None,
            owner_id: None,
        }
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    pub fn with_html(mut self, html: bool) -> Self {
        self.html = html;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// One message to many recipients on one channel
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub channel: ChannelType,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub sender: Option<String>,
    pub owner_id: Option<String>,
}

impl BroadcastRequest {
    pub fn new(channel: ChannelType, recipients: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            channel,
            recipients,
            subject: None,
            body: body.into(),
            sender: None,
            owner_id: None,
        }
    }

    pub fn email(recipients: Vec<String>, subject: Option<String>, body: impl Into<String>) -> Self {
        Self {
            subject,
            ..Self::new(ChannelType::Email, recipients, body)
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// A contact reachable by email, phone or both
#[derive(Debug, Clone)]
pub struct MultiChannelRequest {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub selection: ChannelSelection,
    pub subject: Option<String>,
    pub body: String,
    pub owner_id: Option<String>,
}

/// Broker and deferred-store counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub broker_healthy: bool,
    pub queues: Vec<QueueStats>,
    /// Entries waiting in the in-memory deferred store
    pub scheduled_count: usize,
    /// Publishes accepted but not yet picked up by a worker
    pub pending_publishes: u32,
}

/// Where a scheduled submission was parked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulePath {
    Immediate,
    InMemory,
    Broker(Duration),
}

#[derive(Clone)]
pub struct DispatchGateway {
    config: GatewayConfig,
    broker: Arc<dyn Broker>,
    router: EnvelopeRouter,
    ledger: StatusLedgerService,
    scheduler: DeferredScheduler,
    pool: Arc<WorkerPool>,
}

impl DispatchGateway {
    pub fn new(
        config: GatewayConfig,
        broker: Arc<dyn Broker>,
        router: EnvelopeRouter,
        ledger: StatusLedgerService,
        scheduler: DeferredScheduler,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            config,
            broker,
            router,
            ledger,
            scheduler,
            pool,
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Send one message now through the direct exchange
    pub async fn send_unicast(&self, request: UnicastRequest) -> Result<Submission> {
        let envelope = self.unicast_envelope(request)?;
        self.send_unicast_envelope(envelope).await
    }

    /// Send one message to many recipients through the fan-out exchange
    pub async fn broadcast(&self, request: BroadcastRequest) -> Result<Submission> {
        // A repeated address would collapse onto one ledger key
        let mut recipients: Vec<String> = Vec::with_capacity(request.recipients.len());
        for recipient in request.recipients {
            if !recipients.contains(&recipient) {
                recipients.push(recipient);
            }
        }

        let mut envelope = Envelope::broadcast(request.channel, recipients, request.body)
            .with_subject(request.subject)
            .with_sender(request.sender)
            .with_owner(request.owner_id.unwrap_or_else(|| self.config.default_owner.clone()));
        self.stamp_sender(&mut envelope);
        envelope.validate()?;

        let owner = self.owner_of(&envelope);
        self.ledger
            .create_entries(&envelope.id, &envelope.recipients, envelope.channel, &owner, DeliveryState::Queued)
            .await?;
        metrics::counter!("courier.gateway.submitted_total", "kind" => "broadcast").increment(1);
        info!(
            message_id = %envelope.id,
            channel = %envelope.channel,
            recipients = envelope.recipients.len(),
            "Broadcast accepted"
        );

        self.publish_in_background(envelope, PublishRoute::Fanout).await
    }

    /// Send one message at `at`. Past or present times publish immediately,
    /// short horizons wait in the in-memory store, longer ones in the
    /// broker's deferred queue.
    pub async fn schedule_unicast(&self, request: UnicastRequest, at: DateTime<Utc>) -> Result<Submission> {
        let envelope = self.unicast_envelope(request)?.scheduled_for(at);
        let path = self.schedule_path(at, Utc::now());
        if path == SchedulePath::Immediate {
            debug!(message_id = %envelope.id, scheduled_at = %at, "Scheduled time already reached");
            return self.send_unicast_envelope(envelope).await;
        }

        let recipient = envelope.recipients[0].clone();
        let owner = self.owner_of(&envelope);
        self.ledger
            .create_entry_with_state(&envelope.id, &recipient, envelope.channel, &owner, DeliveryState::Scheduled)
            .await?;
        metrics::counter!("courier.gateway.submitted_total", "kind" => "scheduled").increment(1);

        match path {
            SchedulePath::Broker(delay) => {
                info!(
                    message_id = %envelope.id,
                    scheduled_at = %at,
                    delay_secs = delay.as_secs(),
                    "Scheduled via broker deferred queue"
                );
                self.publish_in_background(envelope, PublishRoute::Deferred(delay)).await
            }
            _ => {
                info!(message_id = %envelope.id, scheduled_at = %at, "Scheduled via in-memory store");
                let message_id = envelope.id.clone();
                self.scheduler.schedule(DeferredEntry::new(envelope, at)).await;
                Ok(Submission::completed(message_id, Ok(())))
            }
        }
    }

    /// Split a contact request into one envelope per selected channel
    pub async fn send_multi_channel(&self, request: MultiChannelRequest) -> Result<Vec<Submission>> {
        let mut requests = Vec::new();
        for &channel in request.selection.channels() {
            let recipient = match channel {
                ChannelType::Email => request.email.clone(),
                ChannelType::Sms => request.phone.clone(),
            };
            let recipient = recipient
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| DispatchError::Validation(format!("no {channel} destination for selected channel")))?;

            let mut unicast = UnicastRequest::new(channel, recipient, request.body.clone());
            if channel == ChannelType::Email {
                unicast.subject = request.subject.clone();
            }
            unicast.owner_id = request.owner_id.clone();
            requests.push(self.unicast_envelope(unicast)?);
        }

        let mut submissions = Vec::with_capacity(requests.len());
        for envelope in requests {
            submissions.push(self.send_unicast_envelope(envelope).await?);
        }
        Ok(submissions)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Cancel an entry still waiting in the in-memory store. Returns false
    /// when it is absent or already handed to the broker.
    pub async fn cancel_scheduled(&self, message_id: &str) -> Result<bool> {
        Ok(self.scheduler.cancel(message_id).await?)
    }

    /// Republish the failed recipients of a message through the direct exchange
    pub async fn retry(&self, envelope: Envelope) -> Result<Submission> {
        let reset = self.ledger.retry_failed(&envelope.id).await?;
        if reset.is_empty() {
            if self.ledger.find_by_message_id(&envelope.id).await?.is_empty() {
                warn!(message_id = %envelope.id, "Retry requested for unknown message");
                return Err(DispatchError::UnknownMessage(envelope.id));
            }
            return Err(DispatchError::Validation(format!(
                "message {} has no failed recipients",
                envelope.id
            )));
        }

        let mut retry = envelope;
        retry.recipients = reset.iter().map(|r| r.recipient.clone()).collect();
        retry.retry_count += 1;
        info!(
            message_id = %retry.id,
            recipients = retry.recipients.len(),
            retry_count = retry.retry_count,
            "Retrying failed message"
        );
        self.publish_in_background(retry, PublishRoute::Direct).await
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let topology = self.router.topology();
        let mut queues = Vec::new();
        for queue in topology.all_queues() {
            match self.broker.queue_stats(queue).await {
                Ok(stats) => queues.push(stats),
                Err(e) => warn!(queue = %queue, error = %e, "Queue stats unavailable"),
            }
        }

        Ok(QueueStatus {
            broker_healthy: self.router.is_healthy(),
            queues,
            scheduled_count: self.scheduler.count().await,
            pending_publishes: self.pool.queued(),
        })
    }

    pub async fn get_scheduled_count(&self) -> usize {
        self.scheduler.count().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn unicast_envelope(&self, request: UnicastRequest) -> Result<Envelope> {
        let owner = request.owner_id.unwrap_or_else(|| self.config.default_owner.clone());
        let mut envelope = Envelope::unicast(request.channel, request.recipient, request.body)
            .with_subject(request.subject)
            .with_sender(request.sender)
            .with_attachment(request.attachment)
            .with_html(request.html)
            .with_owner(owner);
        self.stamp_sender(&mut envelope);
        envelope.validate()?;
        Ok(envelope)
    }

    fn stamp_sender(&self, envelope: &mut Envelope) {
        if envelope.channel == ChannelType::Sms && envelope.sender.is_none() {
            envelope.sender = Some(self.config.default_sms_sender.clone());
        }
    }

    fn owner_of(&self, envelope: &Envelope) -> String {
        envelope
            .owner_id
            .clone()
            .unwrap_or_else(|| self.config.default_owner.clone())
    }

    fn schedule_path(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> SchedulePath {
        let Ok(delay) = (at - now).to_std() else {
            return SchedulePath::Immediate;
        };
        if delay.is_zero() {
            SchedulePath::Immediate
        } else if delay > self.config.broker_horizon {
            SchedulePath::Broker(delay)
        } else {
            SchedulePath::InMemory
        }
    }

    async fn send_unicast_envelope(&self, envelope: Envelope) -> Result<Submission> {
        let recipient = envelope.recipients[0].clone();
        let owner = self.owner_of(&envelope);
        self.ledger
            .create_entry(&envelope.id, &recipient, envelope.channel, &owner)
            .await?;
        metrics::counter!("courier.gateway.submitted_total", "kind" => "unicast").increment(1);
        info!(message_id = %envelope.id, channel = %envelope.channel, "Unicast accepted");

        self.publish_in_background(envelope, PublishRoute::Direct).await
    }

    async fn publish_in_background(&self, envelope: Envelope, route: PublishRoute) -> Result<Submission> {
        let (tx, rx) = oneshot::channel();
        let message_id = envelope.id.clone();
        let recipients = envelope.recipients.clone();
        let router = self.router.clone();
        let ledger = self.ledger.clone();

        let submitted = self
            .pool
            .submit(async move {
                let published = match route {
                    PublishRoute::Direct => router.publish_direct(&envelope).await,
                    PublishRoute::Fanout => router.publish_fanout(&envelope).await,
                    PublishRoute::Deferred(delay) => router.publish_deferred(&envelope, delay).await,
                };

                let result = match published {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(message_id = %envelope.id, error = %e, "Publish failed, marking records failed");
                        metrics::counter!("courier.gateway.publish_errors_total").increment(1);
                        mark_failed(&ledger, &envelope.id, &envelope.recipients, &format!("publish failed: {e}")).await;
                        Err(DispatchError::Publish(e))
                    }
                };
                let _ = tx.send(result);
            })
            .await;

        if let Err(e) = submitted {
            // The records exist but nothing will publish them
            error!(message_id = %message_id, error = %e, "Publish not accepted by worker pool, marking records failed");
            metrics::counter!("courier.gateway.publish_errors_total").increment(1);
            mark_failed(&self.ledger, &message_id, &recipients, &format!("publish failed: {e}")).await;
            return Err(e);
        }

        Ok(Submission::new(message_id, rx))
    }
}

async fn mark_failed(ledger: &StatusLedgerService, message_id: &str, recipients: &[String], detail: &str) {
    for recipient in recipients {
        if let Err(e) = ledger
            .transition_recipient(message_id, recipient, DeliveryState::Failed, Some(detail.to_string()))
            .await
        {
            error!(message_id = %message_id, error = %e, "Could not record publish failure");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PublishRoute {
    Direct,
    Fanout,
    Deferred(Duration),
}
