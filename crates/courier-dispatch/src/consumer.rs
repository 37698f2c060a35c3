//! Channel consumers
//!
//! [`DeliveryProcessor`] handles one envelope: every recipient is delivered
//! and recorded independently, so one failure never touches the others.
//! [`ChannelConsumer`] drives a processor from a broker queue and
//! [`ConsumerGroup`] runs several of them per queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, BrokerError, Delivery, QueueConsumer};
use courier_common::{ChannelType, DeliveryState, Envelope};
use courier_ledger::{LedgerError, StatusLedgerService};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::hooks::FailureHook;
use crate::sender::ChannelSender;

/// Owner recorded when a consumer has to create a missing record
const UNKNOWN_OWNER: &str = "system";

const SENDER_FAILURE: &str = "channel sender reported failure";

/// Per-envelope tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
    /// Recipients whose record was already terminal
    pub skipped: usize,
    /// Envelope addressed to another channel
    pub foreign: bool,
}

pub struct DeliveryProcessor {
    channel: ChannelType,
    sender: Arc<dyn ChannelSender>,
    ledger: StatusLedgerService,
    hook: Arc<dyn FailureHook>,
}

impl DeliveryProcessor {
    pub fn new(sender: Arc<dyn ChannelSender>, ledger: StatusLedgerService, hook: Arc<dyn FailureHook>) -> Self {
        Self {
            channel: sender.channel(),
            sender,
            ledger,
            hook,
        }
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    /// Deliver to every recipient. Errors only on ledger failures, in which
    /// case the envelope should be redelivered.
    pub async fn process(&self, envelope: &Envelope) -> Result<DeliveryReport, LedgerError> {
        let mut report = DeliveryReport::default();

        // Fan-out copy that reached this channel's queue
        if envelope.channel != self.channel {
            debug!(
                message_id = %envelope.id,
                envelope_channel = %envelope.channel,
                consumer_channel = %self.channel,
                "Envelope for another channel skipped"
            );
            report.foreign = true;
            return Ok(report);
        }

        for recipient in &envelope.recipients {
            let span = info_span!("deliver", message_id = %envelope.id, channel = %self.channel, recipient = %recipient);
            match self.deliver(envelope, recipient).instrument(span).await? {
                RecipientOutcome::Sent => report.sent += 1,
                RecipientOutcome::Failed => report.failed += 1,
                RecipientOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn deliver(&self, envelope: &Envelope, recipient: &str) -> Result<RecipientOutcome, LedgerError> {
        match self.ledger.find_by_key(&envelope.id, recipient).await? {
            Some(record) if record.state.is_terminal() => {
                debug!(state = %record.state, "Recipient already terminal, skipping redelivery");
                return Ok(RecipientOutcome::Skipped);
            }
            Some(_) => {}
            None => {
                warn!("No status record at consume time, creating one");
                let owner = envelope.owner_id.as_deref().unwrap_or(UNKNOWN_OWNER);
                self.ledger
                    .create_entry(&envelope.id, recipient, self.channel, owner)
                    .await?;
            }
        }

        self.ledger
            .transition_recipient(&envelope.id, recipient, DeliveryState::Processing, None)
            .await?;

        let single = envelope.for_recipient(recipient);
        if self.sender.send(&single).await {
            self.ledger
                .transition_recipient(&envelope.id, recipient, DeliveryState::Sent, None)
                .await?;
            metrics::counter!("courier.consumer.sent_total", "channel" => self.channel.as_str()).increment(1);
            debug!("Recipient delivered");
            Ok(RecipientOutcome::Sent)
        } else {
            self.ledger
                .transition_recipient(
                    &envelope.id,
                    recipient,
                    DeliveryState::Failed,
                    Some(SENDER_FAILURE.to_string()),
                )
                .await?;
            metrics::counter!("courier.consumer.failed_total", "channel" => self.channel.as_str()).increment(1);
            self.hook.on_failure(envelope, recipient, SENDER_FAILURE).await;
            Ok(RecipientOutcome::Failed)
        }
    }
}

enum RecipientOutcome {
    Sent,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub workers_per_queue: usize,
    pub batch_size: u32,
    /// Pause after an empty poll or a broker error
    pub poll_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers_per_queue: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// One worker draining one queue
pub struct ChannelConsumer {
    consumer: Box<dyn QueueConsumer>,
    processor: Arc<DeliveryProcessor>,
    settings: ConsumerSettings,
    running: Arc<AtomicBool>,
}

impl ChannelConsumer {
    pub fn new(
        consumer: Box<dyn QueueConsumer>,
        processor: Arc<DeliveryProcessor>,
        settings: ConsumerSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            processor,
            settings,
            running,
        }
    }

    pub async fn run(self) {
        let queue = self.consumer.identifier().to_string();
        info!(queue = %queue, channel = %self.processor.channel(), "Channel consumer started");

        while self.running.load(Ordering::SeqCst) {
            match self.consumer.poll(self.settings.batch_size).await {
                Ok(batch) if batch.is_empty() => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Ok(batch) => {
                    for delivery in batch {
                        self.handle(delivery).await;
                    }
                }
                Err(BrokerError::Stopped) => break,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Poll failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        self.consumer.stop().await;
        info!(queue = %queue, "Channel consumer stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        if delivery.redelivered {
            debug!(message_id = %envelope.id, "Processing redelivered envelope");
        }

        match self.processor.process(envelope).await {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(
                        message_id = %envelope.id,
                        sent = report.sent,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Envelope processed with failures"
                    );
                }
                if let Err(e) = self.consumer.ack(&delivery.receipt_handle).await {
                    error!(message_id = %envelope.id, error = %e, "Ack failed");
                }
            }
            Err(e) => {
                error!(message_id = %envelope.id, error = %e, "Ledger unavailable, requeueing envelope");
                if let Err(e) = self.consumer.nack(&delivery.receipt_handle, true).await {
                    error!(message_id = %envelope.id, error = %e, "Nack failed");
                }
            }
        }
    }
}

/// Worker tasks for every channel queue
pub struct ConsumerGroup {
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ConsumerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerGroup {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start `settings.workers_per_queue` consumers on `queue`
    pub async fn spawn(
        &self,
        broker: &dyn Broker,
        queue: &str,
        processor: Arc<DeliveryProcessor>,
        settings: &ConsumerSettings,
    ) -> Result<(), BrokerError> {
        for _ in 0..settings.workers_per_queue.max(1) {
            let consumer = broker.consumer(queue).await?;
            let worker = ChannelConsumer::new(consumer, processor.clone(), settings.clone(), self.running.clone());
            self.handles.lock().push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal every worker and wait for them to finish their current batch
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Consumer group stopped");
    }
}
