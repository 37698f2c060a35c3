//! What a consumer does after a recipient's delivery fails

use async_trait::async_trait;
use courier_broker::EnvelopeRouter;
use courier_common::Envelope;
use tracing::{error, warn};

#[async_trait]
pub trait FailureHook: Send + Sync {
    async fn on_failure(&self, envelope: &Envelope, recipient: &str, detail: &str);
}

pub struct LogFailureHook;

#[async_trait]
impl FailureHook for LogFailureHook {
    async fn on_failure(&self, envelope: &Envelope, recipient: &str, detail: &str) {
        warn!(
            message_id = %envelope.id,
            channel = %envelope.channel,
            recipient = %recipient,
            detail = %detail,
            "Delivery failed"
        );
    }
}

/// Parks a single-recipient copy of the failed envelope in the channel's
/// dead-letter queue for inspection or manual replay.
pub struct DeadLetterFailureHook {
    router: EnvelopeRouter,
}

impl DeadLetterFailureHook {
    pub fn new(router: EnvelopeRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl FailureHook for DeadLetterFailureHook {
    async fn on_failure(&self, envelope: &Envelope, recipient: &str, detail: &str) {
        let copy = envelope.for_recipient(recipient);
        match self.router.publish_dead_letter(&copy).await {
            Ok(()) => warn!(
                message_id = %envelope.id,
                recipient = %recipient,
                detail = %detail,
                "Failed delivery dead-lettered"
            ),
            Err(e) => error!(
                message_id = %envelope.id,
                recipient = %recipient,
                error = %e,
                "Could not dead-letter failed delivery"
            ),
        }
    }
}
