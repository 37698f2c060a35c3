//! Channel sender ports
//!
//! Concrete providers (SMTP relay, SMS gateway) live outside this crate and
//! plug in here. The outcome is boolean only.

use async_trait::async_trait;
use courier_common::{ChannelType, Envelope};
use tracing::info;

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Channel this sender delivers on
    fn channel(&self) -> ChannelType;

    /// Deliver a single-recipient envelope; `true` when the provider accepted it
    async fn send(&self, envelope: &Envelope) -> bool;
}

/// Development sender: logs the envelope and reports success
pub struct LoggingSender {
    channel: ChannelType,
}

impl LoggingSender {
    pub fn new(channel: ChannelType) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for LoggingSender {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        info!(
            message_id = %envelope.id,
            channel = %self.channel,
            recipient = %envelope.recipients.join(","),
            subject = envelope.subject.as_deref().unwrap_or(""),
            body_len = envelope.body.len(),
            "Delivered (logging sender)"
        );
        true
    }
}
