//! Channel-aware publishing on top of a [`BrokerPublisher`]

use std::sync::Arc;
use std::time::Duration;

use courier_common::Envelope;
use tracing::debug;

use crate::{BrokerPublisher, PublishOptions, Result, Topology};

/// Publishes envelopes along the topology's channel routes
#[derive(Clone)]
pub struct EnvelopeRouter {
    publisher: Arc<dyn BrokerPublisher>,
    topology: Arc<Topology>,
}

impl EnvelopeRouter {
    pub fn new(publisher: Arc<dyn BrokerPublisher>, topology: Arc<Topology>) -> Self {
        Self { publisher, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_healthy(&self) -> bool {
        self.publisher.is_healthy()
    }

    /// Unicast: direct exchange, channel routing key
    pub async fn publish_direct(&self, envelope: &Envelope) -> Result<()> {
        let route = self.topology.route(envelope.channel);
        self.publisher
            .publish(&self.topology.direct_exchange, &route.routing_key, envelope, PublishOptions::default())
            .await?;
        debug!(message_id = %envelope.id, routing_key = %route.routing_key, "Envelope published to direct exchange");
        Ok(())
    }

    /// Broadcast: one publish to the fan-out exchange, every bound queue gets a copy
    pub async fn publish_fanout(&self, envelope: &Envelope) -> Result<()> {
        self.publisher
            .publish(&self.topology.fanout_exchange, "", envelope, PublishOptions::default())
            .await?;
        debug!(
            message_id = %envelope.id,
            recipients = envelope.recipients.len(),
            "Envelope published to fan-out exchange"
        );
        Ok(())
    }

    /// Broker-durable deferral: park the envelope in the channel's deferred
    /// queue with a TTL of `delay`; on expiry the broker dead-letters it into
    /// the direct exchange.
    pub async fn publish_deferred(&self, envelope: &Envelope, delay: Duration) -> Result<()> {
        let route = self.topology.route(envelope.channel);
        self.publisher
            .publish("", &route.deferred_queue, envelope, PublishOptions::expiring_after(delay))
            .await?;
        debug!(
            message_id = %envelope.id,
            queue = %route.deferred_queue,
            delay_ms = delay.as_millis() as u64,
            "Envelope parked in deferred queue"
        );
        Ok(())
    }

    /// Dead-letter exchange, channel dead-letter key
    pub async fn publish_dead_letter(&self, envelope: &Envelope) -> Result<()> {
        let route = self.topology.route(envelope.channel);
        self.publisher
            .publish(
                &self.topology.dead_letter_exchange,
                &route.dead_letter_routing_key,
                envelope,
                PublishOptions::default(),
            )
            .await
    }
}
