//! Courier broker client
//!
//! Abstract broker surface used by the gateway, the scheduler and the channel
//! consumers, plus two implementations:
//! - [`memory::InMemoryBroker`]: exchanges, bindings, dead-lettering and
//!   per-message expiry in process (development and tests)
//! - `amqp::AmqpBroker` (feature `amqp`): RabbitMQ via lapin

use std::time::Duration;

use async_trait::async_trait;
use courier_common::Envelope;
use serde::Serialize;

pub mod error;
pub mod memory;
pub mod routing;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use routing::EnvelopeRouter;
pub use topology::{ChannelRoute, Topology};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Per-publish options
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Message time-to-live. Expired messages are dead-lettered by the queue
    /// holding them, which is how broker-native deferred delivery works.
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    pub fn expiring_after(delay: Duration) -> Self {
        Self {
            expiration: Some(delay),
        }
    }
}

/// An envelope taken from a queue, held until acked or nacked
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub receipt_handle: String,
    /// The broker has handed this message out before
    pub redelivered: bool,
    pub queue: String,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: String,
    /// Messages ready for delivery
    pub message_count: u64,
    pub consumer_count: u32,
}

/// Publishing side of the broker
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish an envelope to `exchange` with `routing_key`. The empty exchange
    /// name addresses the queue named by the routing key directly.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<()>;

    fn is_healthy(&self) -> bool;
}

/// Consuming side of one queue
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Queue this consumer drains
    fn identifier(&self) -> &str;

    /// Take up to `max_messages` deliveries. Returns an empty batch when the
    /// queue is idle.
    async fn poll(&self, max_messages: u32) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery (remove it from the queue)
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Negative acknowledge. `requeue = false` sends the message to the
    /// queue's dead-letter destination.
    async fn nack(&self, receipt_handle: &str, requeue: bool) -> Result<()>;

    async fn stop(&self);
}

/// Full broker client: publishing, topology management, consumers, stats
#[async_trait]
pub trait Broker: BrokerPublisher {
    /// Declare exchanges, queues, bindings and dead-letter wiring
    async fn declare_topology(&self, topology: &Topology) -> Result<()>;

    /// Open a consumer on `queue`
    async fn consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;
}
