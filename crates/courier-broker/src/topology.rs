//! Exchange and queue layout
//!
//! ```text
//! messaging.direct --message.email--> email.queue --(dlx.email)--> dlx.exchange -> email.dlq
//!                  --message.sms----> sms.queue   --(dlx.sms)----> dlx.exchange -> sms.dlq
//! messaging.fanout ------------------> email.queue, sms.queue
//! scheduled.email.queue --(expired, message.email)--> messaging.direct
//! scheduled.sms.queue   --(expired, message.sms)----> messaging.direct
//! ```

use courier_common::ChannelType;
use serde::{Deserialize, Serialize};

pub const DIRECT_EXCHANGE: &str = "messaging.direct";
pub const FANOUT_EXCHANGE: &str = "messaging.fanout";
pub const DEAD_LETTER_EXCHANGE: &str = "dlx.exchange";

/// Queue names and keys serving one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoute {
    pub channel: ChannelType,
    /// Durable work queue drained by the channel consumers
    pub queue: String,
    /// Key binding `queue` to the direct exchange
    pub routing_key: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    /// Consumer-less queue whose expired messages dead-letter into the
    /// direct exchange under `routing_key`
    pub deferred_queue: String,
}

impl ChannelRoute {
    fn standard(channel: ChannelType) -> Self {
        let name = match channel {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
        };
        Self {
            channel,
            queue: format!("{name}.queue"),
            routing_key: format!("message.{name}"),
            dead_letter_queue: format!("{name}.dlq"),
            dead_letter_routing_key: format!("dlx.{name}"),
            deferred_queue: format!("scheduled.{name}.queue"),
        }
    }
}

/// Complete broker layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub direct_exchange: String,
    pub fanout_exchange: String,
    pub dead_letter_exchange: String,
    pub email: ChannelRoute,
    pub sms: ChannelRoute,
}

impl Default for Topology {
    fn default() -> Self {
        Self::standard()
    }
}

impl Topology {
    pub fn standard() -> Self {
        Self {
            direct_exchange: DIRECT_EXCHANGE.to_string(),
            fanout_exchange: FANOUT_EXCHANGE.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            email: ChannelRoute::standard(ChannelType::Email),
            sms: ChannelRoute::standard(ChannelType::Sms),
        }
    }

    pub fn route(&self, channel: ChannelType) -> &ChannelRoute {
        match channel {
            ChannelType::Email => &self.email,
            ChannelType::Sms => &self.sms,
        }
    }

    pub fn routes(&self) -> [&ChannelRoute; 2] {
        [&self.email, &self.sms]
    }

    /// Work queues bound to both exchanges
    pub fn channel_queues(&self) -> Vec<&str> {
        self.routes().iter().map(|r| r.queue.as_str()).collect()
    }

    /// Every queue the topology declares
    pub fn all_queues(&self) -> Vec<&str> {
        self.routes()
            .iter()
            .flat_map(|r| [r.queue.as_str(), r.dead_letter_queue.as_str(), r.deferred_queue.as_str()])
            .collect()
    }
}
