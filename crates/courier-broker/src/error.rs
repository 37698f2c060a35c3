use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker unavailable")]
    Unavailable,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("No queue bound for exchange '{exchange}' with routing key '{routing_key}'")]
    Unroutable { exchange: String, routing_key: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Delivery not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Consumer is stopped")]
    Stopped,
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        BrokerError::Connection(e.to_string())
    }
}
