//! Courier dispatch
//!
//! - [`gateway::DispatchGateway`]: unicast, broadcast, scheduled and
//!   multi-channel submission, cancellation, retry and queue status
//! - [`pool::WorkerPool`]: bounded background publishing
//! - [`consumer`]: per-channel queue consumers reporting to the ledger
//! - [`sender`] / [`hooks`]: provider and failure-handling ports

pub mod consumer;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod pool;
pub mod sender;

pub use consumer::{ChannelConsumer, ConsumerGroup, ConsumerSettings, DeliveryProcessor, DeliveryReport};
pub use error::DispatchError;
pub use gateway::{
    BroadcastRequest, DispatchGateway, GatewayConfig, MultiChannelRequest, QueueStatus, UnicastRequest,
};
pub use hooks::{DeadLetterFailureHook, FailureHook, LogFailureHook};
pub use pool::{Submission, WorkerPool};
pub use sender::{ChannelSender, LoggingSender};

pub type Result<T> = std::result::Result<T, DispatchError>;
