use courier_broker::BrokerError;
use courier_common::ModelError;
use courier_ledger::LedgerError;
use courier_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// The ledger entry exists but the broker did not take the envelope
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),

    #[error("Delivery failed for {recipient}: {detail}")]
    Delivery { recipient: String, detail: String },

    #[error("Promotion of {message_id} failed {attempts} times")]
    RetryExhausted { message_id: String, attempts: u32 },

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Worker pool is closed")]
    PoolClosed,
}

impl From<ModelError> for DispatchError {
    fn from(e: ModelError) -> Self {
        DispatchError::Validation(e.to_string())
    }
}

impl From<SchedulerError> for DispatchError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Broker(e) => DispatchError::Publish(e),
            SchedulerError::Ledger(e) => DispatchError::Ledger(e),
            SchedulerError::RetryExhausted { message_id, attempts } => {
                DispatchError::RetryExhausted { message_id, attempts }
            }
        }
    }
}
