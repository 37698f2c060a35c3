use courier_broker::BrokerError;
use courier_ledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Promotion of {message_id} failed {attempts} times")]
    RetryExhausted { message_id: String, attempts: u32 },
}
