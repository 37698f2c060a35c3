//! Courier status ledger
//!
//! Durable lifecycle record per (message id, recipient). The gateway writes
//! a record before every broker publish; consumers and the scheduler move it
//! through the delivery state machine; dashboards read it back.
//!
//! Storage adapters:
//! - [`memory::InMemoryStatusLedger`]: process-local, for development and tests
//! - `sqlite::SqliteStatusLedger` (feature `sqlite`): `message_status` table via sqlx

pub mod error;
pub mod memory;
pub mod report;
pub mod repository;
pub mod service;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::LedgerError;
pub use memory::InMemoryStatusLedger;
pub use report::{SystemHealth, SystemStatus, SystemStatusReport};
pub use repository::StatusLedgerRepository;
pub use service::{StatusLedgerService, TransitionOutcome};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStatusLedger;

pub type Result<T> = std::result::Result<T, LedgerError>;
