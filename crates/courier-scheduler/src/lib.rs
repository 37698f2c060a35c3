//! Courier deferred delivery
//!
//! Short-horizon scheduled envelopes wait in a [`DeferredStore`] until a
//! periodic sweep promotes them onto the direct exchange. A second, slower
//! sweep expires entries that have been stuck for too long.
//!
//! The in-memory store does not survive a restart. Schedules beyond the
//! broker horizon bypass it and go to the broker's deferred queues instead.

pub mod error;
pub mod store;
pub mod sweep;

pub use error::SchedulerError;
pub use store::{DeferredEntry, DeferredStore, InMemoryDeferredStore};
pub use sweep::{DeferredScheduler, DeferredSchedulerConfig, PromotionOutcome};

pub type Result<T> = std::result::Result<T, SchedulerError>;
