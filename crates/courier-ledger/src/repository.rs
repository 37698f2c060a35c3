//! Status ledger persistence port
//!
//! Records are keyed by (message id, recipient). `save` is an upsert and the
//! only write besides the administrative `delete_by_message_id`; each call is
//! a single atomic write, so concurrent writers to one record resolve
//! last-write-wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{DeliveryState, StatusRecord};

use crate::Result;

#[async_trait]
pub trait StatusLedgerRepository: Send + Sync {
    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert or replace the record under its (message id, recipient) key
    async fn save(&self, record: &StatusRecord) -> Result<()>;

    /// Remove every record of a message, returning how many were removed
    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64>;

    // ========================================================================
    // Reads
    // ========================================================================

    async fn find_by_key(&self, message_id: &str, recipient: &str) -> Result<Option<StatusRecord>>;

    /// All records of a message; one for unicast, one per recipient for broadcast
    async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<StatusRecord>>;

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<StatusRecord>>;

    async fn find_by_state(&self, state: DeliveryState) -> Result<Vec<StatusRecord>>;

    /// Records whose last transition falls in `[from, to]`
    async fn find_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<StatusRecord>>;

    /// Records of one owner, most recent transition first
    async fn find_by_owner_order_by_time_desc(&self, owner_id: &str) -> Result<Vec<StatusRecord>>;

    async fn count_by_state(&self, state: DeliveryState) -> Result<u64>;
}
