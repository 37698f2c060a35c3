//! In-memory status ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{DeliveryState, StatusKey, StatusRecord};
use dashmap::DashMap;

use crate::repository::StatusLedgerRepository;
use crate::Result;

#[derive(Default)]
pub struct InMemoryStatusLedger {
    records: DashMap<StatusKey, StatusRecord>,
}

impl InMemoryStatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn collect<F>(&self, predicate: F) -> Vec<StatusRecord>
    where
        F: Fn(&StatusRecord) -> bool,
    {
        let mut found: Vec<StatusRecord> = self
            .records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.recipient.cmp(&b.recipient)));
        found
    }
}

#[async_trait]
impl StatusLedgerRepository for InMemoryStatusLedger {
    async fn save(&self, record: &StatusRecord) -> Result<()> {
        self.records.insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|key, _| key.message_id != message_id);
        Ok((before - self.records.len()) as u64)
    }

    async fn find_by_key(&self, message_id: &str, recipient: &str) -> Result<Option<StatusRecord>> {
        Ok(self
            .records
            .get(&StatusKey::new(message_id, recipient))
            .map(|r| r.value().clone()))
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<StatusRecord>> {
        Ok(self.collect(|r| r.message_id == message_id))
    }

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<StatusRecord>> {
        Ok(self.collect(|r| r.recipient == recipient))
    }

    async fn find_by_state(&self, state: DeliveryState) -> Result<Vec<StatusRecord>> {
        Ok(self.collect(|r| r.state == state))
    }

    async fn find_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<StatusRecord>> {
        Ok(self.collect(|r| r.updated_at >= from && r.updated_at <= to))
    }

    async fn find_by_owner_order_by_time_desc(&self, owner_id: &str) -> Result<Vec<StatusRecord>> {
        let mut found = self.collect(|r| r.owner_id == owner_id);
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }

    async fn count_by_state(&self, state: DeliveryState) -> Result<u64> {
        Ok(self.records.iter().filter(|r| r.value().state == state).count() as u64)
    }
}
