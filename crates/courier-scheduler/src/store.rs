//! Deferred delivery store
//!
//! Keyed by message id. `take` is the single atomic check-and-remove used by
//! both promotion and cancellation, so exactly one of them can win an entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::Envelope;
use dashmap::DashMap;

/// A scheduled envelope waiting for its time
#[derive(Debug, Clone)]
pub struct DeferredEntry {
    pub envelope: Envelope,
    pub scheduled_at: DateTime<Utc>,
    /// Failed promotion attempts so far, mirrored in `envelope.retry_count`
    pub attempts: u32,
}

impl DeferredEntry {
    pub fn new(envelope: Envelope, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            envelope,
            scheduled_at,
            attempts: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.envelope.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

#[async_trait]
pub trait DeferredStore: Send + Sync {
    /// Add or replace the entry for its message id
    async fn insert(&self, entry: DeferredEntry);

    /// Remove and return the entry if it is still present
    async fn take(&self, message_id: &str) -> Option<DeferredEntry>;

    async fn contains(&self, message_id: &str) -> bool;

    /// Ids of entries whose scheduled time is at or before `now`
    async fn due(&self, now: DateTime<Utc>) -> Vec<String>;

    /// Ids of entries scheduled before `cutoff`
    async fn stale(&self, cutoff: DateTime<Utc>) -> Vec<String>;

    async fn entries_for_owner(&self, owner_id: &str) -> Vec<DeferredEntry>;

    /// Point-in-time size, for observability only
    async fn count(&self) -> usize;
}

/// Process-local store; entries do not survive a restart
#[derive(Default)]
pub struct InMemoryDeferredStore {
    entries: DashMap<String, DeferredEntry>,
}

impl InMemoryDeferredStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&DeferredEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[async_trait]
impl DeferredStore for InMemoryDeferredStore {
    async fn insert(&self, entry: DeferredEntry) {
        self.entries.insert(entry.envelope.id.clone(), entry);
    }

    async fn take(&self, message_id: &str) -> Option<DeferredEntry> {
        self.entries.remove(message_id).map(|(_, entry)| entry)
    }

    async fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    async fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.ids_where(|e| e.is_due(now))
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.ids_where(|e| e.scheduled_at < cutoff)
    }

    async fn entries_for_owner(&self, owner_id: &str) -> Vec<DeferredEntry> {
        let mut entries: Vec<DeferredEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().envelope.owner_id.as_deref() == Some(owner_id))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.scheduled_at);
        entries
    }

    async fn count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_common::ChannelType;
    use std::sync::Arc;

    fn entry(offset_secs: i64) -> DeferredEntry {
        let envelope = Envelope::unicast(ChannelType::Email, "a@x.com", "hi").with_owner("u1");
        DeferredEntry::new(envelope, Utc::now() + Duration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn test_due_excludes_future_entries() {
        let store = InMemoryDeferredStore::new();
        let past = entry(-5);
        let future = entry(60);
        store.insert(past.clone()).await;
        store.insert(future.clone()).await;

        let due = store.due(Utc::now()).await;
        assert_eq!(due, vec![past.message_id().to_string()]);
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn test_take_is_exclusive() {
        let store = Arc::new(InMemoryDeferredStore::new());
        let e = entry(0);
        let id = e.message_id().to_string();
        store.insert(e).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.take(&id).await.is_some() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_stale_and_owner_listing() {
        let store = InMemoryDeferredStore::new();
        let old = entry(-3 * 24 * 3600);
        store.insert(old.clone()).await;
        store.insert(entry(120)).await;

        let stale = store.stale(Utc::now() - Duration::days(1)).await;
        assert_eq!(stale, vec![old.message_id().to_string()]);

        let owned = store.entries_for_owner("u1").await;
        assert_eq!(owned.len(), 2);
        assert!(owned[0].scheduled_at < owned[1].scheduled_at);
        assert!(store.entries_for_owner("someone-else").await.is_empty());
    }
}
