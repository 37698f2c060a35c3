//! Status ledger service
//!
//! Lifecycle operations over a [`StatusLedgerRepository`]. Transitions are
//! best-effort: an unknown message id or an illegal state-machine move is
//! logged and reported through [`TransitionOutcome`], never raised. Only
//! storage failures surface as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use courier_common::{ChannelType, DeliveryState, StatusRecord};
use tracing::{debug, info, warn};

use crate::repository::StatusLedgerRepository;
use crate::report::SystemStatusReport;
use crate::Result;

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// This many records moved to the new state
    Applied(usize),
    /// Records exist but none may legally move to the requested state
    Rejected,
    /// No record matches
    Unknown,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Clone)]
pub struct StatusLedgerService {
    repository: Arc<dyn StatusLedgerRepository>,
}

impl StatusLedgerService {
    pub fn new(repository: Arc<dyn StatusLedgerRepository>) -> Self {
        Self { repository }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create the QUEUED record for one (message, recipient) pair
    pub async fn create_entry(
        &self,
        message_id: &str,
        recipient: &str,
        channel: ChannelType,
        owner_id: &str,
    ) -> Result<StatusRecord> {
        self.create_entry_with_state(message_id, recipient, channel, owner_id, DeliveryState::Queued)
            .await
    }

    pub async fn create_entry_with_state(
        &self,
        message_id: &str,
        recipient: &str,
        channel: ChannelType,
        owner_id: &str,
        state: DeliveryState,
    ) -> Result<StatusRecord> {
        let record = StatusRecord::new(message_id, recipient, channel, owner_id, state);
        self.repository.save(&record).await?;
        debug!(message_id = %message_id, recipient = %recipient, state = %state, "Status record created");
        Ok(record)
    }

    /// One record per recipient under a shared message id
    pub async fn create_entries(
        &self,
        message_id: &str,
        recipients: &[String],
        channel: ChannelType,
        owner_id: &str,
        state: DeliveryState,
    ) -> Result<Vec<StatusRecord>> {
        let mut records = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            records.push(
                self.create_entry_with_state(message_id, recipient, channel, owner_id, state)
                    .await?,
            );
        }
        Ok(records)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Move every record of `message_id` to `next`
    pub async fn transition(
        &self,
        message_id: &str,
        next: DeliveryState,
        error_detail: Option<String>,
    ) -> Result<TransitionOutcome> {
        let records = self.repository.find_by_message_id(message_id).await?;
        if records.is_empty() {
            warn!(message_id = %message_id, state = %next, "Transition for unknown message ignored");
            return Ok(TransitionOutcome::Unknown);
        }

        let mut applied = 0;
        for record in records {
            if self.apply(record, next, error_detail.clone()).await? {
                applied += 1;
            }
        }

        Ok(if applied > 0 {
            TransitionOutcome::Applied(applied)
        } else {
            TransitionOutcome::Rejected
        })
    }

    /// Move one recipient's record to `next`
    pub async fn transition_recipient(
        &self,
        message_id: &str,
        recipient: &str,
        next: DeliveryState,
        error_detail: Option<String>,
    ) -> Result<TransitionOutcome> {
        let Some(record) = self.repository.find_by_key(message_id, recipient).await? else {
            warn!(
                message_id = %message_id,
                recipient = %recipient,
                state = %next,
                "Transition for unknown recipient ignored"
            );
            return Ok(TransitionOutcome::Unknown);
        };

        Ok(if self.apply(record, next, error_detail).await? {
            TransitionOutcome::Applied(1)
        } else {
            TransitionOutcome::Rejected
        })
    }

    /// Reset FAILED records of a message to QUEUED, bumping their retry count
    pub async fn retry_failed(&self, message_id: &str) -> Result<Vec<StatusRecord>> {
        let mut reset = Vec::new();
        for mut record in self.repository.find_by_message_id(message_id).await? {
            if record.state != DeliveryState::Failed {
                continue;
            }
            record.apply(DeliveryState::Queued, None);
            self.repository.save(&record).await?;
            reset.push(record);
        }

        if reset.is_empty() {
            debug!(message_id = %message_id, "No failed records to retry");
        } else {
            info!(message_id = %message_id, records = reset.len(), "Failed records reset for retry");
        }
        Ok(reset)
    }

    async fn apply(&self, mut record: StatusRecord, next: DeliveryState, error_detail: Option<String>) -> Result<bool> {
        if !record.state.can_transition_to(next) {
            warn!(
                key = %record.key(),
                from = %record.state,
                to = %next,
                "Illegal status transition ignored"
            );
            return Ok(false);
        }

        let from = record.state;
        record.apply(next, error_detail);
        self.repository.save(&record).await?;
        debug!(key = %record.key(), from = %from, to = %next, "Status transition applied");
        Ok(true)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_message_id(message_id).await
    }

    pub async fn find_by_key(&self, message_id: &str, recipient: &str) -> Result<Option<StatusRecord>> {
        self.repository.find_by_key(message_id, recipient).await
    }

    pub async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_recipient(recipient).await
    }

    pub async fn find_by_state(&self, state: DeliveryState) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_state(state).await
    }

    pub async fn find_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_time_range(from, to).await
    }

    /// Owner's history, most recent first
    pub async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_owner_order_by_time_desc(owner_id).await
    }

    pub async fn last_message_to_recipient(&self, recipient: &str) -> Result<Option<StatusRecord>> {
        Ok(self
            .repository
            .find_by_recipient(recipient)
            .await?
            .into_iter()
            .max_by_key(|r| r.updated_at))
    }

    /// Records with a transition in the 24 hours before `now`
    pub async fn recent_messages(&self, now: DateTime<Utc>) -> Result<Vec<StatusRecord>> {
        self.repository.find_by_time_range(now - Duration::hours(24), now).await
    }

    /// Any record of the message is QUEUED or PROCESSING
    pub async fn is_pending(&self, message_id: &str) -> Result<bool> {
        Ok(self
            .repository
            .find_by_message_id(message_id)
            .await?
            .iter()
            .any(|r| r.state.is_pending()))
    }

    pub async fn is_failed(&self, message_id: &str) -> Result<bool> {
        Ok(self
            .repository
            .find_by_message_id(message_id)
            .await?
            .iter()
            .any(|r| r.state == DeliveryState::Failed))
    }

    pub async fn count_by_state(&self, state: DeliveryState) -> Result<u64> {
        self.repository.count_by_state(state).await
    }

    pub async fn state_counts(&self) -> Result<BTreeMap<DeliveryState, u64>> {
        let mut counts = BTreeMap::new();
        for state in DeliveryState::ALL {
            counts.insert(state, self.repository.count_by_state(state).await?);
        }
        Ok(counts)
    }

    pub async fn pending_count(&self) -> Result<u64> {
        Ok(self.count_by_state(DeliveryState::Queued).await? + self.count_by_state(DeliveryState::Processing).await?)
    }

    pub async fn report(&self, now: DateTime<Utc>) -> Result<SystemStatusReport> {
        let counts = self.state_counts().await?;
        let count = |state: DeliveryState| counts.get(&state).copied().unwrap_or(0);

        let total = counts.values().sum();
        let successful = count(DeliveryState::Sent) + count(DeliveryState::Delivered);
        let pending = count(DeliveryState::Queued) + count(DeliveryState::Processing);
        let recent = self.recent_messages(now).await?.len() as u64;

        Ok(SystemStatusReport::new(
            total,
            successful,
            count(DeliveryState::Failed),
            pending,
            recent,
        ))
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Delete every record of a message
    pub async fn purge(&self, message_id: &str) -> Result<u64> {
        let removed = self.repository.delete_by_message_id(message_id).await?;
        info!(message_id = %message_id, removed, "Status records purged");
        Ok(removed)
    }
}
