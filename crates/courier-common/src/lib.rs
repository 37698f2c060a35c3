//! Courier shared model
//!
//! Types that flow between the gateway, the broker, the deferred store, the
//! channel consumers and the status ledger:
//! - [`Envelope`]: content plus destination, the unit handed to the broker
//! - [`ChannelType`] / [`ChannelSelection`]: closed channel variants
//! - [`DeliveryState`]: the per-recipient lifecycle state machine
//! - [`StatusRecord`] / [`StatusKey`]: one ledger row per (message, recipient)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Channels
// ============================================================================

/// Outbound delivery channel. Every envelope targets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Email,
    Sms,
}

impl ChannelType {
    pub const ALL: [ChannelType; 2] = [ChannelType::Email, ChannelType::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "EMAIL",
            ChannelType::Sms => "SMS",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(ChannelType::Email),
            "SMS" => Ok(ChannelType::Sms),
            other => Err(ModelError::UnknownChannel(other.to_string())),
        }
    }
}

/// Channel selection at the submission boundary.
///
/// `Both` never reaches the broker: it is split into one envelope per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelSelection {
    Email,
    Sms,
    Both,
}

impl ChannelSelection {
    /// Channels this selection expands to, in submission order
    pub fn channels(&self) -> &'static [ChannelType] {
        match self {
            ChannelSelection::Email => &[ChannelType::Email],
            ChannelSelection::Sms => &[ChannelType::Sms],
            ChannelSelection::Both => &ChannelType::ALL,
        }
    }
}

impl From<ChannelType> for ChannelSelection {
    fn from(channel: ChannelType) -> Self {
        match channel {
            ChannelType::Email => ChannelSelection::Email,
            ChannelType::Sms => ChannelSelection::Sms,
        }
    }
}

/// Delivery pattern an envelope was submitted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryKind {
    Unicast,
    Broadcast,
}

// ============================================================================
// Envelope
// ============================================================================

/// Allocate a new opaque message id
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Content + destination package handed to the broker for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub channel: ChannelType,
    pub kind: DeliveryKind,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(default)]
    pub html: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    fn new(channel: ChannelType, kind: DeliveryKind, recipients: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            channel,
            kind,
            recipients,
            subject: None,
            body: body.into(),
            sender: None,
            attachment: None,
            html: false,
            scheduled_at: None,
            retry_count: 0,
            owner_id: None,
            created_at: Utc::now(),
        }
    }

    /// Single-recipient envelope
    pub fn unicast(channel: ChannelType, recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(channel, DeliveryKind::Unicast, vec![recipient.into()], body)
    }

    /// Envelope carrying a recipient list, fanned out to every bound queue
    pub fn broadcast(channel: ChannelType, recipients: Vec<String>, body: impl Into<String>) -> Self {
        Self::new(channel, DeliveryKind::Broadcast, recipients, body)
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_attachment(mut self, attachment: Option<String>) -> Self {
        self.attachment = attachment;
        self
    }

    pub fn with_html(mut self, html: bool) -> Self {
        self.html = html;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Copy of this envelope addressed to one recipient only.
    ///
    /// The copy keeps the message id, so ledger updates for it land on the
    /// (message id, recipient) record of the original submission.
    pub fn for_recipient(&self, recipient: &str) -> Envelope {
        Envelope {
            recipients: vec![recipient.to_string()],
            ..self.clone()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == DeliveryKind::Broadcast
    }

    /// Check the envelope invariants: at least one recipient, no blank
    /// recipient, non-blank body.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.recipients.is_empty() {
            return Err(ModelError::NoRecipients);
        }
        if let Some(position) = self.recipients.iter().position(|r| r.trim().is_empty()) {
            return Err(ModelError::BlankRecipient(position));
        }
        if self.body.trim().is_empty() {
            return Err(ModelError::BlankBody);
        }
        Ok(())
    }
}

// ============================================================================
// Delivery State Machine
// ============================================================================

/// Lifecycle state of one (message, recipient) ledger record.
///
/// ```text
/// SCHEDULED -> QUEUED -> PROCESSING -> SENT -> DELIVERED
///                                   \-> FAILED -> (retry) QUEUED
/// any non-terminal -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Scheduled,
    Queued,
    Processing,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl DeliveryState {
    pub const ALL: [DeliveryState; 7] = [
        DeliveryState::Scheduled,
        DeliveryState::Queued,
        DeliveryState::Processing,
        DeliveryState::Sent,
        DeliveryState::Delivered,
        DeliveryState::Failed,
        DeliveryState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Scheduled => "SCHEDULED",
            DeliveryState::Queued => "QUEUED",
            DeliveryState::Processing => "PROCESSING",
            DeliveryState::Sent => "SENT",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::Failed => "FAILED",
            DeliveryState::Cancelled => "CANCELLED",
        }
    }

    /// No further delivery attempt happens from a terminal state without an
    /// explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Sent | DeliveryState::Delivered | DeliveryState::Failed | DeliveryState::Cancelled
        )
    }

    /// Counted as pending by the status report
    pub fn is_pending(&self) -> bool {
        matches!(self, DeliveryState::Queued | DeliveryState::Processing)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Delivered)
    }

    /// Whether `next` is a legal move from this state.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        match (self, next) {
            (Scheduled, Queued | Processing | Failed | Cancelled) => true,
            (Queued, Processing | Failed | Cancelled) => true,
            (Processing, Sent | Failed | Cancelled) => true,
            (Sent, Delivered) => true,
            (Failed, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ModelError::UnknownState(s.to_string()))
    }
}

// ============================================================================
// Status Records
// ============================================================================

/// Compound ledger key. Broadcast recipients share the message id and are
/// told apart by the recipient address itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusKey {
    pub message_id: String,
    pub recipient: String,
}

impl StatusKey {
    pub fn new(message_id: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            recipient: recipient.into(),
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message_id, self.recipient)
    }
}

/// Durable lifecycle record of one (message, recipient) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub message_id: String,
    pub recipient: String,
    pub channel: ChannelType,
    pub state: DeliveryState,
    /// Time of the last state transition
    pub updated_at: DateTime<Utc>,
    pub error_detail: Option<String>,
    pub owner_id: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(
        message_id: impl Into<String>,
        recipient: impl Into<String>,
        channel: ChannelType,
        owner_id: impl Into<String>,
        state: DeliveryState,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            recipient: recipient.into(),
            channel,
            state,
            updated_at: now,
            error_detail: None,
            owner_id: owner_id.into(),
            retry_count: 0,
            created_at: now,
        }
    }

    pub fn key(&self) -> StatusKey {
        StatusKey::new(self.message_id.clone(), self.recipient.clone())
    }

    /// Move to `next`, stamping the transition time. Callers check
    /// [`DeliveryState::can_transition_to`] first.
    pub fn apply(&mut self, next: DeliveryState, error_detail: Option<String>) {
        if self.state == DeliveryState::Failed && next == DeliveryState::Queued {
            self.retry_count += 1;
        }
        self.state = next;
        self.error_detail = error_detail;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Model-level validation and parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("envelope has no recipients")]
    NoRecipients,

    #[error("recipient at position {0} is blank")]
    BlankRecipient(usize),

    #[error("message body is blank")]
    BlankBody,

    #[error("unknown channel type: {0}")]
    UnknownChannel(String),

    #[error("unknown delivery state: {0}")]
    UnknownState(String),
}
