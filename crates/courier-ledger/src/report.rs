//! Aggregate system status report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failed records above which health is CRITICAL
const CRITICAL_FAILED: u64 = 20;
/// Failed records above which the system is in WARNING and raises an alert
const WARNING_FAILED: u64 = 10;
/// Pending records above which the system is BUSY and raises an alert
const BUSY_PENDING: u64 = 50;
/// Success rate (percent) below which an alert is raised
const ALERT_SUCCESS_RATE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemHealth {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    Idle,
    Active,
    Busy,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusReport {
    pub total: u64,
    /// SENT + DELIVERED
    pub successful: u64,
    pub failed: u64,
    /// QUEUED + PROCESSING
    pub pending: u64,
    /// Records with a transition in the last 24 hours
    pub recent_activity: u64,
    /// successful / total x 100, zero when there are no records
    pub success_rate: f64,
    pub generated_at: DateTime<Utc>,
}

impl SystemStatusReport {
    pub fn new(total: u64, successful: u64, failed: u64, pending: u64, recent_activity: u64) -> Self {
        Self {
            total,
            successful,
            failed,
            pending,
            recent_activity,
            success_rate: percent(successful, total),
            generated_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0, 0)
    }

    pub fn failure_rate(&self) -> f64 {
        percent(self.failed, self.total)
    }

    pub fn pending_rate(&self) -> f64 {
        percent(self.pending, self.total)
    }

    pub fn health(&self) -> SystemHealth {
        if self.failed > CRITICAL_FAILED {
            SystemHealth::Critical
        } else if self.success_rate < 70.0 {
            SystemHealth::Poor
        } else if self.success_rate < 85.0 {
            SystemHealth::Fair
        } else if self.success_rate < 95.0 {
            SystemHealth::Good
        } else {
            SystemHealth::Excellent
        }
    }

    pub fn status(&self) -> SystemStatus {
        if self.failed > WARNING_FAILED {
            SystemStatus::Warning
        } else if self.pending > BUSY_PENDING {
            SystemStatus::Busy
        } else if self.pending > 0 || self.recent_activity > 0 {
            SystemStatus::Active
        } else {
            SystemStatus::Idle
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.health(), SystemHealth::Critical | SystemHealth::Poor)
    }

    pub fn has_critical_alerts(&self) -> bool {
        self.failed > CRITICAL_FAILED || self.success_rate < 70.0
    }

    /// Human-readable alerts; a single "operating normally" line when none apply
    pub fn alerts(&self) -> Vec<String> {
        let mut alerts = Vec::new();
        if self.failed > WARNING_FAILED {
            alerts.push(format!("High number of failed messages: {}", self.failed));
        }
        if self.pending > BUSY_PENDING {
            alerts.push(format!("Many pending messages: {}", self.pending));
        }
        if self.success_rate < ALERT_SUCCESS_RATE {
            alerts.push(format!("Low success rate: {:.1}%", self.success_rate));
        }
        if alerts.is_empty() {
            alerts.push("System operating normally".to_string());
        }
        alerts
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
