//! Outbound queue entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Freshly enqueued, never attempted
    Pending,
    /// Manually scheduled for the next cycle
    Queued,
    /// Claimed by a processor, attempt in flight
    Processing,
    Sent,
    /// Attempts exhausted
    Failed,
    /// Rejected permanently by the remote side
    Bounced,
    /// Waiting for the next retry
    Deferred,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Bounced => "bounced",
            QueueStatus::Deferred => "deferred",
        }
    }

    /// Statuses a processor may claim
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Queued | QueueStatus::Deferred
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Bounced
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            "bounced" => Ok(QueueStatus::Bounced),
            "deferred" => Ok(QueueStatus::Deferred),
            other => Err(format!("unknown queue status: {}", other)),
        }
    }
}

/// A message waiting for delivery to one remote recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uuid,
    /// Outbound message blob shared by all recipients of one transaction
    pub message_id: Uuid,
    /// Envelope sender; empty for bounces
    pub from_addr: String,
    pub to_addr: String,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: QueueStatus,
    pub next_attempt: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Fields supplied by the producer of a queue entry
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub message_id: Uuid,
    pub from_addr: String,
    pub to_addr: String,
    pub priority: i32,
    pub max_attempts: u32,
}

impl QueueEntry {
    /// Build a pending entry due immediately
    pub fn new(new: NewQueueEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: new.message_id,
            from_addr: new.from_addr,
            to_addr: new.to_addr,
            priority: new.priority,
            attempts: 0,
            max_attempts: new.max_attempts,
            status: QueueStatus::Pending,
            next_attempt: now,
            last_attempt: None,
            last_error: None,
            created_at: now,
            sent_at: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Queued,
            QueueStatus::Processing,
            QueueStatus::Sent,
            QueueStatus::Failed,
            QueueStatus::Bounced,
            QueueStatus::Deferred,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>(), Ok(status));
        }
        assert!("retrying".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_new_entry_is_pending_and_due() {
        let now = Utc::now();
        let entry = QueueEntry::new(
            NewQueueEntry {
                message_id: Uuid::new_v4(),
                from_addr: "a@local.test".to_string(),
                to_addr: "c@external.test".to_string(),
                priority: 0,
                max_attempts: 3,
            },
            now,
        );
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.next_attempt, now);
        assert!(entry.status.is_claimable());
    }
}
