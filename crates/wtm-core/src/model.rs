use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Error;

/// Lease window after `locked_at` beyond which a LOCKED row may be
/// re-claimed by another worker.
pub const LEASE_TIMEOUT_SECONDS: i64 = 300;

/// Number of hex characters of the id shown to users in confirmations and
/// accepted back in `cancel <prefix>`.
pub const SHORT_ID_LEN: usize = 12;

/// Lifecycle of a scheduled message.
///
/// `Sent` and `Cancelled` are terminal. A `Locked` row whose lease expired
/// is re-claimable as if it were still `Scheduled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    Locked,
    Sent,
    Cancelled,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Locked => "LOCKED",
            Self::Sent => "SENT",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "LOCKED" => Ok(Self::Locked),
            "SENT" => Ok(Self::Sent),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Storage(format!("unknown message status: {other}"))),
        }
    }
}

/// A durably scheduled outbound message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    /// Recipient address on the gateway.
    pub chat_id: String,
    /// Originator address; required in assistant mode.
    pub from_chat_id: Option<String>,
    pub text: String,
    pub send_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    /// Globally unique; enforces at-most-one creation per logical request.
    pub idempotency_key: String,
    /// Gateway id of the "Scheduled" confirmation reply, for
    /// cancel-by-quoted-reply.
    pub confirmation_message_id: Option<String>,
    pub source: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// User-visible short id: the first 12 hex characters of the uuid.
    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }
}

pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string().chars().take(SHORT_ID_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            MessageStatus::Scheduled,
            MessageStatus::Locked,
            MessageStatus::Sent,
            MessageStatus::Cancelled,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Cancelled.is_terminal());
        assert!(!MessageStatus::Locked.is_terminal());
        assert!(!MessageStatus::Failed.is_terminal());
    }

    #[test]
    fn short_id_is_twelve_hex_chars() {
        let id = Uuid::new_v4();
        let short = short_id(&id);
        assert_eq!(short.len(), 12);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.simple().to_string().starts_with(&short));
    }

    #[test]
    fn status_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&MessageStatus::Scheduled).unwrap();
        assert_eq!(json, "\"SCHEDULED\"");
    }
}
