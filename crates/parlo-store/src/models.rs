use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Lifecycle of a voice message.
///
/// Transitions move forward only: `pending → transmitted → delivered →
/// listened`, with `failed` reachable from any non-terminal state. The
/// store rejects downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Transmitted,
    Delivered,
    Listened,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transmitted => "transmitted",
            Self::Delivered => "delivered",
            Self::Listened => "listened",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "transmitted" => Ok(Self::Transmitted),
            "delivered" => Ok(Self::Delivered),
            "listened" => Ok(Self::Listened),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Transmitted => 1,
            Self::Delivered => 2,
            Self::Listened => 3,
            Self::Failed => 4,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Listened | Self::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        if *self == next {
            return true;
        }
        // Terminal states are absorbing.
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one completed (or failed) voice message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    /// Object-store key of the assembled audio.
    pub file_path: String,
    pub file_size: i64,
    pub duration_secs: Option<i64>,
    pub audio_format: String,
    pub total_chunks: u32,
    pub chunks_received: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub transmitted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub listened_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trip() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Transmitted,
            MessageStatus::Delivered,
            MessageStatus::Listened,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(MessageStatus::from_str("bogus").is_err());
    }

    #[test]
    fn lattice_moves_forward_only() {
        use MessageStatus::*;

        assert!(Pending.can_transition_to(Transmitted));
        assert!(Transmitted.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Listened));
        assert!(Pending.can_transition_to(Delivered));

        assert!(!Delivered.can_transition_to(Transmitted));
        assert!(!Transmitted.can_transition_to(Pending));
        assert!(!Listened.can_transition_to(Delivered));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        use MessageStatus::*;

        assert!(Pending.can_transition_to(Failed));
        assert!(Transmitted.can_transition_to(Failed));
        assert!(Delivered.can_transition_to(Failed));

        assert!(!Listened.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Transmitted));
        assert!(Failed.can_transition_to(Failed));
    }
}
