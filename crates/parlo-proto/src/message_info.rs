use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of a MESSAGE_LIST reply.
///
/// Serialised as a JSON array in the packet payload; `duration` is omitted
/// when the server has not probed the audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub file_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub audio_format: String,
    pub status: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_omitted_when_absent() {
        let info = MessageInfo {
            id: Uuid::nil(),
            sender_id: Uuid::nil(),
            sender_name: "ada".into(),
            file_size: 4,
            duration: None,
            audio_format: "opus".into(),
            status: "transmitted".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("duration"));

        let back: MessageInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
