use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The JSON frame exchanged over the socket, one object per frame.
/// Distinct from the persisted message row: this is what the hub fans out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Hub-generated "<user> is online" / "<user> is offline" notification.
    /// No receiver and no conversation id, so the hub fans it out to everyone.
    pub fn presence(username: &str, online: bool) -> Self {
        let state = if online { "online" } else { "offline" };
        Self {
            id: None,
            body: format!("{username} is {state}"),
            sender: Some(username.to_string()),
            receiver: None,
            conversation_id: None,
            created_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_stay_off_the_wire() {
        let json = serde_json::to_string(&WireMessage::presence("alice", true)).unwrap();
        assert!(json.contains("\"alice is online\""));
        assert!(!json.contains("receiver"));
        assert!(!json.contains("conversation_id"));
        assert!(!json.contains("created_at"));
    }

    #[test]
    fn client_frame_decodes_with_missing_optionals() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"body":"hi","receiver":"bob"}"#).unwrap();
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.receiver.as_deref(), Some("bob"));
        assert!(msg.id.is_none());
        assert!(msg.conversation_id.is_none());
    }
}
