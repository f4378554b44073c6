//! Events pushed to connected sessions.
//!
//! Serialized as one flat JSON object per frame:
//! `{"type": "message.appended", "conversation_id": "...", "timestamp": "...", ...}`.

use crate::models::{MemberRole, Message, ModerationState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    Removed,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "message.appended")]
    MessageAppended {
        conversation_id: Uuid,
        message: Message,
    },
    #[serde(rename = "message.moderated")]
    MessageModerated {
        conversation_id: Uuid,
        message_id: Uuid,
        sequence: i64,
        moderation_state: ModerationState,
        /// Redacted view when removed, full view when restored.
        message: Message,
    },
    #[serde(rename = "member.added")]
    MemberAdded {
        conversation_id: Uuid,
        user_ids: Vec<Uuid>,
        added_by: Uuid,
        sequence: i64,
    },
    #[serde(rename = "member.removed")]
    MemberRemoved {
        conversation_id: Uuid,
        user_id: Uuid,
        removed_by: Uuid,
        reason: RemovalReason,
        sequence: i64,
    },
    #[serde(rename = "member.role_changed")]
    MemberRoleChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
        changed_by: Uuid,
        sequence: i64,
    },
    #[serde(rename = "read.advanced")]
    ReadAdvanced {
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_sequence: i64,
    },
    #[serde(rename = "conversation.created")]
    ConversationCreated {
        conversation_id: Uuid,
        is_group: bool,
        member_ids: Vec<Uuid>,
    },
    #[serde(rename = "conversation.updated")]
    ConversationUpdated {
        conversation_id: Uuid,
        title: Option<String>,
        media_url: Option<String>,
        updated_by: Uuid,
        sequence: i64,
    },
    #[serde(rename = "conversation.deleted")]
    ConversationDeleted {
        conversation_id: Uuid,
        deleted_by: Uuid,
    },
    #[serde(rename = "catchup.complete")]
    CatchUpComplete {
        conversation_id: Uuid,
        last_sequence: i64,
    },
    #[serde(rename = "typing")]
    Typing { conversation_id: Uuid, user_id: Uuid },
    #[serde(rename = "error")]
    Error {
        conversation_id: Option<Uuid>,
        code: String,
        message: String,
    },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageAppended { .. } => "message.appended",
            Self::MessageModerated { .. } => "message.moderated",
            Self::MemberAdded { .. } => "member.added",
            Self::MemberRemoved { .. } => "member.removed",
            Self::MemberRoleChanged { .. } => "member.role_changed",
            Self::ReadAdvanced { .. } => "read.advanced",
            Self::ConversationCreated { .. } => "conversation.created",
            Self::ConversationUpdated { .. } => "conversation.updated",
            Self::ConversationDeleted { .. } => "conversation.deleted",
            Self::CatchUpComplete { .. } => "catchup.complete",
            Self::Typing { .. } => "typing",
            Self::Error { .. } => "error",
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageAppended { conversation_id, .. }
            | Self::MessageModerated { conversation_id, .. }
            | Self::MemberAdded { conversation_id, .. }
            | Self::MemberRemoved { conversation_id, .. }
            | Self::MemberRoleChanged { conversation_id, .. }
            | Self::ReadAdvanced { conversation_id, .. }
            | Self::ConversationCreated { conversation_id, .. }
            | Self::ConversationUpdated { conversation_id, .. }
            | Self::ConversationDeleted { conversation_id, .. }
            | Self::CatchUpComplete { conversation_id, .. }
            | Self::Typing { conversation_id, .. } => Some(*conversation_id),
            Self::Error { conversation_id, .. } => *conversation_id,
        }
    }

    /// Ledger position carried by `message.appended`, used to dedupe against catch-up.
    pub fn appended_sequence(&self) -> Option<i64> {
        match self {
            Self::MessageAppended { message, .. } => Some(message.sequence),
            _ => None,
        }
    }

    /// JSON text with a `timestamp` field added.
    pub fn to_payload(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, event_type = self.event_type(), "Failed to serialize event");
                return String::new();
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn payload_is_flat_with_type_and_timestamp() {
        let conversation_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event = ChatEvent::ReadAdvanced {
            conversation_id,
            user_id,
            last_read_sequence: 7,
        };

        let json: Value = serde_json::from_str(&event.to_payload()).unwrap();
        assert_eq!(json["type"], "read.advanced");
        assert_eq!(json["conversation_id"], conversation_id.to_string());
        assert_eq!(json["last_read_sequence"], 7);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn removal_reason_is_lowercase() {
        let event = ChatEvent::MemberRemoved {
            conversation_id: Uuid::nil(),
            user_id: Uuid::nil(),
            removed_by: Uuid::nil(),
            reason: RemovalReason::Left,
            sequence: 4,
        };
        let json: Value = serde_json::from_str(&event.to_payload()).unwrap();
        assert_eq!(json["type"], "member.removed");
        assert_eq!(json["reason"], "left");
    }

    #[test]
    fn event_round_trips_through_relay_encoding() {
        let event = ChatEvent::ConversationDeleted {
            conversation_id: Uuid::new_v4(),
            deleted_by: Uuid::new_v4(),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: ChatEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.appended_sequence(), None);
    }
}
