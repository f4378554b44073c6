use super::member::MemberRole;
use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub is_group: bool,
    pub title: Option<String>,
    pub media_url: Option<String>,
    /// Canonical unordered pair for direct chats; `None` for groups.
    #[serde(skip)]
    pub direct_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sequence: i64,
}

impl Conversation {
    pub fn new_direct(user_a: Uuid, user_b: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            is_group: false,
            title: None,
            media_url: None,
            direct_key: Some(direct_key(user_a, user_b)),
            created_at: now,
            updated_at: now,
            last_sequence: 0,
        }
    }

    pub fn new_group(title: String, media_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            is_group: true,
            title: Some(title),
            media_url,
            direct_key: None,
            created_at: now,
            updated_at: now,
            last_sequence: 0,
        }
    }
}

/// Same key for (a, b) and (b, a).
pub fn direct_key(user_a: Uuid, user_b: Uuid) -> String {
    let (lo, hi) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{lo}:{hi}")
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// Per-caller view of a conversation used by list/get
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub is_group: bool,
    pub title: Option<String>,
    pub media_url: Option<String>,
    /// The other member of a direct chat; clients render the peer instead of a title.
    pub peer_id: Option<Uuid>,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
    pub last_sequence: i64,
    pub last_read_sequence: i64,
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial metadata update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
}
