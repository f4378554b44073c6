use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Only the moderation collaborator moves a message between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    Visible,
    SystemRemoved,
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::SystemRemoved => "system_removed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "visible" => Some(Self::Visible),
            "system_removed" => Some(Self::SystemRemoved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg", "mov", "quicktime", "avi"];

impl MediaKind {
    /// Guess from the URL's file extension; anything unrecognized is a plain file.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match ext.as_deref() {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Self::Image,
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext) => Self::Video,
            _ => Self::File,
        }
    }
}

/// Durable reference returned by the media storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Media as submitted by clients; `kind` is optional and guessed when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaInput {
    pub url: String,
    #[serde(default)]
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<MediaInput> for MediaItem {
    fn from(input: MediaInput) -> Self {
        let kind = input.kind.unwrap_or_else(|| MediaKind::from_url(&input.url));
        Self {
            url: input.url,
            kind,
            name: input.name,
        }
    }
}

/// Immutable ledger entry. Only `moderation_state` changes after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sequence: i64,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub media: Vec<MediaItem>,
    pub reply_to_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub moderation_state: ModerationState,
}

impl Message {
    /// End-user view: removed messages keep their slot in the ledger but lose their body.
    pub fn redacted(mut self) -> Self {
        if self.moderation_state == ModerationState::SystemRemoved {
            self.content.clear();
            self.media.clear();
        }
        self
    }
}

/// A message about to be appended; the ledger assigns id, sequence and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub media: Vec<MediaItem>,
    pub reply_to_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(
        sender_id: Uuid,
        content: String,
        media: Vec<MediaItem>,
        reply_to_id: Option<Uuid>,
    ) -> Self {
        Self {
            sender_id: Some(sender_id),
            kind: MessageKind::Text,
            content,
            media,
            reply_to_id,
        }
    }

    pub fn system(actor_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self {
            sender_id: actor_id,
            kind: MessageKind::System,
            content: content.into(),
            media: Vec::new(),
            reply_to_id: None,
        }
    }
}
