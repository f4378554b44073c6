//! Message ledger: validation, append inside a conversation tx, and the read-side windows.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{MediaItem, Message, NewMessage};
use crate::store::ConversationTx;
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const MAX_AFTER_LIMIT: usize = 500;

/// Checks a client-submitted text message before any lock is taken.
pub fn validate_text(content: &str, media: &[MediaItem], max_length: usize) -> AppResult<()> {
    if content.trim().is_empty() && media.is_empty() {
        return Err(AppError::invalid("message must have content or media"));
    }
    let length = content.chars().count();
    if length > max_length {
        return Err(AppError::invalid(format!(
            "message is {length} characters, the limit is {max_length}"
        )));
    }
    if media.iter().any(|m| m.url.trim().is_empty()) {
        return Err(AppError::invalid("media url must not be empty"));
    }
    Ok(())
}

pub fn clamp_page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

pub fn clamp_after_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(MAX_AFTER_LIMIT).clamp(1, MAX_AFTER_LIMIT)
}

/// Appends inside the caller's tx. The sender implicitly has read what they wrote.
pub async fn append(tx: &mut dyn ConversationTx, message: NewMessage) -> AppResult<Message> {
    if let Some(reply_to) = message.reply_to_id {
        if !tx.message_exists(reply_to).await? {
            return Err(AppError::invalid(
                "reply target is not a message in this conversation",
            ));
        }
    }

    let appended = tx.append(message).await?;
    if let Some(sender) = appended.sender_id {
        tx.set_read_marker(sender, appended.sequence).await?;
    }
    metrics::record_message_appended(appended.kind.as_str());
    Ok(appended)
}

/// Descending page with the cursor for the next older page.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Pass as `before` to continue; `None` once sequence 1 has been returned.
    pub next_before: Option<i64>,
}

impl MessagePage {
    pub fn new(messages: Vec<Message>) -> Self {
        let next_before = messages.last().map(|m| m.sequence).filter(|s| *s > 1);
        Self {
            messages: messages.into_iter().map(Message::redacted).collect(),
            next_before,
        }
    }
}

/// Ascending window used by catch-up.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesAfter {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub last_sequence: i64,
}

impl MessagesAfter {
    /// `fetched` was read with `limit + 1` so an extra row signals more.
    pub fn new(conversation_id: Uuid, mut fetched: Vec<Message>, limit: usize, last_sequence: i64) -> Self {
        let has_more = fetched.len() > limit;
        fetched.truncate(limit);
        Self {
            conversation_id,
            messages: fetched.into_iter().map(Message::redacted).collect(),
            has_more,
            last_sequence,
        }
    }

    pub fn highest_sequence(&self) -> Option<i64> {
        self.messages.last().map(|m| m.sequence)
    }
}
