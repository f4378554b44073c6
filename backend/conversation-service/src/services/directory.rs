//! Conversation lifecycle and per-viewer summaries.

use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationSummary, Member, MemberRole, MetadataPatch, NewMessage, Participant,
};
use crate::services::membership::{self, texts};
use crate::store::{ConversationStore, NewConversation};
use uuid::Uuid;

pub fn plan_direct(user_a: Uuid, user_b: Uuid) -> AppResult<NewConversation> {
    if user_a == user_b {
        return Err(AppError::invalid("cannot start a direct conversation with yourself"));
    }
    let conversation = Conversation::new_direct(user_a, user_b);
    let members = vec![
        Member::new(conversation.id, user_a, MemberRole::Member),
        Member::new(conversation.id, user_b, MemberRole::Member),
    ];
    Ok(NewConversation {
        conversation,
        members,
        system_message: None,
    })
}

/// Creator becomes owner; everyone else joins as a plain member.
pub fn plan_group(
    creator_id: Uuid,
    title: &str,
    media_url: Option<String>,
    member_ids: &[Uuid],
) -> AppResult<NewConversation> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::invalid("group title must not be empty"));
    }
    let media_url = media_url.filter(|url| !url.trim().is_empty());

    let conversation = Conversation::new_group(title.to_string(), media_url);
    let mut members = vec![Member::new(conversation.id, creator_id, MemberRole::Owner)];
    for user_id in membership::new_member_ids(member_ids, &[], creator_id) {
        members.push(Member::new(conversation.id, user_id, MemberRole::Member));
    }

    Ok(NewConversation {
        system_message: Some(NewMessage::system(
            Some(creator_id),
            texts::created_group(creator_id),
        )),
        conversation,
        members,
    })
}

/// Result of applying a patch to the current header. `None` fields are unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataChange {
    pub title: Option<String>,
    pub media_url: Option<Option<String>>,
}

impl MetadataChange {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.media_url.is_none()
    }
}

/// Diffs the patch against the conversation. A blank title is rejected, an empty
/// `media_url` clears the photo.
pub fn diff_metadata(current: &Conversation, patch: &MetadataPatch) -> AppResult<MetadataChange> {
    let title = match patch.title.as_deref().map(str::trim) {
        Some("") => return Err(AppError::invalid("group title must not be empty")),
        Some(title) if current.title.as_deref() != Some(title) => Some(title.to_string()),
        _ => None,
    };

    let media_url = match patch.media_url.as_deref().map(str::trim) {
        Some(url) => {
            let next = (!url.is_empty()).then(|| url.to_string());
            (next != current.media_url).then_some(next)
        }
        None => None,
    };

    Ok(MetadataChange { title, media_url })
}

/// Builds the viewer's summary from committed state.
pub async fn summarize(
    store: &dyn ConversationStore,
    conversation: Conversation,
    viewer: Uuid,
) -> AppResult<ConversationSummary> {
    let members = store.list_members(conversation.id).await?;
    let last_message = store
        .last_message(conversation.id)
        .await?
        .map(|m| m.redacted());
    let last_read_sequence = store.read_marker(conversation.id, viewer).await?;
    let unread_count = store
        .count_unread(conversation.id, viewer, last_read_sequence)
        .await?;

    let peer_id = if conversation.is_group {
        None
    } else {
        members.iter().map(|m| m.user_id).find(|id| *id != viewer)
    };

    Ok(ConversationSummary {
        id: conversation.id,
        is_group: conversation.is_group,
        title: conversation.title,
        media_url: conversation.media_url,
        peer_id,
        participants: members
            .into_iter()
            .map(|m| Participant {
                user_id: m.user_id,
                role: m.role,
                joined_at: m.joined_at,
            })
            .collect(),
        last_message,
        last_sequence: conversation.last_sequence,
        last_read_sequence,
        unread_count,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    })
}
