//! Durable state behind one seam.
//!
//! Every mutation of a conversation goes through a [`ConversationTx`] obtained from
//! [`ConversationStore::lock`]. The tx owns the conversation's serialization point until it
//! is committed or dropped; dropping without `commit` leaves no trace.

use crate::error::AppResult;
use crate::models::{Conversation, Member, MemberRole, Message, ModerationState, NewMessage};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A conversation to create together with its initial members and optional first entry.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation: Conversation,
    pub members: Vec<Member>,
    pub system_message: Option<NewMessage>,
}

#[derive(Debug, Clone)]
pub struct CreatedConversation {
    pub conversation: Conversation,
    pub members: Vec<Member>,
    pub system_message: Option<Message>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(CreatedConversation),
    /// A direct conversation for the same pair already existed.
    Existing(Uuid),
}

#[derive(Debug, Clone)]
pub struct ModerationUpdate {
    pub message: Message,
    /// False when the message already was in the requested state.
    pub changed: bool,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Inserts a brand-new conversation. Direct conversations are deduplicated on their
    /// canonical pair key, atomically with respect to concurrent creators.
    async fn create_conversation(&self, new: NewConversation) -> AppResult<CreateOutcome>;

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>>;

    async fn get_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Member>>;

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<Member>>;

    /// Conversations the user belongs to, most recently updated first.
    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;

    /// Descending by sequence, strictly below `before` when given.
    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>>;

    /// Ascending by sequence, strictly above `after`.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>>;

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>>;

    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64>;

    /// Messages above `after` that were not sent by `user_id`.
    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid, after: i64) -> AppResult<i64>;

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<Message>>;

    /// Returns `None` when the message does not exist.
    async fn set_moderation_state(
        &self,
        message_id: Uuid,
        state: ModerationState,
        reason: Option<String>,
    ) -> AppResult<Option<ModerationUpdate>>;

    /// Acquires the conversation's serialization point, waiting at most `wait`.
    /// Fails `NotFound` if the conversation does not exist (or was deleted while waiting)
    /// and `Conflict` if the wait elapsed.
    async fn lock(&self, conversation_id: Uuid, wait: Duration) -> AppResult<Box<dyn ConversationTx>>;
}

/// Serialized unit of work on one conversation.
#[async_trait]
pub trait ConversationTx: Send {
    /// Header as of lock acquisition plus this tx's own writes.
    fn conversation(&self) -> &Conversation;

    async fn member(&mut self, user_id: Uuid) -> AppResult<Option<Member>>;

    async fn members(&mut self) -> AppResult<Vec<Member>>;

    async fn message_exists(&mut self, message_id: Uuid) -> AppResult<bool>;

    async fn read_marker(&mut self, user_id: Uuid) -> AppResult<i64>;

    /// Assigns `last_sequence + 1`, persists the entry and bumps `updated_at`.
    async fn append(&mut self, message: NewMessage) -> AppResult<Message>;

    async fn insert_members(&mut self, members: &[Member]) -> AppResult<()>;

    /// Also drops the member's read marker.
    async fn delete_member(&mut self, user_id: Uuid) -> AppResult<()>;

    async fn set_role(&mut self, user_id: Uuid, role: MemberRole) -> AppResult<()>;

    async fn set_read_marker(&mut self, user_id: Uuid, sequence: i64) -> AppResult<()>;

    async fn set_metadata(&mut self, title: Option<String>, media_url: Option<String>) -> AppResult<()>;

    /// Removes the conversation with its members, messages and markers on commit.
    async fn delete_conversation(&mut self) -> AppResult<()>;

    async fn commit(self: Box<Self>) -> AppResult<()>;
}
