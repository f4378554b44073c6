//! In-process store with the same semantics as Postgres.
//!
//! Each conversation lives behind its own `tokio::sync::Mutex`; a [`MemoryTx`] holds the owned
//! guard for its whole lifetime and writes through with an undo snapshot, so an uncommitted tx
//! is rolled back when dropped. Cross-conversation indexes live in a catalog that is only
//! touched on create and commit.

use super::{
    ConversationStore, ConversationTx, CreateOutcome, CreatedConversation, ModerationUpdate,
    NewConversation,
};
use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Member, MemberRole, Message, ModerationState, NewMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type RecordHandle = Arc<Mutex<ConversationRecord>>;

#[derive(Default)]
struct Catalog {
    conversations: HashMap<Uuid, RecordHandle>,
    direct: HashMap<String, Uuid>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
    // message id -> (conversation id, sequence)
    messages: HashMap<Uuid, (Uuid, i64)>,
}

impl Catalog {
    fn unlink_user(&mut self, user_id: Uuid, conversation_id: Uuid) {
        if let Some(set) = self.by_user.get_mut(&user_id) {
            set.remove(&conversation_id);
            if set.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
    }
}

struct ConversationRecord {
    conversation: Conversation,
    members: BTreeMap<Uuid, Member>,
    markers: HashMap<Uuid, i64>,
    // index i holds sequence i + 1
    messages: Vec<Message>,
    moderation_reasons: HashMap<Uuid, String>,
    deleted: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    catalog: Arc<RwLock<Catalog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, conversation_id: Uuid) -> AppResult<Option<RecordHandle>> {
        let catalog = self.catalog.read().map_err(|_| AppError::Internal)?;
        Ok(catalog.conversations.get(&conversation_id).cloned())
    }

    fn locate_message(&self, message_id: Uuid) -> AppResult<Option<(Uuid, i64)>> {
        let catalog = self.catalog.read().map_err(|_| AppError::Internal)?;
        Ok(catalog.messages.get(&message_id).copied())
    }
}

fn materialize(conversation_id: Uuid, sequence: i64, new: NewMessage) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sequence,
        sender_id: new.sender_id,
        kind: new.kind,
        content: new.content,
        media: new.media,
        reply_to_id: new.reply_to_id,
        created_at: Utc::now(),
        moderation_state: ModerationState::Visible,
    }
}

fn slot(sequence: i64) -> usize {
    sequence.max(0) as usize
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<CreateOutcome> {
        let mut catalog = self.catalog.write().map_err(|_| AppError::Internal)?;
        if let Some(key) = &new.conversation.direct_key {
            if let Some(existing) = catalog.direct.get(key) {
                return Ok(CreateOutcome::Existing(*existing));
            }
        }

        let mut conversation = new.conversation;
        let id = conversation.id;
        let mut markers = HashMap::new();
        let mut messages = Vec::new();
        let system_message = new.system_message.map(|m| {
            let msg = materialize(id, 1, m);
            conversation.last_sequence = 1;
            conversation.updated_at = msg.created_at;
            // the author has seen their own entry
            if let Some(sender) = msg.sender_id {
                markers.insert(sender, 1);
            }
            messages.push(msg.clone());
            msg
        });

        let members: BTreeMap<Uuid, Member> = new
            .members
            .iter()
            .map(|m| (m.user_id, m.clone()))
            .collect();

        for user_id in members.keys() {
            catalog.by_user.entry(*user_id).or_default().insert(id);
        }
        if let Some(key) = &conversation.direct_key {
            catalog.direct.insert(key.clone(), id);
        }
        if let Some(msg) = &system_message {
            catalog.messages.insert(msg.id, (id, msg.sequence));
        }

        let record = ConversationRecord {
            conversation: conversation.clone(),
            members,
            markers,
            messages,
            moderation_reasons: HashMap::new(),
            deleted: false,
        };
        catalog
            .conversations
            .insert(id, Arc::new(Mutex::new(record)));

        Ok(CreateOutcome::Created(CreatedConversation {
            conversation,
            members: new.members,
            system_message,
        }))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(None);
        };
        let record = handle.lock().await;
        Ok((!record.deleted).then(|| record.conversation.clone()))
    }

    async fn get_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Member>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(None);
        };
        let record = handle.lock().await;
        Ok(record.members.get(&user_id).cloned())
    }

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<Member>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(Vec::new());
        };
        let record = handle.lock().await;
        let mut members: Vec<Member> = record.members.values().cloned().collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let handles: Vec<RecordHandle> = {
            let catalog = self.catalog.read().map_err(|_| AppError::Internal)?;
            catalog
                .by_user
                .get(&user_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| catalog.conversations.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut conversations = Vec::with_capacity(handles.len());
        for handle in handles {
            let record = handle.lock().await;
            if !record.deleted && record.members.contains_key(&user_id) {
                conversations.push(record.conversation.clone());
            }
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(conversations)
    }

    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(Vec::new());
        };
        let record = handle.lock().await;
        let len = record.messages.len();
        let upper = before
            .map(|b| slot(b - 1))
            .unwrap_or(len)
            .min(len);
        let lower = upper.saturating_sub(limit);
        Ok(record.messages[lower..upper].iter().rev().cloned().collect())
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(Vec::new());
        };
        let record = handle.lock().await;
        let len = record.messages.len();
        let start = slot(after).min(len);
        let end = start.saturating_add(limit).min(len);
        Ok(record.messages[start..end].to_vec())
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(None);
        };
        let record = handle.lock().await;
        Ok(record.messages.last().cloned())
    }

    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(0);
        };
        let record = handle.lock().await;
        Ok(record.markers.get(&user_id).copied().unwrap_or(0))
    }

    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid, after: i64) -> AppResult<i64> {
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(0);
        };
        let record = handle.lock().await;
        let start = slot(after).min(record.messages.len());
        Ok(record.messages[start..]
            .iter()
            .filter(|m| m.sender_id != Some(user_id))
            .count() as i64)
    }

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let Some((conversation_id, sequence)) = self.locate_message(message_id)? else {
            return Ok(None);
        };
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(None);
        };
        let record = handle.lock().await;
        Ok(record.messages.get(slot(sequence - 1)).cloned())
    }

    async fn set_moderation_state(
        &self,
        message_id: Uuid,
        state: ModerationState,
        reason: Option<String>,
    ) -> AppResult<Option<ModerationUpdate>> {
        let Some((conversation_id, sequence)) = self.locate_message(message_id)? else {
            return Ok(None);
        };
        let Some(handle) = self.record(conversation_id)? else {
            return Ok(None);
        };
        let mut record = handle.lock().await;
        if record.deleted {
            return Ok(None);
        }
        let Some(message) = record.messages.get_mut(slot(sequence - 1)) else {
            return Ok(None);
        };

        let changed = message.moderation_state != state;
        if changed {
            message.moderation_state = state;
        }
        let message = message.clone();
        if changed {
            match reason {
                Some(reason) => record.moderation_reasons.insert(message_id, reason),
                None => record.moderation_reasons.remove(&message_id),
            };
        }
        Ok(Some(ModerationUpdate { message, changed }))
    }

    async fn lock(&self, conversation_id: Uuid, wait: Duration) -> AppResult<Box<dyn ConversationTx>> {
        let handle = self
            .record(conversation_id)?
            .ok_or_else(|| AppError::not_found("conversation"))?;
        let record = tokio::time::timeout(wait, handle.lock_owned())
            .await
            .map_err(|_| AppError::Conflict(conversation_id))?;
        if record.deleted {
            return Err(AppError::not_found("conversation"));
        }

        let undo = Undo {
            conversation: record.conversation.clone(),
            members: record.members.clone(),
            markers: record.markers.clone(),
            message_count: record.messages.len(),
        };
        Ok(Box::new(MemoryTx {
            catalog: Arc::clone(&self.catalog),
            record,
            undo: Some(undo),
            joined: Vec::new(),
            left: Vec::new(),
            appended: Vec::new(),
            delete: false,
        }))
    }
}

struct Undo {
    conversation: Conversation,
    members: BTreeMap<Uuid, Member>,
    markers: HashMap<Uuid, i64>,
    message_count: usize,
}

pub struct MemoryTx {
    catalog: Arc<RwLock<Catalog>>,
    record: OwnedMutexGuard<ConversationRecord>,
    // Some until committed
    undo: Option<Undo>,
    joined: Vec<Uuid>,
    left: Vec<Uuid>,
    appended: Vec<(Uuid, i64)>,
    delete: bool,
}

impl MemoryTx {
    fn touch(&mut self) {
        self.record.conversation.updated_at = Utc::now();
    }
}

#[async_trait]
impl ConversationTx for MemoryTx {
    fn conversation(&self) -> &Conversation {
        &self.record.conversation
    }

    async fn member(&mut self, user_id: Uuid) -> AppResult<Option<Member>> {
        Ok(self.record.members.get(&user_id).cloned())
    }

    async fn members(&mut self) -> AppResult<Vec<Member>> {
        let mut members: Vec<Member> = self.record.members.values().cloned().collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    async fn message_exists(&mut self, message_id: Uuid) -> AppResult<bool> {
        Ok(self.record.messages.iter().any(|m| m.id == message_id))
    }

    async fn read_marker(&mut self, user_id: Uuid) -> AppResult<i64> {
        Ok(self.record.markers.get(&user_id).copied().unwrap_or(0))
    }

    async fn append(&mut self, message: NewMessage) -> AppResult<Message> {
        let sequence = self.record.conversation.last_sequence + 1;
        let message = materialize(self.record.conversation.id, sequence, message);
        self.record.conversation.last_sequence = sequence;
        self.record.conversation.updated_at = message.created_at;
        self.record.messages.push(message.clone());
        self.appended.push((message.id, sequence));
        Ok(message)
    }

    async fn insert_members(&mut self, members: &[Member]) -> AppResult<()> {
        for member in members {
            if self.record.members.contains_key(&member.user_id) {
                return Err(AppError::invalid("user is already a member"));
            }
        }
        for member in members {
            self.record.members.insert(member.user_id, member.clone());
            self.joined.push(member.user_id);
        }
        self.touch();
        Ok(())
    }

    async fn delete_member(&mut self, user_id: Uuid) -> AppResult<()> {
        if self.record.members.remove(&user_id).is_none() {
            return Err(AppError::not_found("member"));
        }
        self.record.markers.remove(&user_id);
        self.left.push(user_id);
        self.touch();
        Ok(())
    }

    async fn set_role(&mut self, user_id: Uuid, role: MemberRole) -> AppResult<()> {
        let member = self
            .record
            .members
            .get_mut(&user_id)
            .ok_or_else(|| AppError::not_found("member"))?;
        member.role = role;
        self.touch();
        Ok(())
    }

    async fn set_read_marker(&mut self, user_id: Uuid, sequence: i64) -> AppResult<()> {
        self.record.markers.insert(user_id, sequence);
        Ok(())
    }

    async fn set_metadata(&mut self, title: Option<String>, media_url: Option<String>) -> AppResult<()> {
        self.record.conversation.title = title;
        self.record.conversation.media_url = media_url;
        self.touch();
        Ok(())
    }

    async fn delete_conversation(&mut self) -> AppResult<()> {
        self.delete = true;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> AppResult<()> {
        let catalog = Arc::clone(&self.catalog);
        let mut catalog = catalog.write().map_err(|_| AppError::Internal)?;
        let id = self.record.conversation.id;

        if self.delete {
            catalog.conversations.remove(&id);
            if let Some(key) = &self.record.conversation.direct_key {
                catalog.direct.remove(key);
            }
            let users: Vec<Uuid> = self
                .record
                .members
                .keys()
                .copied()
                .chain(self.left.iter().copied())
                .collect();
            for user_id in users {
                catalog.unlink_user(user_id, id);
            }
            for message in &self.record.messages {
                catalog.messages.remove(&message.id);
            }

            let record = &mut *self.record;
            record.deleted = true;
            record.members.clear();
            record.markers.clear();
            record.messages.clear();
            record.moderation_reasons.clear();
        } else {
            for user_id in &self.joined {
                catalog.by_user.entry(*user_id).or_default().insert(id);
            }
            for user_id in &self.left {
                if !self.record.members.contains_key(user_id) {
                    catalog.unlink_user(*user_id, id);
                }
            }
            for (message_id, sequence) in &self.appended {
                catalog.messages.insert(*message_id, (id, *sequence));
            }
        }

        self.undo = None;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            let record = &mut *self.record;
            record.conversation = undo.conversation;
            record.members = undo.members;
            record.markers = undo.markers;
            record.messages.truncate(undo.message_count);
        }
    }
}
