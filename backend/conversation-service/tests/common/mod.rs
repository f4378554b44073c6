use async_trait::async_trait;
use conversation_service::{
    error::AppResult,
    models::{Conversation, Member, Message, ModerationState},
    services::{ConversationOrchestrator, NoopModeration, OrchestratorSettings},
    services::retry::RetryConfig,
    store::{
        ConversationStore, ConversationTx, CreateOutcome, MemoryStore, ModerationUpdate,
        NewConversation,
    },
    websocket::{fanout::Fanout, ConnectionRegistry, Frame},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

#[allow(dead_code)]
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        lock_timeout: Duration::from_secs(2),
        retry: RetryConfig::with_max_retries(3),
        max_message_length: 4000,
    }
}

/// Orchestrator over a fresh in-memory store with no cross-instance relay.
#[allow(dead_code)]
pub fn orchestrator() -> ConversationOrchestrator {
    orchestrator_with_store(Arc::new(MemoryStore::new()))
}

#[allow(dead_code)]
pub fn orchestrator_with_store(store: Arc<dyn ConversationStore>) -> ConversationOrchestrator {
    ConversationOrchestrator::new(
        store,
        Fanout::new(ConnectionRegistry::new()),
        Arc::new(NoopModeration),
        test_settings(),
    )
}

/// Memory store that reports each newly inserted conversation id and then stalls before
/// returning, widening the gap between the insert and the caller's next step.
#[allow(dead_code)]
pub struct StallingCreateStore {
    inner: MemoryStore,
    stall: Duration,
    created: UnboundedSender<Uuid>,
}

#[allow(dead_code)]
impl StallingCreateStore {
    pub fn new(stall: Duration) -> (Self, UnboundedReceiver<Uuid>) {
        let (created, rx) = unbounded_channel();
        let store = Self {
            inner: MemoryStore::new(),
            stall,
            created,
        };
        (store, rx)
    }
}

#[async_trait]
impl ConversationStore for StallingCreateStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<CreateOutcome> {
        let outcome = self.inner.create_conversation(new).await?;
        if let CreateOutcome::Created(created) = &outcome {
            let _ = self.created.send(created.conversation.id);
            tokio::time::sleep(self.stall).await;
        }
        Ok(outcome)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn get_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Member>> {
        self.inner.get_member(conversation_id, user_id).await
    }

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<Member>> {
        self.inner.list_members(conversation_id).await
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        self.inner.list_for_user(user_id).await
    }

    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        self.inner.page(conversation_id, before, limit).await
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        self.inner.messages_after(conversation_id, after, limit).await
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        self.inner.last_message(conversation_id).await
    }

    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        self.inner.read_marker(conversation_id, user_id).await
    }

    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        after: i64,
    ) -> AppResult<i64> {
        self.inner.count_unread(conversation_id, user_id, after).await
    }

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        self.inner.find_message(message_id).await
    }

    async fn set_moderation_state(
        &self,
        message_id: Uuid,
        state: ModerationState,
        reason: Option<String>,
    ) -> AppResult<Option<ModerationUpdate>> {
        self.inner.set_moderation_state(message_id, state, reason).await
    }

    async fn lock(
        &self,
        conversation_id: Uuid,
        wait: Duration,
    ) -> AppResult<Box<dyn ConversationTx>> {
        self.inner.lock(conversation_id, wait).await
    }
}

/// Everything already delivered to a session, decoded.
#[allow(dead_code)]
pub fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(serde_json::from_str(&frame.payload).expect("frame payload is json"));
    }
    events
}

#[allow(dead_code)]
pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
