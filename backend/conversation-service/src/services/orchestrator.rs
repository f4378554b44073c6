//! Facade used by HTTP routes and WebSocket sessions.
//!
//! Every mutation runs as one unit of work on a single conversation:
//! in-process lock, store lock, validate, write, commit, publish, release. Events are
//! published after commit and before release so their order on the channel matches
//! ledger order. Nothing here holds state of its own.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::OperationTimer;
use crate::models::{
    Conversation, ConversationSummary, MediaItem, Member, MemberRole, Message, MetadataPatch,
    ModerationState, NewMessage,
};
use crate::services::directory;
use crate::services::ledger::{self, MessagePage, MessagesAfter};
use crate::services::locks::{ConversationGuard, ConversationLocks};
use crate::services::membership::{self, texts, LeavePlan};
use crate::services::moderation::ModerationClient;
use crate::services::read_tracker::{self, ReadOutcome, ReadState};
use crate::services::retry::{retry_on_conflict, RetryConfig};
use crate::store::{ConversationStore, ConversationTx, CreateOutcome, CreatedConversation};
use crate::websocket::events::{ChatEvent, RemovalReason};
use crate::websocket::fanout::Fanout;
use crate::websocket::{ConnectionRegistry, Frame, SubscriberId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lock_timeout: Duration,
    pub retry: RetryConfig,
    pub max_message_length: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            retry: RetryConfig::with_max_retries(config.conflict_max_retries),
            max_message_length: config.max_message_length,
        }
    }
}

/// Client-submitted text message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: String,
    pub media: Vec<MediaItem>,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The caller was the last member; the conversation is gone.
    ConversationDeleted,
}

/// Store tx plus the in-process guard. The tx is declared first so an uncommitted unit
/// rolls back before the lock is released.
struct UnitOfWork {
    tx: Box<dyn ConversationTx>,
    guard: ConversationGuard,
}

impl UnitOfWork {
    fn tx(&mut self) -> &mut dyn ConversationTx {
        self.tx.as_mut()
    }

    /// Commits and hands back the guard; publish before dropping it.
    async fn commit(self) -> AppResult<ConversationGuard> {
        let UnitOfWork { tx, guard } = self;
        tx.commit().await?;
        Ok(guard)
    }
}

async fn timed<T, F>(operation: &'static str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let timer = OperationTimer::start(operation);
    let result = fut.await;
    timer.observe(&result);
    result
}

#[derive(Clone)]
pub struct ConversationOrchestrator {
    store: Arc<dyn ConversationStore>,
    locks: ConversationLocks,
    fanout: Fanout,
    moderation: Arc<dyn ModerationClient>,
    settings: OrchestratorSettings,
}

impl ConversationOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        fanout: Fanout,
        moderation: Arc<dyn ModerationClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            locks: ConversationLocks::new(),
            fanout,
            moderation,
            settings,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.fanout.registry()
    }

    // ========================================================================
    // Directory
    // ========================================================================

    /// Returns the pair's existing direct conversation or creates it.
    pub async fn create_direct(&self, user_id: Uuid, peer_id: Uuid) -> AppResult<ConversationSummary> {
        timed("create_direct", async move {
            let plan = directory::plan_direct(user_id, peer_id)?;
            let guard = self.lock_new(plan.conversation.id).await?;
            let conversation_id = match self.store.create_conversation(plan).await? {
                CreateOutcome::Existing(id) => {
                    drop(guard);
                    id
                }
                CreateOutcome::Created(created) => {
                    let id = created.conversation.id;
                    info!(conversation_id = %id, %user_id, %peer_id, "Direct conversation created");
                    self.announce_created(created).await;
                    drop(guard);
                    id
                }
            };
            self.summary_for(conversation_id, user_id).await
        })
        .await
    }

    pub async fn create_group(
        &self,
        creator_id: Uuid,
        title: &str,
        media_url: Option<String>,
        member_ids: &[Uuid],
    ) -> AppResult<ConversationSummary> {
        timed("create_group", async move {
            let plan = directory::plan_group(creator_id, title, media_url, member_ids)?;
            let guard = self.lock_new(plan.conversation.id).await?;
            let created = match self.store.create_conversation(plan).await? {
                CreateOutcome::Created(created) => created,
                CreateOutcome::Existing(_) => return Err(AppError::Internal),
            };
            let id = created.conversation.id;
            info!(
                conversation_id = %id,
                %creator_id,
                members = created.members.len(),
                "Group conversation created"
            );
            self.announce_created(created).await;
            drop(guard);
            self.summary_for(id, creator_id).await
        })
        .await
    }

    /// Takes the lock of a conversation that is about to be inserted. Held until its
    /// creation is announced, so no append can reach the channel before the members are
    /// subscribed.
    async fn lock_new(&self, conversation_id: Uuid) -> AppResult<ConversationGuard> {
        retry_on_conflict(&self.settings.retry, || {
            self.locks.acquire(conversation_id, self.settings.lock_timeout)
        })
        .await
    }

    /// Subscribes the members and publishes the creation with its first entry.
    /// The caller holds the conversation lock.
    async fn announce_created(&self, created: CreatedConversation) {
        let conversation_id = created.conversation.id;
        self.fanout
            .publish(ChatEvent::ConversationCreated {
                conversation_id,
                is_group: created.conversation.is_group,
                member_ids: created.members.iter().map(|m| m.user_id).collect(),
            })
            .await;
        if let Some(message) = created.system_message {
            self.fanout
                .publish(ChatEvent::MessageAppended {
                    conversation_id,
                    message,
                })
                .await;
        }
    }

    pub async fn update_metadata(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        patch: MetadataPatch,
    ) -> AppResult<ConversationSummary> {
        timed("update_metadata", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let actor = membership::require_member(work.tx().member(actor_id).await?)?;
            membership::check_update_metadata(&actor)?;

            let change = directory::diff_metadata(work.tx().conversation(), &patch)?;
            if change.is_empty() {
                drop(work);
                return self.summary_for(conversation_id, actor_id).await;
            }

            let current = work.tx().conversation().clone();
            let title = change.title.clone().or(current.title);
            let media_url = change.media_url.clone().unwrap_or(current.media_url);
            work.tx().set_metadata(title.clone(), media_url.clone()).await?;
            let message = ledger::append(
                work.tx(),
                NewMessage::system(
                    Some(actor_id),
                    texts::metadata_updated(
                        actor_id,
                        change.title.is_some(),
                        change.media_url.is_some(),
                    ),
                ),
            )
            .await?;

            let guard = work.commit().await?;
            self.fanout
                .publish(ChatEvent::ConversationUpdated {
                    conversation_id,
                    title,
                    media_url,
                    updated_by: actor_id,
                    sequence: message.sequence,
                })
                .await;
            self.publish_appended(message).await;
            drop(guard);

            self.summary_for(conversation_id, actor_id).await
        })
        .await
    }

    pub async fn get_conversation(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<ConversationSummary> {
        timed("get_conversation", async move {
            let conversation = self.require_readable(conversation_id, viewer).await?;
            directory::summarize(self.store.as_ref(), conversation, viewer).await
        })
        .await
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<ConversationSummary>> {
        timed("list_conversations", async move {
            let conversations = self.store.list_for_user(user_id).await?;
            let mut summaries = Vec::with_capacity(conversations.len());
            for conversation in conversations {
                summaries.push(directory::summarize(self.store.as_ref(), conversation, user_id).await?);
            }
            Ok(summaries)
        })
        .await
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        outgoing: OutgoingMessage,
    ) -> AppResult<Message> {
        timed("send_message", async move {
            ledger::validate_text(
                &outgoing.content,
                &outgoing.media,
                self.settings.max_message_length,
            )?;

            let mut work = self.begin(conversation_id).await?;
            membership::require_member(work.tx().member(sender_id).await?)?;
            let message = ledger::append(
                work.tx(),
                NewMessage::text(
                    sender_id,
                    outgoing.content,
                    outgoing.media,
                    outgoing.reply_to_id,
                ),
            )
            .await?;

            let guard = work.commit().await?;
            self.publish_appended(message.clone()).await;
            drop(guard);

            info!(
                %conversation_id,
                %sender_id,
                sequence = message.sequence,
                "Message appended"
            );
            self.moderation.message_created(&message);
            Ok(message)
        })
        .await
    }

    /// Newest first, strictly below `before`.
    pub async fn get_page(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        before: Option<i64>,
        limit: Option<usize>,
    ) -> AppResult<MessagePage> {
        timed("get_page", async move {
            self.require_readable(conversation_id, viewer).await?;
            let limit = ledger::clamp_page_limit(limit);
            let messages = self.store.page(conversation_id, before, limit).await?;
            Ok(MessagePage::new(messages))
        })
        .await
    }

    /// Oldest first, strictly above `after`. Used by catch-up.
    pub async fn messages_after(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        after: i64,
        limit: Option<usize>,
    ) -> AppResult<MessagesAfter> {
        timed("messages_after", async move {
            if after < 0 {
                return Err(AppError::invalid("after must not be negative"));
            }
            let conversation = self.require_readable(conversation_id, viewer).await?;
            let limit = ledger::clamp_after_limit(limit);
            let fetched = self
                .store
                .messages_after(conversation_id, after, limit + 1)
                .await?;
            let window = MessagesAfter::new(conversation_id, fetched, limit, conversation.last_sequence);
            let last_sequence = window
                .highest_sequence()
                .map_or(window.last_sequence, |s| s.max(window.last_sequence));
            Ok(MessagesAfter {
                last_sequence,
                ..window
            })
        })
        .await
    }

    /// Applies a moderation verdict. Repeating the current state is a no-op.
    pub async fn mark_moderated(
        &self,
        message_id: Uuid,
        state: ModerationState,
        reason: Option<String>,
    ) -> AppResult<Message> {
        timed("mark_moderated", async move {
            let existing = self
                .store
                .find_message(message_id)
                .await?
                .ok_or_else(|| AppError::not_found("message"))?;
            let conversation_id = existing.conversation_id;

            let guard = retry_on_conflict(&self.settings.retry, || {
                self.locks.acquire(conversation_id, self.settings.lock_timeout)
            })
            .await?;
            let update = self
                .store
                .set_moderation_state(message_id, state, reason)
                .await?
                .ok_or_else(|| AppError::not_found("message"))?;

            if update.changed {
                info!(
                    %conversation_id,
                    %message_id,
                    state = state.as_str(),
                    "Moderation state changed"
                );
                let view = update.message.clone().redacted();
                self.fanout
                    .publish(ChatEvent::MessageModerated {
                        conversation_id,
                        message_id,
                        sequence: view.sequence,
                        moderation_state: view.moderation_state,
                        message: view,
                    })
                    .await;
            }
            drop(guard);
            Ok(update.message)
        })
        .await
    }

    // ========================================================================
    // Read tracking
    // ========================================================================

    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, upto_sequence: i64) -> AppResult<ReadState> {
        timed("mark_read", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_member(work.tx().member(user_id).await?)?;
            let outcome = read_tracker::mark_read(work.tx(), user_id, upto_sequence).await?;

            match outcome {
                ReadOutcome::Advanced(sequence) => {
                    let guard = work.commit().await?;
                    self.fanout
                        .publish(ChatEvent::ReadAdvanced {
                            conversation_id,
                            user_id,
                            last_read_sequence: sequence,
                        })
                        .await;
                    drop(guard);
                }
                ReadOutcome::Unchanged(_) => drop(work),
            }

            Ok(ReadState {
                conversation_id,
                user_id,
                last_read_sequence: outcome.last_read_sequence(),
                advanced: matches!(outcome, ReadOutcome::Advanced(_)),
            })
        })
        .await
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Returns the members actually added; users already present are skipped.
    pub async fn add_members(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        user_ids: &[Uuid],
    ) -> AppResult<Vec<Member>> {
        timed("add_members", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let actor = membership::require_member(work.tx().member(actor_id).await?)?;
            membership::check_manage_members(&actor)?;

            let existing = work.tx().members().await?;
            let added_ids = membership::new_member_ids(user_ids, &existing, actor_id);
            if added_ids.is_empty() {
                return Err(AppError::invalid("no new members to add"));
            }

            let added: Vec<Member> = added_ids
                .iter()
                .map(|id| Member::new(conversation_id, *id, MemberRole::Member))
                .collect();
            work.tx().insert_members(&added).await?;
            let message = ledger::append(
                work.tx(),
                NewMessage::system(Some(actor_id), texts::added(actor_id, &added_ids)),
            )
            .await?;

            let guard = work.commit().await?;
            self.fanout
                .publish(ChatEvent::MemberAdded {
                    conversation_id,
                    user_ids: added_ids,
                    added_by: actor_id,
                    sequence: message.sequence,
                })
                .await;
            self.publish_appended(message).await;
            drop(guard);

            info!(%conversation_id, %actor_id, added = added.len(), "Members added");
            Ok(added)
        })
        .await
    }

    pub async fn remove_member(&self, conversation_id: Uuid, actor_id: Uuid, target_id: Uuid) -> AppResult<()> {
        timed("remove_member", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let actor = membership::require_member(work.tx().member(actor_id).await?)?;
            if actor_id == target_id {
                return Err(AppError::invalid("use leave to remove yourself"));
            }
            let target = membership::require_target(work.tx().member(target_id).await?)?;
            membership::check_remove(&actor, &target)?;

            let message = ledger::append(
                work.tx(),
                NewMessage::system(Some(actor_id), texts::removed(actor_id, target_id)),
            )
            .await?;
            work.tx().delete_member(target_id).await?;

            let guard = work.commit().await?;
            self.fanout
                .publish(ChatEvent::MemberRemoved {
                    conversation_id,
                    user_id: target_id,
                    removed_by: actor_id,
                    reason: RemovalReason::Removed,
                    sequence: message.sequence,
                })
                .await;
            self.publish_appended(message).await;
            drop(guard);

            info!(%conversation_id, %actor_id, %target_id, "Member removed");
            Ok(())
        })
        .await
    }

    pub async fn update_role(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        target_id: Uuid,
        role: MemberRole,
    ) -> AppResult<Member> {
        timed("update_role", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let actor = membership::require_member(work.tx().member(actor_id).await?)?;
            membership::check_manage_members(&actor)?;
            let mut target = membership::require_target(work.tx().member(target_id).await?)?;
            membership::check_role_change(&actor, &target, role)?;

            work.tx().set_role(target_id, role).await?;
            let message = ledger::append(
                work.tx(),
                NewMessage::system(Some(actor_id), texts::role_changed(target_id, role)),
            )
            .await?;

            let guard = work.commit().await?;
            self.fanout
                .publish(ChatEvent::MemberRoleChanged {
                    conversation_id,
                    user_id: target_id,
                    role,
                    changed_by: actor_id,
                    sequence: message.sequence,
                })
                .await;
            self.publish_appended(message).await;
            drop(guard);

            target.role = role;
            Ok(target)
        })
        .await
    }

    pub async fn leave(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<LeaveOutcome> {
        timed("leave", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let member = membership::require_member(work.tx().member(user_id).await?)?;
            let remaining = work.tx().members().await?.len();

            match membership::check_leave(&member, remaining)? {
                LeavePlan::DeleteConversation => {
                    work.tx().delete_conversation().await?;
                    let guard = work.commit().await?;
                    self.fanout
                        .publish(ChatEvent::ConversationDeleted {
                            conversation_id,
                            deleted_by: user_id,
                        })
                        .await;
                    drop(guard);

                    info!(%conversation_id, %user_id, "Last member left, conversation deleted");
                    Ok(LeaveOutcome::ConversationDeleted)
                }
                LeavePlan::Leave => {
                    let message = ledger::append(
                        work.tx(),
                        NewMessage::system(Some(user_id), texts::left(user_id)),
                    )
                    .await?;
                    work.tx().delete_member(user_id).await?;

                    let guard = work.commit().await?;
                    self.fanout
                        .publish(ChatEvent::MemberRemoved {
                            conversation_id,
                            user_id,
                            removed_by: user_id,
                            reason: RemovalReason::Left,
                            sequence: message.sequence,
                        })
                        .await;
                    self.publish_appended(message).await;
                    drop(guard);

                    info!(%conversation_id, %user_id, "Member left");
                    Ok(LeaveOutcome::Left)
                }
            }
        })
        .await
    }

    /// Owner hands the group to another member and becomes an admin.
    pub async fn transfer_ownership(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        new_owner_id: Uuid,
    ) -> AppResult<()> {
        timed("transfer_ownership", async move {
            let mut work = self.begin(conversation_id).await?;
            membership::require_group(work.tx().conversation())?;
            let actor = membership::require_member(work.tx().member(actor_id).await?)?;
            membership::check_transfer(&actor, new_owner_id)?;
            membership::require_target(work.tx().member(new_owner_id).await?)?;

            // demote first: a conversation never has two owners, even inside the tx
            work.tx().set_role(actor_id, MemberRole::Admin).await?;
            work.tx().set_role(new_owner_id, MemberRole::Owner).await?;
            let message = ledger::append(
                work.tx(),
                NewMessage::system(
                    Some(actor_id),
                    texts::ownership_transferred(actor_id, new_owner_id),
                ),
            )
            .await?;

            let guard = work.commit().await?;
            for (user_id, role) in [(actor_id, MemberRole::Admin), (new_owner_id, MemberRole::Owner)] {
                self.fanout
                    .publish(ChatEvent::MemberRoleChanged {
                        conversation_id,
                        user_id,
                        role,
                        changed_by: actor_id,
                        sequence: message.sequence,
                    })
                    .await;
            }
            self.publish_appended(message).await;
            drop(guard);

            info!(%conversation_id, from = %actor_id, to = %new_owner_id, "Ownership transferred");
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Attaches a session and subscribes it to every conversation the user belongs to.
    ///
    /// The session is attached before listing so conversations created meanwhile still
    /// reach it through `conversation.created`. Each subscription is made under the
    /// conversation's lock so it cannot interleave with a concurrent removal.
    pub async fn connect_session(&self, user_id: Uuid) -> AppResult<(SubscriberId, UnboundedReceiver<Frame>)> {
        let registry = self.fanout.registry();
        let (session_id, rx) = registry.attach_session(user_id).await;

        let conversations = match self.store.list_for_user(user_id).await {
            Ok(conversations) => conversations,
            Err(e) => {
                registry.detach_session(user_id, session_id).await;
                return Err(e);
            }
        };

        for conversation in conversations {
            let conversation_id = conversation.id;
            let guard = retry_on_conflict(&self.settings.retry, || {
                self.locks.acquire(conversation_id, self.settings.lock_timeout)
            })
            .await;
            if let Err(e) = &guard {
                warn!(%conversation_id, %user_id, error = %e, "Subscribing without conversation lock");
            }
            match self.store.get_member(conversation_id, user_id).await {
                Ok(Some(_)) => {
                    registry.subscribe(user_id, conversation_id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%conversation_id, %user_id, error = %e, "Membership check failed during connect");
                }
            }
            drop(guard);
        }

        info!(%user_id, ?session_id, "Session connected");
        Ok((session_id, rx))
    }

    pub async fn disconnect_session(&self, user_id: Uuid, session_id: SubscriberId) {
        self.fanout.registry().detach_session(user_id, session_id).await;
        info!(%user_id, ?session_id, "Session disconnected");
    }

    /// Best-effort typing notice to the other members. Not persisted.
    pub async fn typing(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if !self.fanout.registry().is_subscribed(user_id, conversation_id).await {
            self.require_readable(conversation_id, user_id).await?;
        }
        self.fanout
            .publish(ChatEvent::Typing {
                conversation_id,
                user_id,
            })
            .await;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn begin(&self, conversation_id: Uuid) -> AppResult<UnitOfWork> {
        let wait = self.settings.lock_timeout;
        retry_on_conflict(&self.settings.retry, move || async move {
            let guard = self.locks.acquire(conversation_id, wait).await?;
            let tx = self
                .store
                .lock(conversation_id, wait)
                .await
                .map_err(|e| match e {
                    AppError::Conflict(_) => AppError::Conflict(conversation_id),
                    other => other,
                })?;
            Ok(UnitOfWork { tx, guard })
        })
        .await
    }

    async fn publish_appended(&self, message: Message) {
        self.fanout
            .publish(ChatEvent::MessageAppended {
                conversation_id: message.conversation_id,
                message: message.redacted(),
            })
            .await;
    }

    /// `NotFound` if absent, `Forbidden` if the viewer is not a member.
    async fn require_readable(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<Conversation> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found("conversation"))?;
        membership::require_member(self.store.get_member(conversation_id, viewer).await?)?;
        Ok(conversation)
    }

    async fn summary_for(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<ConversationSummary> {
        let conversation = self.require_readable(conversation_id, viewer).await?;
        directory::summarize(self.store.as_ref(), conversation, viewer).await
    }
}
