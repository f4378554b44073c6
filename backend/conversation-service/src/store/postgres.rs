//! Postgres store on deadpool + tokio-postgres.
//!
//! The serialization point is the conversation row: a [`PgTx`] opens a transaction, bounds
//! the wait with `SET LOCAL lock_timeout`, then takes `SELECT ... FOR UPDATE` before anything
//! reads `last_sequence`.

use super::{
    ConversationStore, ConversationTx, CreateOutcome, CreatedConversation, ModerationUpdate,
    NewConversation,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, MediaItem, Member, MemberRole, Message, MessageKind, ModerationState, NewMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use std::time::Duration;
use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, is_group, title, media_url, direct_key, last_sequence, created_at, updated_at";
const MEMBER_COLUMNS: &str = "conversation_id, user_id, role, joined_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence, sender_id, kind, content, media, \
     reply_to_id, created_at, moderation_state";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn conversation_from_row(row: &Row) -> Conversation {
    Conversation {
        id: row.get("id"),
        is_group: row.get("is_group"),
        title: row.get("title"),
        media_url: row.get("media_url"),
        direct_key: row.get("direct_key"),
        last_sequence: row.get("last_sequence"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn member_from_row(row: &Row) -> AppResult<Member> {
    let role: String = row.get("role");
    Ok(Member {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        role: MemberRole::from_db(&role)
            .ok_or_else(|| AppError::Database(format!("invalid role in database: {role}")))?,
        joined_at: row.get("joined_at"),
    })
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let kind: String = row.get("kind");
    let state: String = row.get("moderation_state");
    let media: serde_json::Value = row.get("media");
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sequence: row.get("sequence"),
        sender_id: row.get("sender_id"),
        kind: MessageKind::from_db(&kind)
            .ok_or_else(|| AppError::Database(format!("invalid message kind: {kind}")))?,
        content: row.get("content"),
        media: serde_json::from_value::<Vec<MediaItem>>(media)?,
        reply_to_id: row.get("reply_to_id"),
        created_at: row.get("created_at"),
        moderation_state: ModerationState::from_db(&state)
            .ok_or_else(|| AppError::Database(format!("invalid moderation state: {state}")))?,
    })
}

fn messages_from_rows(rows: &[Row]) -> AppResult<Vec<Message>> {
    rows.iter().map(message_from_row).collect()
}

async fn insert_message<C: GenericClient + Sync>(
    client: &C,
    conversation_id: Uuid,
    sequence: i64,
    created_at: DateTime<Utc>,
    new: NewMessage,
) -> AppResult<Message> {
    let message = Message {
        id: Uuid::new_v4(),
        conversation_id,
        sequence,
        sender_id: new.sender_id,
        kind: new.kind,
        content: new.content,
        media: new.media,
        reply_to_id: new.reply_to_id,
        created_at,
        moderation_state: ModerationState::Visible,
    };
    let media = serde_json::to_value(&message.media)?;

    client
        .execute(
            r#"
            INSERT INTO messages
                (id, conversation_id, sequence, sender_id, kind, content, media, reply_to_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            &[
                &message.id,
                &message.conversation_id,
                &message.sequence,
                &message.sender_id,
                &message.kind.as_str(),
                &message.content,
                &media,
                &message.reply_to_id,
                &message.created_at,
            ],
        )
        .await?;

    Ok(message)
}

async fn upsert_marker<C: GenericClient + Sync>(
    client: &C,
    conversation_id: Uuid,
    user_id: Uuid,
    sequence: i64,
) -> AppResult<()> {
    client
        .execute(
            r#"
            INSERT INTO read_markers (conversation_id, user_id, last_read_sequence, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (conversation_id, user_id)
            DO UPDATE SET last_read_sequence = EXCLUDED.last_read_sequence, updated_at = NOW()
            "#,
            &[&conversation_id, &user_id, &sequence],
        )
        .await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<CreateOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut conversation = new.conversation;
        if new.system_message.is_some() {
            conversation.last_sequence = 1;
        }

        let inserted = tx
            .query_opt(
                r#"
                INSERT INTO conversations
                    (id, is_group, title, media_url, direct_key, last_sequence, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (direct_key) DO NOTHING
                RETURNING id
                "#,
                &[
                    &conversation.id,
                    &conversation.is_group,
                    &conversation.title,
                    &conversation.media_url,
                    &conversation.direct_key,
                    &conversation.last_sequence,
                    &conversation.created_at,
                    &conversation.updated_at,
                ],
            )
            .await?;

        if inserted.is_none() {
            // lost the race to a concurrent creator of the same pair
            tx.rollback().await?;
            let row = client
                .query_one(
                    "SELECT id FROM conversations WHERE direct_key = $1",
                    &[&conversation.direct_key],
                )
                .await?;
            return Ok(CreateOutcome::Existing(row.get("id")));
        }

        for member in &new.members {
            tx.execute(
                r#"
                INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
                VALUES ($1, $2, $3, $4)
                "#,
                &[
                    &member.conversation_id,
                    &member.user_id,
                    &member.role.to_db(),
                    &member.joined_at,
                ],
            )
            .await?;
        }

        let system_message = match new.system_message {
            Some(first) => {
                let message =
                    insert_message(&*tx, conversation.id, 1, conversation.updated_at, first).await?;
                if let Some(sender) = message.sender_id {
                    upsert_marker(&*tx, conversation.id, sender, 1).await?;
                }
                Some(message)
            }
            None => None,
        };

        tx.commit().await?;

        Ok(CreateOutcome::Created(CreatedConversation {
            conversation,
            members: new.members,
            system_message,
        }))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &*format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"),
                &[&conversation_id],
            )
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn get_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Member>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &*format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members \
                     WHERE conversation_id = $1 AND user_id = $2"
                ),
                &[&conversation_id, &user_id],
            )
            .await?;
        row.as_ref().map(member_from_row).transpose()
    }

    async fn list_members(&self, conversation_id: Uuid) -> AppResult<Vec<Member>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members \
                     WHERE conversation_id = $1 ORDER BY joined_at, user_id"
                ),
                &[&conversation_id],
            )
            .await?;
        rows.iter().map(member_from_row).collect()
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT c.id, c.is_group, c.title, c.media_url, c.direct_key, c.last_sequence,
                       c.created_at, c.updated_at
                FROM conversations c
                JOIN conversation_members m ON m.conversation_id = c.id
                WHERE m.user_id = $1
                ORDER BY c.updated_at DESC, c.id DESC
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR sequence < $2) \
                     ORDER BY sequence DESC LIMIT $3"
                ),
                &[&conversation_id, &before, &(limit as i64)],
            )
            .await?;
        messages_from_rows(&rows)
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND sequence > $2 \
                     ORDER BY sequence ASC LIMIT $3"
                ),
                &[&conversation_id, &after, &(limit as i64)],
            )
            .await?;
        messages_from_rows(&rows)
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let mut latest = self.page(conversation_id, None, 1).await?;
        Ok(latest.pop())
    }

    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT last_read_sequence FROM read_markers WHERE conversation_id = $1 AND user_id = $2",
                &[&conversation_id, &user_id],
            )
            .await?;
        Ok(row.map(|r| r.get("last_read_sequence")).unwrap_or(0))
    }

    async fn count_unread(&self, conversation_id: Uuid, user_id: Uuid, after: i64) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS unread FROM messages
                WHERE conversation_id = $1 AND sequence > $2 AND sender_id IS DISTINCT FROM $3
                "#,
                &[&conversation_id, &after, &user_id],
            )
            .await?;
        Ok(row.get("unread"))
    }

    async fn find_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &*format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"),
                &[&message_id],
            )
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn set_moderation_state(
        &self,
        message_id: Uuid,
        state: ModerationState,
        reason: Option<String>,
    ) -> AppResult<Option<ModerationUpdate>> {
        let client = self.pool.get().await?;
        let updated = client
            .query_opt(
                &*format!(
                    "UPDATE messages SET moderation_state = $2, moderation_reason = $3 \
                     WHERE id = $1 AND moderation_state <> $2 \
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&message_id, &state.as_str(), &reason],
            )
            .await?;

        if let Some(row) = updated {
            return Ok(Some(ModerationUpdate {
                message: message_from_row(&row)?,
                changed: true,
            }));
        }

        let current = client
            .query_opt(
                &*format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"),
                &[&message_id],
            )
            .await?;
        current
            .as_ref()
            .map(|row| {
                message_from_row(row).map(|message| ModerationUpdate {
                    message,
                    changed: false,
                })
            })
            .transpose()
    }

    async fn lock(&self, conversation_id: Uuid, wait: Duration) -> AppResult<Box<dyn ConversationTx>> {
        let client = self.pool.get().await?;
        let mut conn = TxConnection {
            client: Some(client),
            open: false,
        };

        let as_conflict = |e: tokio_postgres::Error| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict(conversation_id),
            other => other,
        };

        let client = conn.client()?;
        client.batch_execute("BEGIN").await?;
        conn.open = true;

        let client = conn.client()?;
        client
            .batch_execute(&*format!(
                "SET LOCAL lock_timeout = '{}ms'",
                wait.as_millis().max(1)
            ))
            .await?;
        let row = client
            .query_opt(
                &*format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 FOR UPDATE"),
                &[&conversation_id],
            )
            .await
            .map_err(as_conflict)?;

        let conversation = row
            .as_ref()
            .map(conversation_from_row)
            .ok_or_else(|| AppError::not_found("conversation"))?;

        Ok(Box::new(PgTx { conn, conversation }))
    }
}

/// Pooled connection with an open transaction; rolled back if dropped while open.
struct TxConnection {
    client: Option<Object>,
    open: bool,
}

impl TxConnection {
    fn client(&self) -> AppResult<&Object> {
        self.client.as_ref().ok_or(AppError::Internal)
    }
}

impl Drop for TxConnection {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        tracing::warn!(error = %e, "rollback of abandoned conversation tx failed");
                        // never hand a connection with a dangling tx back to the pool
                        drop(Object::take(client));
                    }
                });
            }
            Err(_) => drop(Object::take(client)),
        }
    }
}

pub struct PgTx {
    conn: TxConnection,
    conversation: Conversation,
}

impl PgTx {
    async fn touch(&mut self) -> AppResult<()> {
        let now = Utc::now();
        self.conn
            .client()?
            .execute(
                "UPDATE conversations SET updated_at = $2 WHERE id = $1",
                &[&self.conversation.id, &now],
            )
            .await?;
        self.conversation.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl ConversationTx for PgTx {
    fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    async fn member(&mut self, user_id: Uuid) -> AppResult<Option<Member>> {
        let row = self
            .conn
            .client()?
            .query_opt(
                &*format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members \
                     WHERE conversation_id = $1 AND user_id = $2"
                ),
                &[&self.conversation.id, &user_id],
            )
            .await?;
        row.as_ref().map(member_from_row).transpose()
    }

    async fn members(&mut self) -> AppResult<Vec<Member>> {
        let rows = self
            .conn
            .client()?
            .query(
                &*format!(
                    "SELECT {MEMBER_COLUMNS} FROM conversation_members \
                     WHERE conversation_id = $1 ORDER BY joined_at, user_id"
                ),
                &[&self.conversation.id],
            )
            .await?;
        rows.iter().map(member_from_row).collect()
    }

    async fn message_exists(&mut self, message_id: Uuid) -> AppResult<bool> {
        let row = self
            .conn
            .client()?
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE id = $1 AND conversation_id = $2) AS found",
                &[&message_id, &self.conversation.id],
            )
            .await?;
        Ok(row.get("found"))
    }

    async fn read_marker(&mut self, user_id: Uuid) -> AppResult<i64> {
        let row = self
            .conn
            .client()?
            .query_opt(
                "SELECT last_read_sequence FROM read_markers WHERE conversation_id = $1 AND user_id = $2",
                &[&self.conversation.id, &user_id],
            )
            .await?;
        Ok(row.map(|r| r.get("last_read_sequence")).unwrap_or(0))
    }

    async fn append(&mut self, message: NewMessage) -> AppResult<Message> {
        let now = Utc::now();
        let client = self.conn.client()?;
        let row = client
            .query_one(
                r#"
                UPDATE conversations
                SET last_sequence = last_sequence + 1, updated_at = $2
                WHERE id = $1
                RETURNING last_sequence
                "#,
                &[&self.conversation.id, &now],
            )
            .await?;
        let sequence: i64 = row.get("last_sequence");
        let pg: &tokio_postgres::Client = client;
        let message = insert_message(pg, self.conversation.id, sequence, now, message).await?;

        self.conversation.last_sequence = sequence;
        self.conversation.updated_at = now;
        Ok(message)
    }

    async fn insert_members(&mut self, members: &[Member]) -> AppResult<()> {
        let client = self.conn.client()?;
        for member in members {
            client
                .execute(
                    r#"
                    INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                    &[
                        &self.conversation.id,
                        &member.user_id,
                        &member.role.to_db(),
                        &member.joined_at,
                    ],
                )
                .await?;
        }
        self.touch().await
    }

    async fn delete_member(&mut self, user_id: Uuid) -> AppResult<()> {
        let client = self.conn.client()?;
        let removed = client
            .execute(
                "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
                &[&self.conversation.id, &user_id],
            )
            .await?;
        if removed == 0 {
            return Err(AppError::not_found("member"));
        }
        client
            .execute(
                "DELETE FROM read_markers WHERE conversation_id = $1 AND user_id = $2",
                &[&self.conversation.id, &user_id],
            )
            .await?;
        self.touch().await
    }

    async fn set_role(&mut self, user_id: Uuid, role: MemberRole) -> AppResult<()> {
        let updated = self
            .conn
            .client()?
            .execute(
                "UPDATE conversation_members SET role = $3 WHERE conversation_id = $1 AND user_id = $2",
                &[&self.conversation.id, &user_id, &role.to_db()],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::not_found("member"));
        }
        self.touch().await
    }

    async fn set_read_marker(&mut self, user_id: Uuid, sequence: i64) -> AppResult<()> {
        let pg: &tokio_postgres::Client = self.conn.client()?;
        upsert_marker(pg, self.conversation.id, user_id, sequence).await
    }

    async fn set_metadata(&mut self, title: Option<String>, media_url: Option<String>) -> AppResult<()> {
        let now = Utc::now();
        self.conn
            .client()?
            .execute(
                "UPDATE conversations SET title = $2, media_url = $3, updated_at = $4 WHERE id = $1",
                &[&self.conversation.id, &title, &media_url, &now],
            )
            .await?;
        self.conversation.title = title;
        self.conversation.media_url = media_url;
        self.conversation.updated_at = now;
        Ok(())
    }

    async fn delete_conversation(&mut self) -> AppResult<()> {
        self.conn
            .client()?
            .execute(
                "DELETE FROM conversations WHERE id = $1",
                &[&self.conversation.id],
            )
            .await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> AppResult<()> {
        self.conn.client()?.batch_execute("COMMIT").await?;
        self.conn.open = false;
        Ok(())
    }
}
