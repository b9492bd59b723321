//! PostgreSQL store.
//!
//! Flat row structs with `sqlx::FromRow` plus manual mapping into the shared
//! model types; queries use `query_as` with positional binds.

use crate::{CallLog, CallStatus, Conversation, ConversationKind, Message, Store, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        tracing::info!("Connecting to PostgreSQL…");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    kind: String,
    title: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    body_text: Option<String>,
    attachment_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CallLogRow {
    id: Uuid,
    conversation_id: Uuid,
    initiator_id: Uuid,
    call_type: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<CallLogRow> for CallLog {
    fn from(row: CallLogRow) -> Self {
        CallLog {
            id: row.id,
            conversation_id: row.conversation_id,
            initiator_id: row.initiator_id,
            call_type: row.call_type,
            status: CallStatus::parse(&row.status),
            started_at: row.started_at,
            ended_at: row.ended_at,
            created_at: row.created_at,
        }
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, kind, title FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let members: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM conversation_members WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(Conversation {
            id: row.id,
            kind: ConversationKind::parse(&row.kind),
            title: row.title,
            members: members.into_iter().map(|(id,)| id).collect(),
        }))
    }

    async fn list_member_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT conversation_id FROM conversation_members WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body_text: Option<&str>,
        attachment_id: Option<Uuid>,
    ) -> StoreResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, body_text, attachment_id, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, conversation_id, sender_id, body_text, attachment_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(body_text)
        .bind(attachment_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            body_text: row.body_text,
            attachment_id: row.attachment_id,
            created_at: row.created_at,
        })
    }

    async fn create_call_log(
        &self,
        conversation_id: Uuid,
        initiator_id: Uuid,
        call_type: &str,
    ) -> StoreResult<CallLog> {
        let row = sqlx::query_as::<_, CallLogRow>(
            r#"
            INSERT INTO call_logs (id, conversation_id, initiator_id, call_type, status, created_at)
            VALUES ($1, $2, $3, $4, 'ringing', NOW())
            RETURNING id, conversation_id, initiator_id, call_type, status, started_at, ended_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(initiator_id)
        .bind(call_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn add_call_participant(&self, call_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO call_participants (call_id, user_id, joined_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (call_id, user_id) DO NOTHING
            "#,
        )
        .bind(call_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn start_call(&self, call_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE call_logs SET status = 'active', started_at = NOW() WHERE id = $1 AND started_at IS NULL",
        )
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn end_call(&self, call_id: Uuid) -> StoreResult<Option<CallLog>> {
        let row = sqlx::query_as::<_, CallLogRow>(
            r#"
            UPDATE call_logs SET status = 'ended', ended_at = NOW()
            WHERE id = $1
            RETURNING id, conversation_id, initiator_id, call_type, status, started_at, ended_at, created_at
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn is_call_active(&self, call_id: Uuid) -> StoreResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM call_logs WHERE id = $1")
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some_and(|(status,)| CallStatus::parse(&status).is_active()))
    }

    async fn update_call_status(&self, call_id: Uuid, status: CallStatus) -> StoreResult<()> {
        sqlx::query("UPDATE call_logs SET status = $2 WHERE id = $1")
            .bind(call_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_call_log(&self, call_id: Uuid) -> StoreResult<Option<CallLog>> {
        let row = sqlx::query_as::<_, CallLogRow>(
            r#"
            SELECT id, conversation_id, initiator_id, call_type, status, started_at, ended_at, created_at
            FROM call_logs WHERE id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}
