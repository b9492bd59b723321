//! # parley-store
//!
//! The repository contract the real-time core consumes, plus its two
//! implementations: PostgreSQL for production and an in-memory store for
//! tests and standalone runs. The core never assumes a particular storage
//! technology — everything goes through the [`Store`] trait.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation: the scope of rooms, messages, and calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub members: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => Self::Group,
            _ => Self::Direct,
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body_text: Option<String>,
    pub attachment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle record of one call, used for history and status reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub initiator_id: Uuid,
    /// "audio" or "video"
    pub call_type: String,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CallLog {
    /// Seconds between start and end, when both are known.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Declined,
    Cancelled,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
            Self::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "ended" => Self::Ended,
            "declined" => Self::Declined,
            "cancelled" => Self::Cancelled,
            "missed" => Self::Missed,
            _ => Self::Ringing,
        }
    }

    /// A call still ringing or in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ringing | Self::Active)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository interface consumed by the hub and the call handlers.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // === Conversations ===
    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>>;

    /// IDs of every conversation the user belongs to (presence fan-out).
    async fn list_member_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;

    // === Messages ===
    async fn create_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body_text: Option<&str>,
        attachment_id: Option<Uuid>,
    ) -> StoreResult<Message>;

    // === Call logs ===
    async fn create_call_log(
        &self,
        conversation_id: Uuid,
        initiator_id: Uuid,
        call_type: &str,
    ) -> StoreResult<CallLog>;

    async fn add_call_participant(&self, call_id: Uuid, user_id: Uuid) -> StoreResult<()>;

    /// Transition the log to `active` and stamp `started_at`.
    async fn start_call(&self, call_id: Uuid) -> StoreResult<()>;

    /// Transition the log to `ended`, stamp `ended_at`, and return the
    /// final record (for duration reporting). `None` if the log is unknown.
    async fn end_call(&self, call_id: Uuid) -> StoreResult<Option<CallLog>>;

    async fn is_call_active(&self, call_id: Uuid) -> StoreResult<bool>;

    async fn update_call_status(&self, call_id: Uuid, status: CallStatus) -> StoreResult<()>;

    async fn get_call_log(&self, call_id: Uuid) -> StoreResult<Option<CallLog>>;
}
