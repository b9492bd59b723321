//! In-memory store.
//!
//! Backs tests and standalone runs where no database is configured. State
//! is plain maps behind one async RwLock; conversations are seeded through
//! [`MemoryStore::add_conversation`].

use crate::{
    CallLog, CallStatus, Conversation, ConversationKind, Message, Store, StoreResult,
};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<Message>,
    call_logs: HashMap<Uuid, CallLog>,
    call_participants: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation (tests, standalone mode).
    pub async fn add_conversation(&self, conversation: Conversation) {
        self.inner
            .write()
            .await
            .conversations
            .insert(conversation.id, conversation);
    }

    /// Shorthand for seeding a direct conversation between two users.
    pub async fn add_direct(&self, id: Uuid, a: Uuid, b: Uuid) {
        self.add_conversation(Conversation {
            id,
            kind: ConversationKind::Direct,
            title: None,
            members: vec![a, b],
        })
        .await;
    }

    /// Shorthand for seeding a group conversation.
    pub async fn add_group(&self, id: Uuid, members: Vec<Uuid>) {
        self.add_conversation(Conversation {
            id,
            kind: ConversationKind::Group,
            title: None,
            members,
        })
        .await;
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .get(&conversation_id)
            .is_some_and(|c| c.members.contains(&user_id)))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(&conversation_id).cloned())
    }

    async fn list_member_conversations(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.members.contains(&user_id))
            .map(|c| c.id)
            .collect())
    }

    async fn create_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body_text: Option<&str>,
        attachment_id: Option<Uuid>,
    ) -> StoreResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body_text: body_text.map(str::to_string),
            attachment_id,
            created_at: Utc::now(),
        };
        self.inner.write().await.messages.push(message.clone());
        Ok(message)
    }

    async fn create_call_log(
        &self,
        conversation_id: Uuid,
        initiator_id: Uuid,
        call_type: &str,
    ) -> StoreResult<CallLog> {
        let log = CallLog {
            id: Uuid::new_v4(),
            conversation_id,
            initiator_id,
            call_type: call_type.to_string(),
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        inner.call_logs.insert(log.id, log.clone());
        inner
            .call_participants
            .insert(log.id, vec![initiator_id]);
        Ok(log)
    }

    async fn add_call_participant(&self, call_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let participants = inner.call_participants.entry(call_id).or_default();
        if !participants.contains(&user_id) {
            participants.push(user_id);
        }
        Ok(())
    }

    async fn start_call(&self, call_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(log) = inner.call_logs.get_mut(&call_id) {
            if log.started_at.is_none() {
                log.started_at = Some(Utc::now());
                log.status = CallStatus::Active;
            }
        }
        Ok(())
    }

    async fn end_call(&self, call_id: Uuid) -> StoreResult<Option<CallLog>> {
        let mut inner = self.inner.write().await;
        if let Some(log) = inner.call_logs.get_mut(&call_id) {
            log.status = CallStatus::Ended;
            log.ended_at = Some(Utc::now());
            return Ok(Some(log.clone()));
        }
        Ok(None)
    }

    async fn is_call_active(&self, call_id: Uuid) -> StoreResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .call_logs
            .get(&call_id)
            .is_some_and(|log| log.status.is_active()))
    }

    async fn update_call_status(&self, call_id: Uuid, status: CallStatus) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(log) = inner.call_logs.get_mut(&call_id) {
            log.status = status;
        }
        Ok(())
    }

    async fn get_call_log(&self, call_id: Uuid) -> StoreResult<Option<CallLog>> {
        Ok(self.inner.read().await.call_logs.get(&call_id).cloned())
    }
}
