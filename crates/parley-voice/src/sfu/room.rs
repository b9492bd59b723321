//! An SFU room: the participant set for one group call.

use super::participant::Participant;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct SfuRoom {
    pub room_id: Uuid,
    pub(crate) call_id: RwLock<Option<Uuid>>,
    pub(crate) participants: RwLock<HashMap<Uuid, Arc<Participant>>>,
}

impl SfuRoom {
    pub(crate) fn new(room_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            room_id,
            call_id: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
        })
    }

    pub async fn set_call_id(&self, call_id: Uuid) {
        *self.call_id.write().await = Some(call_id);
    }

    pub async fn get_call_id(&self) -> Option<Uuid> {
        *self.call_id.read().await
    }

    pub async fn get_participant(&self, user_id: Uuid) -> Option<Arc<Participant>> {
        self.participants.read().await.get(&user_id).cloned()
    }

    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.participants.read().await.contains_key(&user_id)
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Everyone except `excluding`.
    pub async fn other_participants(&self, excluding: Uuid) -> Vec<Arc<Participant>> {
        self.participants
            .read()
            .await
            .values()
            .filter(|p| p.user_id != excluding)
            .cloned()
            .collect()
    }

    pub async fn all_participants(&self) -> Vec<Arc<Participant>> {
        self.participants.read().await.values().cloned().collect()
    }
}
