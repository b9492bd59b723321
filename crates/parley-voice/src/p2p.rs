//! P2P call rooms — membership tracking for calls whose media flows
//! peer-to-peer. The server only relays signaling; a room here is just the
//! participant set plus an optional call-log handle.
//!
//! Locking: the room map and each room's participant map are separate
//! locks. Mutations take the map write lock first and then the room's
//! participant lock, so a room observed empty is removed in the same
//! critical section that removed its last participant.

use chrono::{DateTime, Utc};
use parley_bus::{topic, Envelope, EventBus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A participant of a P2P call room.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallParticipant {
    pub user_id: Uuid,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// One P2P call, scoped to a conversation (`room_id == conversation_id`).
pub struct CallRoom {
    pub room_id: Uuid,
    call_id: RwLock<Option<Uuid>>,
    participants: RwLock<HashMap<Uuid, CallParticipant>>,
}

impl CallRoom {
    fn new(room_id: Uuid) -> Self {
        Self {
            room_id,
            call_id: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_call_id(&self, call_id: Uuid) {
        *self.call_id.write().await = Some(call_id);
    }

    pub async fn get_call_id(&self) -> Option<Uuid> {
        *self.call_id.read().await
    }

    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.participants.read().await.contains_key(&user_id)
    }

    pub async fn get_participants(&self) -> Vec<CallParticipant> {
        self.participants.read().await.values().cloned().collect()
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }
}

/// Outcome of a leave/disconnect on one room.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room_id: Uuid,
    pub removed: bool,
    pub now_empty: bool,
    pub call_id: Option<Uuid>,
}

/// Tracks every active P2P call room.
pub struct P2pRoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<CallRoom>>>,
    bus: Arc<dyn EventBus>,
}

impl P2pRoomManager {
    pub fn new(bus: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            bus,
        })
    }

    /// Add `user_id` to the room, creating it if absent. Idempotent: a
    /// repeated join neither duplicates the participant nor re-notifies.
    ///
    /// Returns the room, the participants that were already present, and
    /// whether this join actually added the user.
    pub async fn join_call(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        username: &str,
    ) -> (Arc<CallRoom>, Vec<CallParticipant>, bool) {
        let (room, existing, added) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id)
                .or_insert_with(|| Arc::new(CallRoom::new(room_id)))
                .clone();

            let mut participants = room.participants.write().await;
            let existing: Vec<CallParticipant> = participants
                .values()
                .filter(|p| p.user_id != user_id)
                .cloned()
                .collect();
            let added = if participants.contains_key(&user_id) {
                false
            } else {
                participants.insert(
                    user_id,
                    CallParticipant {
                        user_id,
                        username: username.to_string(),
                        joined_at: Utc::now(),
                    },
                );
                true
            };
            drop(participants);
            (room, existing, added)
        };

        if added {
            tracing::info!(room = %room_id, user = %user_id, "User joined call room");
            for other in &existing {
                let _ = self
                    .bus
                    .publish(
                        &topic::user(other.user_id),
                        Envelope::new(
                            topic::user(other.user_id),
                            "call.participant_joined",
                            json!({
                                "room_id": room_id,
                                "user_id": user_id,
                                "username": username,
                            }),
                        ),
                    )
                    .await;
            }
        }

        (room, existing, added)
    }

    /// Remove `user_id` from the room. No-op when the room is missing; the
    /// room is deleted in the same critical section when it empties.
    pub async fn leave_call(&self, room_id: Uuid, user_id: Uuid, username: &str) -> LeaveOutcome {
        let (outcome, remaining) = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get(&room_id).cloned() else {
                return LeaveOutcome {
                    room_id,
                    removed: false,
                    now_empty: false,
                    call_id: None,
                };
            };

            let mut participants = room.participants.write().await;
            let removed = participants.remove(&user_id).is_some();
            let now_empty = participants.is_empty();
            let remaining: Vec<CallParticipant> = participants.values().cloned().collect();
            drop(participants);

            if now_empty {
                rooms.remove(&room_id);
            }
            let call_id = *room.call_id.read().await;
            (
                LeaveOutcome {
                    room_id,
                    removed,
                    now_empty,
                    call_id,
                },
                remaining,
            )
        };

        if outcome.removed {
            tracing::info!(room = %room_id, user = %user_id, "User left call room");
            for other in &remaining {
                let _ = self
                    .bus
                    .publish(
                        &topic::user(other.user_id),
                        Envelope::new(
                            topic::user(other.user_id),
                            "call.participant_left",
                            json!({
                                "room_id": room_id,
                                "user_id": user_id,
                                "username": username,
                            }),
                        ),
                    )
                    .await;
            }
        }

        outcome
    }

    pub async fn get_room(&self, room_id: Uuid) -> Option<Arc<CallRoom>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    pub async fn get_active_rooms(&self) -> Vec<Arc<CallRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Drop a room wholesale (call migrated to the SFU). Participants are
    /// not notified here; the caller owns the migration broadcast.
    pub async fn take_room(&self, room_id: Uuid) -> Option<Arc<CallRoom>> {
        self.rooms.write().await.remove(&room_id)
    }

    /// Remove the user from every room they appear in (socket disconnect).
    pub async fn handle_disconnect(&self, user_id: Uuid, username: &str) -> Vec<LeaveOutcome> {
        let room_ids: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            let mut ids = Vec::new();
            for (id, room) in rooms.iter() {
                if room.participants.read().await.contains_key(&user_id) {
                    ids.push(*id);
                }
            }
            ids
        };

        let mut outcomes = Vec::new();
        for room_id in room_ids {
            let outcome = self.leave_call(room_id, user_id, username).await;
            if outcome.removed {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_bus::memory::MemoryBus;
    use tokio::sync::mpsc;

    fn uid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    async fn watch_user(
        bus: &Arc<MemoryBus>,
        user: Uuid,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            &topic::user(user),
            parley_bus::handler(move |env| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(env);
                }
            }),
        )
        .await
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());

        let (_, existing, added) = mgr.join_call(uid(1), uid(10), "alice").await;
        assert!(added);
        assert!(existing.is_empty());

        let (room, existing, added) = mgr.join_call(uid(1), uid(10), "alice").await;
        assert!(!added);
        assert!(existing.is_empty());
        assert_eq!(room.participant_count().await, 1);
    }

    #[tokio::test]
    async fn second_join_notifies_only_preexisting() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());
        let mut alice_rx = watch_user(&bus, uid(10)).await;

        mgr.join_call(uid(1), uid(10), "alice").await;
        mgr.join_call(uid(1), uid(11), "bob").await;

        let env = alice_rx.recv().await.unwrap();
        assert_eq!(env.event, "call.participant_joined");
        assert_eq!(env.payload["username"], "bob");

        // A duplicate join by bob must not re-notify alice.
        mgr.join_call(uid(1), uid(11), "bob").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_then_leave_restores_initial_state() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());

        mgr.join_call(uid(1), uid(10), "alice").await;
        let outcome = mgr.leave_call(uid(1), uid(10), "alice").await;

        assert!(outcome.removed);
        assert!(outcome.now_empty);
        assert!(mgr.get_room(uid(1)).await.is_none());
        assert!(mgr.get_active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn leave_missing_room_is_noop() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());
        let outcome = mgr.leave_call(uid(9), uid(10), "alice").await;
        assert!(!outcome.removed);
        assert!(!outcome.now_empty);
    }

    #[tokio::test]
    async fn leave_notifies_remaining() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());
        let mut alice_rx = watch_user(&bus, uid(10)).await;

        mgr.join_call(uid(1), uid(10), "alice").await;
        mgr.join_call(uid(1), uid(11), "bob").await;
        // drain the join notification
        let _ = alice_rx.recv().await.unwrap();

        mgr.leave_call(uid(1), uid(11), "bob").await;
        let env = alice_rx.recv().await.unwrap();
        assert_eq!(env.event, "call.participant_left");
        assert_eq!(env.payload["user_id"], uid(11).to_string());
    }

    #[tokio::test]
    async fn disconnect_cascades_over_all_rooms() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());

        mgr.join_call(uid(1), uid(10), "alice").await;
        mgr.join_call(uid(1), uid(11), "bob").await;
        mgr.join_call(uid(2), uid(10), "alice").await;

        let outcomes = mgr.handle_disconnect(uid(10), "alice").await;
        assert_eq!(outcomes.len(), 2);

        // Room 1 still has bob; room 2 is gone.
        assert_eq!(
            mgr.get_room(uid(1)).await.unwrap().participant_count().await,
            1
        );
        assert!(mgr.get_room(uid(2)).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_settle() {
        let bus = MemoryBus::new();
        let mgr = P2pRoomManager::new(bus.clone());

        let mut handles = Vec::new();
        for n in 0..16u8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                mgr.join_call(uid(1), uid(100 + n), "user").await;
                mgr.leave_call(uid(1), uid(100 + n), "user").await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Every joiner left again, so the room must be gone.
        assert!(mgr.get_room(uid(1)).await.is_none());
    }
}
