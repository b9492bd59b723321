//! Group-call signaling: routes `sfu.*` events into the SFU and decides,
//! per join, whether a call runs peer-to-peer or through the SFU.
//!
//! Two-member direct conversations stay P2P; group conversations (or any
//! conversation with more than two members) go through the SFU. When a join
//! upgrades a live P2P call, every existing participant gets
//! `call.migration` and the P2P room is dissolved before the SFU join
//! proceeds — the call log carries over.

use crate::call::CallHandler;
use crate::p2p::P2pRoomManager;
use crate::sfu::{ParticipantInfo, Sfu};
use crate::CallSettings;
use parley_bus::{topic, Envelope, EventBus};
use parley_common::error::{CallError, CallResult};
use parley_common::event::{CallEvent, SfuEvent, TrackInfo};
use parley_store::{ConversationKind, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

pub struct GroupCallHandler {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    sfu: Arc<Sfu>,
    p2p: Arc<P2pRoomManager>,
    calls: Arc<CallHandler>,
    settings: Arc<CallSettings>,
}

impl GroupCallHandler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        sfu: Arc<Sfu>,
        p2p: Arc<P2pRoomManager>,
        calls: Arc<CallHandler>,
        settings: Arc<CallSettings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            sfu,
            p2p,
            calls,
            settings,
        })
    }

    pub async fn handle(&self, user_id: Uuid, username: &str, event: SfuEvent) -> CallResult<()> {
        match event {
            SfuEvent::Join { room_id } => self.join(user_id, username, &room_id).await,
            SfuEvent::Leave { room_id } => self.leave(user_id, &room_id).await,
            SfuEvent::Offer { room_id, sdp } => self.offer(user_id, &room_id, sdp).await,
            SfuEvent::Answer { room_id, sdp } => self.answer(user_id, &room_id, sdp).await,
            SfuEvent::Candidate { room_id, candidate } => {
                self.candidate(user_id, &room_id, candidate).await
            }
            SfuEvent::Tracks { room_id, tracks } => {
                self.tracks(user_id, &room_id, tracks).await
            }
            SfuEvent::MuteUpdate {
                room_id,
                kind,
                muted,
            } => self.mute_update(user_id, &room_id, &kind, muted).await,
        }
    }

    async fn join(&self, user_id: Uuid, username: &str, room_id: &str) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let is_member = self
            .store
            .is_member(room_uuid, user_id)
            .await
            .map_err(|e| CallError::JoinFailed(e.to_string()))?;
        if !is_member {
            return Err(CallError::NotMember);
        }
        let conversation = self
            .store
            .get_conversation(room_uuid)
            .await
            .map_err(|e| CallError::JoinFailed(e.to_string()))?
            .ok_or_else(|| CallError::InvalidRoom(room_id.to_string()))?;

        let use_sfu = self.settings.sfu_enabled
            && (conversation.kind == ConversationKind::Group || conversation.members.len() > 2);
        if !use_sfu {
            // Small direct call: plain P2P signaling.
            return self
                .calls
                .handle(
                    user_id,
                    username,
                    CallEvent::Join {
                        room_id: room_id.to_string(),
                        call_type: None,
                    },
                )
                .await;
        }

        // A live P2P call on this conversation migrates to the SFU.
        let mut migrated_call_id = None;
        if let Some(p2p_room) = self.p2p.get_room(room_uuid).await {
            let participants = p2p_room.get_participants().await;
            if !participants.is_empty() {
                migrated_call_id = p2p_room.get_call_id().await;
                for participant in &participants {
                    self.emit_to(
                        participant.user_id,
                        "call.migration",
                        json!({ "room_id": room_uuid, "reason": "participant_limit" }),
                    )
                    .await;
                }
                self.p2p.take_room(room_uuid).await;
                tracing::info!(room = %room_uuid, "P2P call migrating to SFU");
            }
        }

        let summary = self.sfu.join(room_uuid, user_id, username).await?;
        if let Some(call_id) = migrated_call_id {
            summary.room.set_call_id(call_id).await;
        }

        // Call-log bookkeeping mirrors the P2P handler; failures here are
        // logged and never block the call.
        let mut call_id = summary.room.get_call_id().await;
        if let Some(id) = call_id {
            if !self.store.is_call_active(id).await.unwrap_or(false) {
                call_id = None;
            }
        }
        match call_id {
            None => match self.store.create_call_log(room_uuid, user_id, "video").await {
                Ok(log) => {
                    summary.room.set_call_id(log.id).await;
                    call_id = Some(log.id);
                    self.calls
                        .ring_conversation(room_uuid, user_id, username, "video", log.id)
                        .await;
                }
                Err(e) => {
                    tracing::error!(room = %room_uuid, error = %e, "call log creation failed");
                }
            },
            Some(id) if summary.added => {
                if let Err(e) = self.store.add_call_participant(id, user_id).await {
                    tracing::warn!(call = %id, error = %e, "recording call participant failed");
                }
                if summary.existing.len() == 1 {
                    if let Err(e) = self.store.start_call(id).await {
                        tracing::warn!(call = %id, error = %e, "marking call started failed");
                    }
                }
            }
            Some(_) => {}
        }

        let mut participants: Vec<ParticipantInfo> = summary.existing.clone();
        participants.push(ParticipantInfo {
            user_id,
            username: username.to_string(),
        });
        self.emit_to(
            user_id,
            "call.config",
            json!({
                "room_id": room_uuid,
                "call_id": call_id,
                "ice_servers": self.settings.ice_servers,
                "participants": participants,
                "is_initiator": summary.existing.is_empty(),
                "mode": "sfu",
            }),
        )
        .await;
        Ok(())
    }

    async fn leave(&self, user_id: Uuid, room_id: &str) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        // Leaving a room you are not in is a no-op, not an error.
        let Some(outcome) = self.sfu.remove_participant(room_uuid, user_id).await else {
            return Ok(());
        };
        if outcome.now_empty {
            if let Some(call_id) = outcome.call_id {
                if let Err(e) = self.store.end_call(call_id).await {
                    tracing::warn!(call = %call_id, error = %e, "marking call ended failed");
                }
            }
        }
        Ok(())
    }

    /// Client-initiated renegotiation (it added or removed tracks).
    async fn offer(&self, user_id: Uuid, room_id: &str, sdp: String) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let participant = self
            .sfu
            .get_participant(room_uuid, user_id)
            .await
            .ok_or(CallError::NotInCall)?;
        let answer_sdp = participant.handle_client_offer(sdp).await?;
        self.emit_to(
            user_id,
            "sfu.answer.server",
            json!({ "room_id": room_uuid, "sdp": answer_sdp }),
        )
        .await;
        Ok(())
    }

    /// Completes a server-initiated renegotiation.
    async fn answer(&self, user_id: Uuid, room_id: &str, sdp: String) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let participant = self
            .sfu
            .get_participant(room_uuid, user_id)
            .await
            .ok_or(CallError::NotInCall)?;
        participant.handle_answer(sdp).await
    }

    async fn candidate(&self, user_id: Uuid, room_id: &str, candidate: Value) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let participant = self
            .sfu
            .get_participant(room_uuid, user_id)
            .await
            .ok_or(CallError::NotInCall)?;
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| CallError::CandidateFailed(e.to_string()))?;
        participant.add_remote_candidate(init).await
    }

    /// Track metadata fan-out so receivers can label incoming streams.
    async fn tracks(&self, user_id: Uuid, room_id: &str, tracks: Vec<TrackInfo>) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let room = self
            .sfu
            .get_room(room_uuid)
            .await
            .ok_or(CallError::RoomNotFound)?;
        if !room.contains(user_id).await {
            return Err(CallError::NotInCall);
        }
        for other in room.other_participants(user_id).await {
            self.emit_to(
                other.user_id,
                "sfu.tracks",
                json!({ "room_id": room_uuid, "user_id": user_id, "tracks": tracks }),
            )
            .await;
        }
        Ok(())
    }

    /// Relay to every other participant, never back to the sender.
    async fn mute_update(
        &self,
        user_id: Uuid,
        room_id: &str,
        kind: &str,
        muted: bool,
    ) -> CallResult<()> {
        let room_uuid = parse_room(room_id)?;
        let room = self
            .sfu
            .get_room(room_uuid)
            .await
            .ok_or(CallError::RoomNotFound)?;
        if !room.contains(user_id).await {
            return Err(CallError::NotInCall);
        }
        for other in room.other_participants(user_id).await {
            self.emit_to(
                other.user_id,
                "sfu.mute_update",
                json!({
                    "room_id": room_uuid,
                    "user_id": user_id,
                    "kind": kind,
                    "muted": muted,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Socket gone: evict from every SFU room, closing emptied call logs.
    pub async fn handle_disconnect(&self, user_id: Uuid) {
        for outcome in self.sfu.handle_disconnect(user_id).await {
            if outcome.now_empty {
                if let Some(call_id) = outcome.call_id {
                    if let Err(e) = self.store.end_call(call_id).await {
                        tracing::warn!(call = %call_id, error = %e, "marking call ended failed");
                    }
                }
            }
        }
    }

    async fn emit_to(&self, user_id: Uuid, event: &str, payload: Value) {
        let user_topic = topic::user(user_id);
        if let Err(e) = self
            .bus
            .publish(&user_topic, Envelope::new(user_topic.clone(), event, payload))
            .await
        {
            tracing::warn!(user = %user_id, error = %e, "bus publish failed");
        }
    }
}

fn parse_room(s: &str) -> CallResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| CallError::InvalidRoom(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_bus::memory::MemoryBus;
    use parley_store::memory::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn uid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        p2p: Arc<P2pRoomManager>,
        sfu: Arc<Sfu>,
        calls: Arc<CallHandler>,
        group: Arc<GroupCallHandler>,
    }

    async fn fixture() -> Fixture {
        let bus = MemoryBus::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let settings = Arc::new(CallSettings {
            ice_servers: vec![],
            answer_timeout: Duration::from_secs(15),
            sfu_enabled: true,
        });
        let p2p = P2pRoomManager::new(bus.clone());
        let sfu = Sfu::new(bus.clone(), settings.clone()).unwrap();
        let calls = CallHandler::new(store.clone(), bus.clone(), p2p.clone(), settings.clone());
        let group = GroupCallHandler::new(
            store.clone(),
            bus.clone(),
            sfu.clone(),
            p2p.clone(),
            calls.clone(),
            settings,
        );
        Fixture {
            bus,
            store,
            p2p,
            sfu,
            calls,
            group,
        }
    }

    async fn watch_user(bus: &Arc<MemoryBus>, user: Uuid) -> mpsc::UnboundedReceiver<Envelope> {
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

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Envelope>, event: &str) -> Envelope {
        loop {
            let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("subscription dropped");
            if env.event == event {
                return env;
            }
        }
    }

    #[tokio::test]
    async fn two_member_direct_conversation_stays_p2p() {
        let f = fixture().await;
        f.store.add_direct(uid(1), uid(10), uid(11)).await;
        let mut alice_rx = watch_user(&f.bus, uid(10)).await;

        f.group
            .handle(uid(10), "alice", SfuEvent::Join { room_id: uid(1).to_string() })
            .await
            .unwrap();

        let config = next_event(&mut alice_rx, "call.config").await;
        assert!(config.payload.get("mode").is_none());
        assert!(f.p2p.get_room(uid(1)).await.is_some());
        assert!(f.sfu.get_room(uid(1)).await.is_none());
    }

    #[tokio::test]
    async fn group_conversation_uses_the_sfu() {
        let f = fixture().await;
        f.store.add_group(uid(1), vec![uid(10), uid(11), uid(12)]).await;
        let mut alice_rx = watch_user(&f.bus, uid(10)).await;

        f.group
            .handle(uid(10), "alice", SfuEvent::Join { room_id: uid(1).to_string() })
            .await
            .unwrap();

        let config = next_event(&mut alice_rx, "call.config").await;
        assert_eq!(config.payload["mode"], "sfu");
        assert_eq!(config.payload["is_initiator"], true);
        assert!(f.sfu.get_room(uid(1)).await.is_some());
        assert!(f.p2p.get_room(uid(1)).await.is_none());

        // The SFU's initial offer follows on the same topic.
        let offer = next_event(&mut alice_rx, "sfu.offer").await;
        assert!(offer.payload["sdp"].as_str().unwrap().starts_with("v=0"));
    }

    #[tokio::test]
    async fn third_join_migrates_a_live_p2p_call() {
        let f = fixture().await;
        f.store.add_group(uid(1), vec![uid(10), uid(11), uid(12)]).await;
        let mut alice_rx = watch_user(&f.bus, uid(10)).await;
        let mut bob_rx = watch_user(&f.bus, uid(11)).await;

        // A and B started P2P (explicit call.join).
        f.calls
            .handle(
                uid(10),
                "alice",
                CallEvent::Join { room_id: uid(1).to_string(), call_type: None },
            )
            .await
            .unwrap();
        f.calls
            .handle(
                uid(11),
                "bob",
                CallEvent::Join { room_id: uid(1).to_string(), call_type: None },
            )
            .await
            .unwrap();
        let p2p_call_id = f.p2p.get_room(uid(1)).await.unwrap().get_call_id().await;

        // C joins via the SFU path → migration.
        f.group
            .handle(uid(12), "carol", SfuEvent::Join { room_id: uid(1).to_string() })
            .await
            .unwrap();

        let migration = next_event(&mut alice_rx, "call.migration").await;
        assert_eq!(migration.payload["room_id"], uid(1).to_string());
        let migration = next_event(&mut bob_rx, "call.migration").await;
        assert_eq!(migration.payload["reason"], "participant_limit");

        assert!(f.p2p.get_room(uid(1)).await.is_none());
        let sfu_room = f.sfu.get_room(uid(1)).await.unwrap();
        assert!(sfu_room.contains(uid(12)).await);
        // The call log carried over.
        assert_eq!(sfu_room.get_call_id().await, p2p_call_id);
    }

    #[tokio::test]
    async fn sfu_mute_update_reaches_others_only() {
        let f = fixture().await;
        f.store.add_group(uid(1), vec![uid(10), uid(11), uid(12)]).await;
        let mut alice_rx = watch_user(&f.bus, uid(10)).await;
        let mut bob_rx = watch_user(&f.bus, uid(11)).await;

        for (user, name) in [(uid(10), "alice"), (uid(11), "bob")] {
            f.group
                .handle(user, name, SfuEvent::Join { room_id: uid(1).to_string() })
                .await
                .unwrap();
        }

        f.group
            .handle(
                uid(10),
                "alice",
                SfuEvent::MuteUpdate {
                    room_id: uid(1).to_string(),
                    kind: "video".into(),
                    muted: true,
                },
            )
            .await
            .unwrap();

        let update = next_event(&mut bob_rx, "sfu.mute_update").await;
        assert_eq!(update.payload["user_id"], uid(10).to_string());

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(env) = alice_rx.try_recv() {
            assert_ne!(env.event, "sfu.mute_update", "sender must not see own mute");
        }
    }

    #[tokio::test]
    async fn last_sfu_leave_ends_the_call_log() {
        let f = fixture().await;
        f.store.add_group(uid(1), vec![uid(10), uid(11), uid(12)]).await;
        let mut alice_rx = watch_user(&f.bus, uid(10)).await;

        f.group
            .handle(uid(10), "alice", SfuEvent::Join { room_id: uid(1).to_string() })
            .await
            .unwrap();
        let config = next_event(&mut alice_rx, "call.config").await;
        let call_id: Uuid = config.payload["call_id"].as_str().unwrap().parse().unwrap();

        f.group
            .handle(uid(10), "alice", SfuEvent::Leave { room_id: uid(1).to_string() })
            .await
            .unwrap();

        assert!(f.sfu.get_room(uid(1)).await.is_none());
        let log = f.store.get_call_log(call_id).await.unwrap().unwrap();
        assert_eq!(log.status, parley_store::CallStatus::Ended);
    }

    #[tokio::test]
    async fn signaling_without_membership_fails() {
        let f = fixture().await;
        f.store.add_group(uid(1), vec![uid(10), uid(11), uid(12)]).await;

        let err = f
            .group
            .handle(uid(99), "mallory", SfuEvent::Join { room_id: uid(1).to_string() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_member");

        let err = f
            .group
            .handle(
                uid(10),
                "alice",
                SfuEvent::Offer { room_id: uid(1).to_string(), sdp: "v=0".into() },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_in_call");
    }
}
