//! Embedded SFU: server-terminated peer connections with RTP forwarding.
//!
//! Every participant of a group call gets one peer connection to the
//! server. Media published on it is relayed to each other participant's
//! connection — no mixing, no transcoding, VP8/Opus only. Signaling rides
//! the bus (`sfu.offer` / `sfu.answer` / `sfu.candidate` on user topics);
//! media bypasses the bus entirely.
//!
//! Lock order: SFU room map → room participants → participant state →
//! subscribers. `remove_participant` detaches under the write locks and
//! closes strictly after releasing them; `Participant::close` re-enters
//! nothing above it.

pub mod forward;
pub mod media;
pub mod participant;
pub mod room;

use crate::CallSettings;
use parley_bus::{topic, Envelope, EventBus};
use parley_common::error::{CallError, CallResult};
use self::participant::Participant;
use self::room::SfuRoom;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::api::API;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

/// Summary handed back to the signaling layer after a join.
pub struct JoinSummary {
    pub room: Arc<SfuRoom>,
    /// Participants that were already in the room.
    pub existing: Vec<ParticipantInfo>,
    /// False when the user was already present (idempotent re-join).
    pub added: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub username: String,
}

/// Result of removing a participant.
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    pub room_id: Uuid,
    pub now_empty: bool,
    pub call_id: Option<Uuid>,
}

pub struct Sfu {
    rooms: RwLock<HashMap<Uuid, Arc<SfuRoom>>>,
    api: API,
    bus: Arc<dyn EventBus>,
    settings: Arc<CallSettings>,
}

impl Sfu {
    pub fn new(bus: Arc<dyn EventBus>, settings: Arc<CallSettings>) -> webrtc::error::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            api: media::build_api()?,
            bus,
            settings,
        }))
    }

    pub async fn get_room(&self, room_id: Uuid) -> Option<Arc<SfuRoom>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    pub async fn get_participant(&self, room_id: Uuid, user_id: Uuid) -> Option<Arc<Participant>> {
        match self.get_room(room_id).await {
            Some(room) => room.get_participant(user_id).await,
            None => None,
        }
    }

    pub async fn active_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Create the participant for `user_id` in `room_id`: peer connection,
    /// receive transceivers, callbacks, subscriptions to every existing
    /// track, join broadcast, and the initial (debounced) offer.
    pub async fn join(
        self: &Arc<Self>,
        room_id: Uuid,
        user_id: Uuid,
        username: &str,
    ) -> CallResult<JoinSummary> {
        // Idempotent re-join: keep the live participant untouched.
        if let Some(room) = self.get_room(room_id).await {
            if room.contains(user_id).await {
                let existing = infos(&room.other_participants(user_id).await);
                return Ok(JoinSummary {
                    room,
                    existing,
                    added: false,
                });
            }
        }

        let config = media::rtc_configuration(&self.settings.ice_servers);
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| CallError::JoinFailed(e.to_string()))?,
        );

        // One receive-only transceiver per media kind so the client can
        // publish without us renegotiating first.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| CallError::JoinFailed(e.to_string()))?;
        }

        let participant = Participant::new(
            user_id,
            username.to_string(),
            room_id,
            Arc::clone(&pc),
            Arc::clone(&self.bus),
            self.settings.answer_timeout,
        );
        self.attach_handlers(&participant);

        // Insert under the map write lock, re-creating the room entry if a
        // concurrent leave emptied and deleted it.
        let (room, existing, lost_race) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id)
                .or_insert_with(|| SfuRoom::new(room_id))
                .clone();
            let mut participants = room.participants.write().await;
            if participants.contains_key(&user_id) {
                let existing: Vec<Arc<Participant>> = participants
                    .values()
                    .filter(|p| p.user_id != user_id)
                    .cloned()
                    .collect();
                (room.clone(), existing, true)
            } else {
                let existing: Vec<Arc<Participant>> = participants.values().cloned().collect();
                participants.insert(user_id, Arc::clone(&participant));
                (room.clone(), existing, false)
            }
        };

        if lost_race {
            let _ = pc.close().await;
            return Ok(JoinSummary {
                room,
                existing: infos(&existing),
                added: false,
            });
        }

        tracing::info!(room = %room_id, user = %user_id, "participant joined SFU room");

        // Subscribe the newcomer to every track already published. The
        // connection is not established yet, so none of these schedule a
        // renegotiation — they ride the initial offer below.
        for publisher in &existing {
            for track in publisher.remote_tracks_snapshot().await {
                participant::link_subscriber(&participant, publisher, &track, false).await;
            }
        }

        for other in &existing {
            let user_topic = topic::user(other.user_id);
            let _ = self
                .bus
                .publish(
                    &user_topic,
                    Envelope::new(
                        user_topic.clone(),
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

        participant.request_renegotiate();

        Ok(JoinSummary {
            room,
            existing: infos(&existing),
            added: true,
        })
    }

    /// Remove the participant, close them outside the room lock, notify the
    /// rest of the room, and delete the room when it empties.
    pub async fn remove_participant(
        self: &Arc<Self>,
        room_id: Uuid,
        user_id: Uuid,
    ) -> Option<RemoveOutcome> {
        let (participant, remaining, now_empty, call_id) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.get(&room_id).cloned()?;
            let mut participants = room.participants.write().await;
            let participant = participants.remove(&user_id)?;
            let now_empty = participants.is_empty();
            let remaining: HashMap<Uuid, Arc<Participant>> = participants
                .iter()
                .map(|(id, p)| (*id, Arc::clone(p)))
                .collect();
            drop(participants);
            if now_empty {
                rooms.remove(&room_id);
            }
            let call_id = *room.call_id.read().await;
            (participant, remaining, now_empty, call_id)
        };

        // Close strictly after the room locks are released.
        participant.close(&remaining).await;

        tracing::info!(room = %room_id, user = %user_id, "participant left SFU room");

        for other in remaining.values() {
            // Drop the relays the leaver was feeding this subscriber.
            other.unlink_publisher(user_id).await;

            let user_topic = topic::user(other.user_id);
            let _ = self
                .bus
                .publish(
                    &user_topic,
                    Envelope::new(
                        user_topic.clone(),
                        "call.participant_left",
                        json!({
                            "room_id": room_id,
                            "user_id": user_id,
                            "username": participant.username,
                        }),
                    ),
                )
                .await;
        }

        if now_empty {
            tracing::info!(room = %room_id, "SFU room empty, deleted");
        }

        Some(RemoveOutcome {
            room_id,
            now_empty,
            call_id,
        })
    }

    /// Evict the user from every room they appear in (socket disconnect).
    pub async fn handle_disconnect(self: &Arc<Self>, user_id: Uuid) -> Vec<RemoveOutcome> {
        let room_ids: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            let mut ids = Vec::new();
            for (id, room) in rooms.iter() {
                if room.contains(user_id).await {
                    ids.push(*id);
                }
            }
            ids
        };

        let mut outcomes = Vec::new();
        for room_id in room_ids {
            if let Some(outcome) = self.remove_participant(room_id, user_id).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Close every connection and drop all rooms.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<SfuRoom>> = {
            let mut map = self.rooms.write().await;
            map.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            for participant in room.all_participants().await {
                participant.cancel.cancel();
                if let Err(e) = participant.pc.close().await {
                    tracing::warn!(user = %participant.user_id, error = %e, "close failed");
                }
            }
        }
    }

    fn attach_handlers(self: &Arc<Self>, participant: &Arc<Participant>) {
        let pc = Arc::clone(&participant.pc);
        let room_id = participant.room_id;
        let user_id = participant.user_id;

        // Inbound media from this participant.
        let sfu = Arc::clone(self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sfu = Arc::clone(&sfu);
            Box::pin(async move {
                sfu.handle_track(room_id, user_id, track).await;
            })
        }));

        // Locally gathered ICE candidates trickle to the client once our
        // description is out.
        let candidate_target = Arc::clone(participant);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let participant = Arc::clone(&candidate_target);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => participant.on_local_candidate(init).await,
                    Err(e) => tracing::warn!(error = %e, "candidate encode failed"),
                }
            })
        }));

        let sfu = Arc::clone(self);
        let state_target = Arc::clone(participant);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sfu = Arc::clone(&sfu);
            let participant = Arc::clone(&state_target);
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        participant.set_connected(true).await;
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        participant.set_connected(false).await;
                        // Only evict if this connection is still the one the
                        // room knows about; a replaced or already-removed
                        // participant must not take the live one down.
                        let current = sfu
                            .get_participant(participant.room_id, participant.user_id)
                            .await;
                        if current.is_some_and(|c| Arc::ptr_eq(&c, &participant)) {
                            sfu.remove_participant(participant.room_id, participant.user_id)
                                .await;
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    /// A participant started publishing a track: record it, start its
    /// forwarder, and subscribe everyone else (each with a renegotiation,
    /// since their connections are already established).
    async fn handle_track(self: &Arc<Self>, room_id: Uuid, user_id: Uuid, track: Arc<TrackRemote>) {
        let Some(room) = self.get_room(room_id).await else {
            return;
        };
        let Some(publisher) = room.get_participant(user_id).await else {
            return;
        };

        tracing::info!(
            room = %room_id,
            user = %user_id,
            track = %track.id(),
            mime = %track.codec().capability.mime_type,
            "remote track published"
        );

        publisher.register_remote_track(Arc::clone(&track)).await;
        forward::spawn_forwarder(Arc::clone(&track), Arc::clone(&publisher));

        for subscriber in room.other_participants(user_id).await {
            participant::link_subscriber(&subscriber, &publisher, &track, true).await;
        }
    }
}

fn infos(participants: &[Arc<Participant>]) -> Vec<ParticipantInfo> {
    participants
        .iter()
        .map(|p| ParticipantInfo {
            user_id: p.user_id,
            username: p.username.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_bus::memory::MemoryBus;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    fn uid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    fn settings() -> Arc<CallSettings> {
        Arc::new(CallSettings {
            ice_servers: vec![],
            answer_timeout: Duration::from_millis(400),
            sfu_enabled: true,
        })
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

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<Envelope>,
        event: &str,
    ) -> Envelope {
        loop {
            let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("bus subscription dropped");
            if env.event == event {
                return env;
            }
        }
    }

    /// A fake client peer: accepts the server offer, produces an answer.
    async fn answer_server_offer(offer_sdp: &str) -> String {
        let api = media::build_api().unwrap();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        let offer = RTCSessionDescription::offer(offer_sdp.to_string()).unwrap();
        pc.set_remote_description(offer).await.unwrap();
        let answer = pc.create_answer(None).await.unwrap();
        pc.set_local_description(answer.clone()).await.unwrap();
        answer.sdp
    }

    #[tokio::test]
    async fn join_creates_room_and_emits_initial_offer() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut rx = watch_user(&bus, uid(1)).await;

        let summary = sfu.join(uid(100), uid(1), "alice").await.unwrap();
        assert!(summary.added);
        assert!(summary.existing.is_empty());
        assert_eq!(sfu.active_room_count().await, 1);

        let offer = next_event(&mut rx, "sfu.offer").await;
        assert_eq!(offer.payload["room_id"], uid(100).to_string());
        assert!(offer.payload["sdp"].as_str().unwrap().starts_with("v=0"));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();

        let first = sfu.join(uid(100), uid(1), "alice").await.unwrap();
        assert!(first.added);
        let second = sfu.join(uid(100), uid(1), "alice").await.unwrap();
        assert!(!second.added);
        assert_eq!(
            sfu.get_room(uid(100)).await.unwrap().participant_count().await,
            1
        );
    }

    #[tokio::test]
    async fn second_join_notifies_first_and_leave_empties_room() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut alice_rx = watch_user(&bus, uid(1)).await;

        sfu.join(uid(100), uid(1), "alice").await.unwrap();
        sfu.join(uid(100), uid(2), "bob").await.unwrap();

        let joined = next_event(&mut alice_rx, "call.participant_joined").await;
        assert_eq!(joined.payload["username"], "bob");

        let outcome = sfu.remove_participant(uid(100), uid(2)).await.unwrap();
        assert!(!outcome.now_empty);
        let left = next_event(&mut alice_rx, "call.participant_left").await;
        assert_eq!(left.payload["user_id"], uid(2).to_string());

        let outcome = sfu.remove_participant(uid(100), uid(1)).await.unwrap();
        assert!(outcome.now_empty);
        assert_eq!(sfu.active_room_count().await, 0);
    }

    #[tokio::test]
    async fn double_remove_is_safe() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        sfu.join(uid(100), uid(1), "alice").await.unwrap();

        assert!(sfu.remove_participant(uid(100), uid(1)).await.is_some());
        assert!(sfu.remove_participant(uid(100), uid(1)).await.is_none());
    }

    #[tokio::test]
    async fn offer_answer_handshake_succeeds_with_declared_codecs() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut rx = watch_user(&bus, uid(1)).await;

        sfu.join(uid(100), uid(1), "alice").await.unwrap();
        let participant = sfu.get_participant(uid(100), uid(1)).await.unwrap();

        let offer = next_event(&mut rx, "sfu.offer").await;
        let answer = answer_server_offer(offer.payload["sdp"].as_str().unwrap()).await;
        participant.handle_answer(answer).await.unwrap();

        let state = participant.state.lock().await;
        assert!(!state.negotiating);
        assert!(state.remote_desc_set);
    }

    #[tokio::test]
    async fn renegotiation_requests_coalesce() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut rx = watch_user(&bus, uid(1)).await;

        sfu.join(uid(100), uid(1), "alice").await.unwrap();
        let participant = sfu.get_participant(uid(100), uid(1)).await.unwrap();

        // Settle the initial cycle.
        let offer = next_event(&mut rx, "sfu.offer").await;
        let answer = answer_server_offer(offer.payload["sdp"].as_str().unwrap()).await;
        participant.handle_answer(answer).await.unwrap();

        // Three rapid requests inside the debounce window → one offer, no
        // pending follow-up: they are all covered by the batched offer.
        participant.request_renegotiate();
        participant.request_renegotiate();
        participant.request_renegotiate();

        let offer = next_event(&mut rx, "sfu.offer").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut extra_offers = 0;
        while let Ok(env) = rx.try_recv() {
            if env.event == "sfu.offer" {
                extra_offers += 1;
            }
        }
        assert_eq!(extra_offers, 0, "debounce must batch requests into one offer");
        assert!(
            !participant.state.lock().await.negotiation_pending,
            "requests inside the debounce ride the same offer"
        );

        // While the answer is outstanding, further requests set pending.
        participant.request_renegotiate();
        participant.request_renegotiate();
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = participant.state.lock().await;
            assert!(state.negotiating);
            assert!(state.negotiation_pending);
        }

        // Answer arrives → exactly one follow-up cycle fires.
        let answer = answer_server_offer(offer.payload["sdp"].as_str().unwrap()).await;
        participant.handle_answer(answer).await.unwrap();
        let _follow_up = next_event(&mut rx, "sfu.offer").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut extra_offers = 0;
        while let Ok(env) = rx.try_recv() {
            if env.event == "sfu.offer" {
                extra_offers += 1;
            }
        }
        assert_eq!(extra_offers, 0, "pending requests must coalesce into one cycle");
    }

    #[tokio::test]
    async fn answer_timeout_frees_the_negotiation_slot() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut rx = watch_user(&bus, uid(1)).await;

        sfu.join(uid(100), uid(1), "alice").await.unwrap();
        let participant = sfu.get_participant(uid(100), uid(1)).await.unwrap();
        let _ignored_offer = next_event(&mut rx, "sfu.offer").await;

        // Never answer; the 400 ms test timeout must clear the slot.
        tokio::time::sleep(Duration::from_millis(700)).await;
        {
            let state = participant.state.lock().await;
            assert!(!state.negotiating, "timeout must clear the negotiating flag");
        }

        // The machinery still works afterwards.
        participant.request_renegotiate();
        let offer = next_event(&mut rx, "sfu.offer").await;
        assert!(offer.payload["sdp"].as_str().unwrap().starts_with("v=0"));
    }

    #[tokio::test]
    async fn remote_candidates_buffer_until_remote_description() {
        let bus = MemoryBus::new();
        let sfu = Sfu::new(bus.clone(), settings()).unwrap();
        let mut rx = watch_user(&bus, uid(1)).await;

        sfu.join(uid(100), uid(1), "alice").await.unwrap();
        let participant = sfu.get_participant(uid(100), uid(1)).await.unwrap();

        for n in 0..3 {
            participant
                .add_remote_candidate(RTCIceCandidateInit {
                    candidate: format!(
                        "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                        50000 + n
                    ),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                })
                .await
                .unwrap();
        }
        {
            let state = participant.state.lock().await;
            assert_eq!(state.pending_remote_candidates.len(), 3);
        }

        let offer = next_event(&mut rx, "sfu.offer").await;
        let answer = answer_server_offer(offer.payload["sdp"].as_str().unwrap()).await;
        participant.handle_answer(answer).await.unwrap();

        let state = participant.state.lock().await;
        assert!(
            state.pending_remote_candidates.is_empty(),
            "buffered candidates must drain once the remote description is set"
        );
    }
}
