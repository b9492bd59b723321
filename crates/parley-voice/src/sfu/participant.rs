//! One SFU participant: a server-terminated peer connection plus the track
//! graph and negotiation state hanging off it.
//!
//! Locking: `state` covers the track maps, negotiation flags, and candidate
//! buffers; `subscribers` has its own lock so the forwarding hot path never
//! contends with negotiation. Lock order is participant state before the
//! peer's `subscribers`, and never two participants' `state` at once.

use super::forward;
use parley_bus::{topic, Envelope, EventBus};
use parley_common::error::{CallError, CallResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Debounce window before a renegotiation offer goes out, so several track
/// additions land in one offer.
pub(crate) const RENEGOTIATE_DEBOUNCE: Duration = Duration::from_millis(50);

/// Key for a relayed track: `senderID:trackID`. Two senders may reuse the
/// same track id; the prefix keeps their relays apart.
pub(crate) fn composite_key(sender_id: Uuid, track_id: &str) -> String {
    format!("{sender_id}:{track_id}")
}

/// A local relay track on a subscriber's connection plus the RTP sender it
/// was added with (needed to remove it again).
pub(crate) struct LocalRelay {
    pub track: Arc<TrackLocalStaticRTP>,
    pub sender: Arc<RTCRtpSender>,
}

#[derive(Default)]
pub(crate) struct ParticipantState {
    /// Inbound media this user publishes, by track id.
    pub remote_tracks: HashMap<String, Arc<TrackRemote>>,
    /// Outbound relays this user receives from others, by composite key.
    pub local_tracks: HashMap<String, LocalRelay>,
    /// Reverse map: composite key → publishing user. Used only at teardown.
    pub subscriptions: HashMap<String, Uuid>,
    pub negotiating: bool,
    /// Set once the offer has actually been created; before that, incoming
    /// requests are covered by the offer the debounce is about to build.
    pub offer_in_flight: bool,
    pub negotiation_pending: bool,
    pub answer_timer: Option<JoinHandle<()>>,
    pub pending_local_candidates: Vec<RTCIceCandidateInit>,
    pub pending_remote_candidates: Vec<RTCIceCandidateInit>,
    pub local_desc_set: bool,
    pub remote_desc_set: bool,
    pub connected: bool,
}

pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    pub room_id: Uuid,
    pub pc: Arc<RTCPeerConnection>,
    /// Lives as long as the participant, not any single request; every
    /// forwarding and RTCP task selects on it.
    pub cancel: CancellationToken,
    pub(crate) state: Mutex<ParticipantState>,
    /// track id → relay tracks on *other* participants carrying that track.
    pub(crate) subscribers: RwLock<HashMap<String, Vec<Arc<TrackLocalStaticRTP>>>>,
    bus: Arc<dyn EventBus>,
    answer_timeout: Duration,
}

impl Participant {
    pub(crate) fn new(
        user_id: Uuid,
        username: String,
        room_id: Uuid,
        pc: Arc<RTCPeerConnection>,
        bus: Arc<dyn EventBus>,
        answer_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            username,
            room_id,
            pc,
            cancel: CancellationToken::new(),
            state: Mutex::new(ParticipantState::default()),
            subscribers: RwLock::new(HashMap::new()),
            bus,
            answer_timeout,
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub(crate) async fn set_connected(&self, connected: bool) {
        self.state.lock().await.connected = connected;
    }

    pub(crate) async fn register_remote_track(&self, track: Arc<TrackRemote>) {
        self.state
            .lock()
            .await
            .remote_tracks
            .insert(track.id(), track);
    }

    pub(crate) async fn remote_tracks_snapshot(&self) -> Vec<Arc<TrackRemote>> {
        self.state.lock().await.remote_tracks.values().cloned().collect()
    }

    /// Current relays of one of this user's tracks (forwarding hot path).
    pub(crate) async fn snapshot_subscribers(&self, track_id: &str) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.subscribers
            .read()
            .await
            .get(track_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn add_subscriber(&self, track_id: &str, relay: Arc<TrackLocalStaticRTP>) {
        self.subscribers
            .write()
            .await
            .entry(track_id.to_string())
            .or_default()
            .push(relay);
    }

    pub(crate) async fn remove_subscriber(&self, track_id: &str, relay: &Arc<TrackLocalStaticRTP>) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(relays) = subscribers.get_mut(track_id) {
            relays.retain(|t| !Arc::ptr_eq(t, relay));
            if relays.is_empty() {
                subscribers.remove(track_id);
            }
        }
    }

    /// Send a PLI to this participant's encoder for the given SSRC.
    pub(crate) async fn send_pli(&self, media_ssrc: u32) {
        if let Err(e) = self
            .pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
        {
            tracing::debug!(user = %self.user_id, error = %e, "PLI write failed");
        }
    }

    // === Renegotiation queue ===

    /// Ask for a renegotiation cycle. Requests landing inside the debounce
    /// window ride the offer it is about to build; requests while an answer
    /// is outstanding coalesce into a single pending follow-up.
    pub fn request_renegotiate(self: &Arc<Self>) {
        let participant = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut state = participant.state.lock().await;
                if state.negotiating {
                    if state.offer_in_flight {
                        state.negotiation_pending = true;
                    }
                    return;
                }
                state.negotiating = true;
            }
            participant.run_negotiation_cycle().await;
        });
    }

    async fn run_negotiation_cycle(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(RENEGOTIATE_DEBOUNCE) => {}
        }

        // From here on, new requests must queue a follow-up: the offer we
        // are about to create will not cover them.
        self.state.lock().await.offer_in_flight = true;

        let offer = match self.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(user = %self.user_id, error = %e, "create_offer failed");
                self.abort_negotiation().await;
                return;
            }
        };
        if let Err(e) = self.pc.set_local_description(offer.clone()).await {
            tracing::warn!(user = %self.user_id, error = %e, "set_local_description failed");
            self.abort_negotiation().await;
            return;
        }

        let buffered = {
            let mut state = self.state.lock().await;
            state.local_desc_set = true;
            std::mem::take(&mut state.pending_local_candidates)
        };

        self.emit(
            "sfu.offer",
            json!({ "room_id": self.room_id, "sdp": offer.sdp }),
        )
        .await;
        for candidate in buffered {
            self.emit_candidate(candidate).await;
        }

        // Arm the answer timeout: a silent client must not wedge the slot.
        let participant = Arc::clone(&self);
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = participant.cancel.cancelled() => return,
                _ = tokio::time::sleep(participant.answer_timeout) => {}
            }
            let relaunch = {
                let mut state = participant.state.lock().await;
                if !state.negotiating {
                    return;
                }
                tracing::warn!(
                    user = %participant.user_id,
                    room = %participant.room_id,
                    "renegotiation answer timed out"
                );
                state.negotiating = false;
                state.offer_in_flight = false;
                std::mem::take(&mut state.negotiation_pending)
            };
            if relaunch {
                participant.request_renegotiate();
            }
        });
        self.state.lock().await.answer_timer = Some(timer);
    }

    async fn abort_negotiation(&self) {
        let mut state = self.state.lock().await;
        state.negotiating = false;
        state.offer_in_flight = false;
        state.negotiation_pending = false;
    }

    /// Client answered a server-initiated offer.
    pub async fn handle_answer(self: &Arc<Self>, sdp: String) -> CallResult<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| CallError::AnswerFailed(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| CallError::AnswerFailed(e.to_string()))?;

        let (timer, buffered, relaunch) = {
            let mut state = self.state.lock().await;
            state.remote_desc_set = true;
            state.negotiating = false;
            state.offer_in_flight = false;
            (
                state.answer_timer.take(),
                std::mem::take(&mut state.pending_remote_candidates),
                std::mem::take(&mut state.negotiation_pending),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        for candidate in buffered {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(user = %self.user_id, error = %e, "buffered candidate rejected");
            }
        }
        if relaunch {
            self.request_renegotiate();
        }
        Ok(())
    }

    /// Client-initiated renegotiation: apply the offer, answer it.
    pub async fn handle_client_offer(self: &Arc<Self>, sdp: String) -> CallResult<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| CallError::OfferFailed(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| CallError::OfferFailed(e.to_string()))?;

        let buffered = {
            let mut state = self.state.lock().await;
            state.remote_desc_set = true;
            std::mem::take(&mut state.pending_remote_candidates)
        };
        for candidate in buffered {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(user = %self.user_id, error = %e, "buffered candidate rejected");
            }
        }

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::AnswerFailed(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::AnswerFailed(e.to_string()))?;

        let flushed = {
            let mut state = self.state.lock().await;
            state.local_desc_set = true;
            std::mem::take(&mut state.pending_local_candidates)
        };
        for candidate in flushed {
            self.emit_candidate(candidate).await;
        }

        Ok(answer.sdp)
    }

    // === ICE candidate buffering ===

    /// Remote candidate from the client; buffered until a remote
    /// description exists, then applied in arrival order.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> CallResult<()> {
        {
            let mut state = self.state.lock().await;
            if !state.remote_desc_set {
                state.pending_remote_candidates.push(candidate);
                return Ok(());
            }
        }
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::CandidateFailed(e.to_string()))
    }

    /// Locally gathered candidate; buffered until our description has been
    /// published, then trickled to the client.
    pub(crate) async fn on_local_candidate(&self, candidate: RTCIceCandidateInit) {
        {
            let mut state = self.state.lock().await;
            if !state.local_desc_set {
                state.pending_local_candidates.push(candidate);
                return;
            }
        }
        self.emit_candidate(candidate).await;
    }

    // === Teardown ===

    /// Detach every relay this participant holds from its publisher, stop
    /// all tasks, and close the connection. `publishers` is a snapshot of
    /// the room taken by the caller — the room lock itself must already be
    /// released when this runs.
    pub(crate) async fn close(&self, publishers: &HashMap<Uuid, Arc<Participant>>) {
        self.cancel.cancel();

        let (subscriptions, local_tracks) = {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.answer_timer.take() {
                timer.abort();
            }
            state.negotiating = false;
            state.offer_in_flight = false;
            state.negotiation_pending = false;
            (
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.local_tracks),
            )
        };

        for (composite, publisher_id) in subscriptions {
            let Some(publisher) = publishers.get(&publisher_id) else {
                continue;
            };
            let prefix = format!("{publisher_id}:");
            let track_id = composite.strip_prefix(&prefix).unwrap_or(&composite);
            if let Some(relay) = local_tracks.get(&composite) {
                publisher.remove_subscriber(track_id, &relay.track).await;
            }
        }

        self.subscribers.write().await.clear();

        if let Err(e) = self.pc.close().await {
            tracing::warn!(user = %self.user_id, error = %e, "error closing peer connection");
        }
    }

    /// Drop every relay fed by `publisher_id` (the publisher left) and
    /// renegotiate so the client removes the dead m-lines.
    pub(crate) async fn unlink_publisher(self: &Arc<Self>, publisher_id: Uuid) {
        let prefix = format!("{publisher_id}:");
        let removed: Vec<LocalRelay> = {
            let mut state = self.state.lock().await;
            let keys: Vec<String> = state
                .local_tracks
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &keys {
                state.subscriptions.remove(key);
            }
            keys.into_iter()
                .filter_map(|k| state.local_tracks.remove(&k))
                .collect()
        };
        if removed.is_empty() {
            return;
        }
        for relay in &removed {
            if let Err(e) = self.pc.remove_track(&relay.sender).await {
                tracing::debug!(user = %self.user_id, error = %e, "remove_track failed");
            }
        }
        if self.is_connected().await {
            self.request_renegotiate();
        }
    }

    // === Bus helpers ===

    pub(crate) async fn emit(&self, event: &str, payload: Value) {
        let user_topic = topic::user(self.user_id);
        if let Err(e) = self
            .bus
            .publish(&user_topic, Envelope::new(user_topic.clone(), event, payload))
            .await
        {
            tracing::warn!(user = %self.user_id, error = %e, "bus publish failed");
        }
    }

    async fn emit_candidate(&self, candidate: RTCIceCandidateInit) {
        match serde_json::to_value(&candidate) {
            Ok(value) => {
                self.emit(
                    "sfu.candidate",
                    json!({ "room_id": self.room_id, "candidate": value }),
                )
                .await;
            }
            Err(e) => tracing::warn!(user = %self.user_id, error = %e, "candidate encode failed"),
        }
    }
}

/// Wire `subscriber` to one of `publisher`'s remote tracks: create the relay
/// track, attach it, start the RTCP reader, register both sides of the
/// graph, and ask the publisher for a keyframe so the first I-frame arrives
/// within one RTT instead of one GOP.
pub(crate) async fn link_subscriber(
    subscriber: &Arc<Participant>,
    publisher: &Arc<Participant>,
    track: &Arc<TrackRemote>,
    renegotiate: bool,
) {
    let track_id = track.id();
    let composite = composite_key(publisher.user_id, &track_id);

    let mut state = subscriber.state.lock().await;
    if state.local_tracks.contains_key(&composite) {
        return;
    }

    let relay = Arc::new(TrackLocalStaticRTP::new(
        track.codec().capability.clone(),
        track_id.clone(),
        track.stream_id(),
    ));

    let rtp_sender = match subscriber
        .pc
        .add_track(Arc::clone(&relay) as Arc<dyn TrackLocal + Send + Sync>)
        .await
    {
        Ok(sender) => sender,
        Err(e) => {
            tracing::warn!(
                subscriber = %subscriber.user_id,
                publisher = %publisher.user_id,
                error = %e,
                "failed to attach relay track"
            );
            return;
        }
    };

    forward::spawn_rtcp_listener(
        Arc::clone(&rtp_sender),
        subscriber.cancel.clone(),
        Arc::clone(&publisher.pc),
        track.ssrc(),
    );

    state.local_tracks.insert(
        composite.clone(),
        LocalRelay {
            track: Arc::clone(&relay),
            sender: rtp_sender,
        },
    );
    state.subscriptions.insert(composite, publisher.user_id);
    drop(state);

    publisher.add_subscriber(&track_id, Arc::clone(&relay)).await;
    publisher.send_pli(track.ssrc()).await;

    tracing::debug!(
        subscriber = %subscriber.user_id,
        publisher = %publisher.user_id,
        track = %track_id,
        "subscriber linked to track"
    );

    if renegotiate && subscriber.is_connected().await {
        subscriber.request_renegotiate();
    }
}
