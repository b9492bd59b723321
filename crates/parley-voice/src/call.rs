//! P2P call signaling.
//!
//! Validates `call.*` events against the repository and the room state,
//! relays SDP/ICE between participants, and keeps the call log in step with
//! the room lifecycle (`ringing` on first join, `active` on second, `ended`
//! when the room empties; `declined`/`cancelled` as explicit terminals).
//!
//! The handler never touches sockets: replies and relays are envelopes on
//! user/room topics, and failures come back as [`CallError`] for the hub to
//! report to the originating connection. Repository failures during
//! bookkeeping are logged and do not take the call down.

use crate::p2p::P2pRoomManager;
use crate::CallSettings;
use parley_bus::{topic, Envelope, EventBus};
use parley_common::error::{CallError, CallResult};
use parley_common::event::CallEvent;
use parley_store::{CallStatus, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct CallHandler {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    rooms: Arc<P2pRoomManager>,
    settings: Arc<CallSettings>,
}

impl CallHandler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        rooms: Arc<P2pRoomManager>,
        settings: Arc<CallSettings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            rooms,
            settings,
        })
    }

    /// Dispatch one validated `call.*` event from `user_id`.
    pub async fn handle(&self, user_id: Uuid, username: &str, event: CallEvent) -> CallResult<()> {
        match event {
            CallEvent::Join { room_id, call_type } => {
                self.join(user_id, username, &room_id, call_type).await
            }
            CallEvent::Leave { room_id } => self.leave(user_id, username, &room_id).await,
            CallEvent::Offer {
                room_id,
                target_id,
                sdp,
            } => {
                self.relay(
                    user_id,
                    username,
                    &room_id,
                    &target_id,
                    "call.offer",
                    json!({ "sdp": sdp }),
                )
                .await
            }
            CallEvent::Answer {
                room_id,
                target_id,
                sdp,
            } => {
                self.relay(
                    user_id,
                    username,
                    &room_id,
                    &target_id,
                    "call.answer",
                    json!({ "sdp": sdp }),
                )
                .await
            }
            CallEvent::IceCandidate {
                room_id,
                target_id,
                candidate,
            } => {
                self.relay(
                    user_id,
                    username,
                    &room_id,
                    &target_id,
                    "call.ice_candidate",
                    json!({ "candidate": candidate }),
                )
                .await
            }
            CallEvent::Declined { call_id } => {
                self.terminate(user_id, &call_id, CallStatus::Declined).await
            }
            CallEvent::Cancelled { call_id } => {
                self.terminate(user_id, &call_id, CallStatus::Cancelled).await
            }
            CallEvent::Ended { call_id } => self.ended(user_id, &call_id).await,
            CallEvent::Ready { room_id } => self.ready(user_id, &room_id).await,
            CallEvent::MuteUpdate {
                room_id,
                kind,
                muted,
            } => self.mute_update(user_id, &room_id, &kind, muted).await,
        }
    }

    async fn join(
        &self,
        user_id: Uuid,
        username: &str,
        room_id: &str,
        call_type: Option<String>,
    ) -> CallResult<()> {
        let room_id = parse_room(room_id)?;
        let is_member = self
            .store
            .is_member(room_id, user_id)
            .await
            .map_err(|e| CallError::JoinFailed(e.to_string()))?;
        if !is_member {
            return Err(CallError::NotMember);
        }

        let call_type = call_type.unwrap_or_else(|| "audio".to_string());
        let (room, existing, added) = self.rooms.join_call(room_id, user_id, username).await;
        let is_initiator = existing.is_empty();

        // Reconcile against the repository: a room that outlived its call
        // log is a fresh call.
        let mut call_id = room.get_call_id().await;
        if let Some(id) = call_id {
            if !self.store.is_call_active(id).await.unwrap_or(false) {
                call_id = None;
            }
        }

        match call_id {
            None => match self.store.create_call_log(room_id, user_id, &call_type).await {
                Ok(log) => {
                    room.set_call_id(log.id).await;
                    call_id = Some(log.id);
                    self.ring_conversation(room_id, user_id, username, &call_type, log.id)
                        .await;
                }
                Err(e) => {
                    tracing::error!(room = %room_id, error = %e, "call log creation failed");
                }
            },
            Some(id) if added => {
                if let Err(e) = self.store.add_call_participant(id, user_id).await {
                    tracing::warn!(call = %id, error = %e, "recording call participant failed");
                }
                // The second participant answers the ring.
                if existing.len() == 1 {
                    if let Err(e) = self.store.start_call(id).await {
                        tracing::warn!(call = %id, error = %e, "marking call started failed");
                    }
                }
            }
            Some(_) => {}
        }

        let participants = room.get_participants().await;
        self.emit_to(
            user_id,
            "call.config",
            json!({
                "room_id": room_id,
                "call_id": call_id,
                "ice_servers": self.settings.ice_servers,
                "participants": participants,
                "is_initiator": is_initiator,
            }),
        )
        .await;
        Ok(())
    }

    /// Ring every other conversation member on their user topic.
    pub(crate) async fn ring_conversation(
        &self,
        room_id: Uuid,
        caller_id: Uuid,
        caller_name: &str,
        call_type: &str,
        call_id: Uuid,
    ) {
        let conversation = match self.store.get_conversation(room_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(room = %room_id, error = %e, "conversation lookup failed");
                return;
            }
        };
        let is_group = conversation.kind == parley_store::ConversationKind::Group;
        for member in conversation.members {
            if member == caller_id {
                continue;
            }
            self.emit_to(
                member,
                "call.incoming",
                json!({
                    "call_id": call_id,
                    "conversation_id": room_id,
                    "caller_id": caller_id,
                    "caller_name": caller_name,
                    "call_type": call_type,
                    "is_group": is_group,
                }),
            )
            .await;
        }
    }

    async fn leave(&self, user_id: Uuid, username: &str, room_id: &str) -> CallResult<()> {
        let room_id = parse_room(room_id)?;
        let outcome = self.rooms.leave_call(room_id, user_id, username).await;
        if outcome.now_empty {
            if let Some(call_id) = outcome.call_id {
                if let Err(e) = self.store.end_call(call_id).await {
                    tracing::warn!(call = %call_id, error = %e, "marking call ended failed");
                }
            }
        }
        Ok(())
    }

    /// Relay an SDP or ICE fragment to one participant, preserving the
    /// originator's identity. Self-targeting is rejected outright.
    async fn relay(
        &self,
        user_id: Uuid,
        username: &str,
        room_id: &str,
        target_id: &str,
        event: &str,
        extra: Value,
    ) -> CallResult<()> {
        let room_id = parse_room(room_id)?;
        let target_id = parse_target(target_id)?;
        if target_id == user_id {
            return Err(CallError::InvalidTarget("cannot target yourself".into()));
        }

        let room = self
            .rooms
            .get_room(room_id)
            .await
            .ok_or(CallError::RoomNotFound)?;
        if !room.contains(user_id).await {
            return Err(CallError::NotInCall);
        }
        if !room.contains(target_id).await {
            return Err(CallError::TargetNotFound);
        }

        let mut payload = json!({
            "room_id": room_id,
            "from_id": user_id,
            "from_name": username,
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut payload, extra) {
            map.extend(extra);
        }
        self.emit_to(target_id, event, payload).await;
        Ok(())
    }

    /// `declined` / `cancelled`: record the terminal status and notify the
    /// parties that care (the initiator, or everyone else respectively).
    async fn terminate(&self, user_id: Uuid, call_id: &str, status: CallStatus) -> CallResult<()> {
        let call_id = parse_call_id(call_id)?;
        let log = match self.store.get_call_log(call_id).await {
            Ok(Some(log)) => log,
            Ok(None) => return Err(CallError::NoCall),
            Err(e) => {
                tracing::error!(call = %call_id, error = %e, "call log lookup failed");
                return Err(CallError::NoCall);
            }
        };

        if let Err(e) = self.store.update_call_status(call_id, status).await {
            tracing::warn!(call = %call_id, error = %e, "call status update failed");
        }

        match status {
            CallStatus::Declined => {
                self.emit_to(
                    log.initiator_id,
                    "call.declined",
                    json!({ "call_id": call_id, "user_id": user_id }),
                )
                .await;
            }
            _ => {
                // Cancellation reaches everyone who was being rung.
                if let Ok(Some(conversation)) =
                    self.store.get_conversation(log.conversation_id).await
                {
                    for member in conversation.members {
                        if member == user_id {
                            continue;
                        }
                        self.emit_to(member, "call.cancelled", json!({ "call_id": call_id }))
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Everyone in the conversation learns the call is over, the ender
    /// included (it doubles as the confirmation).
    async fn ended(&self, _user_id: Uuid, call_id: &str) -> CallResult<()> {
        let call_id = parse_call_id(call_id)?;
        let log = match self.store.end_call(call_id).await {
            Ok(Some(log)) => log,
            Ok(None) => return Err(CallError::NoCall),
            Err(e) => {
                tracing::error!(call = %call_id, error = %e, "marking call ended failed");
                return Err(CallError::NoCall);
            }
        };

        if let Ok(Some(conversation)) = self.store.get_conversation(log.conversation_id).await {
            for member in conversation.members {
                self.emit_to(
                    member,
                    "call.ended",
                    json!({
                        "call_id": call_id,
                        "duration_seconds": log.duration_seconds(),
                    }),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn ready(&self, user_id: Uuid, room_id: &str) -> CallResult<()> {
        let room_id = parse_room(room_id)?;
        let room = self
            .rooms
            .get_room(room_id)
            .await
            .ok_or(CallError::RoomNotFound)?;
        if !room.contains(user_id).await {
            return Err(CallError::NotInCall);
        }

        let room_topic = topic::room(room_id);
        let _ = self
            .bus
            .publish(
                &room_topic,
                Envelope::new(
                    room_topic.clone(),
                    "call.ready",
                    json!({ "room_id": room_id, "user_id": user_id }),
                ),
            )
            .await;
        Ok(())
    }

    /// Relay a mute toggle to every other participant. Never echoed to the
    /// sender.
    async fn mute_update(
        &self,
        user_id: Uuid,
        room_id: &str,
        kind: &str,
        muted: bool,
    ) -> CallResult<()> {
        let room_id = parse_room(room_id)?;
        let room = self
            .rooms
            .get_room(room_id)
            .await
            .ok_or(CallError::RoomNotFound)?;
        if !room.contains(user_id).await {
            return Err(CallError::NotInCall);
        }

        for participant in room.get_participants().await {
            if participant.user_id == user_id {
                continue;
            }
            self.emit_to(
                participant.user_id,
                "call.mute_update",
                json!({
                    "room_id": room_id,
                    "user_id": user_id,
                    "kind": kind,
                    "muted": muted,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Socket gone: evict from every room, closing logs for rooms that
    /// emptied.
    pub async fn handle_disconnect(&self, user_id: Uuid, username: &str) {
        let outcomes = self.rooms.handle_disconnect(user_id, username).await;
        for outcome in outcomes {
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

fn parse_target(s: &str) -> CallResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| CallError::InvalidTarget(s.to_string()))
}

fn parse_call_id(s: &str) -> CallResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| CallError::InvalidCallId(s.to_string()))
}
