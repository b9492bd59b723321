//! The connection hub: every live client socket, its routing state, and the
//! inbound dispatch table.
//!
//! A connection's outbound path is a single bounded queue drained by one
//! writer task; publishers never touch the socket. The queue filling up
//! marks the client as slow and the whole connection is torn down —
//! delivery is at-most-once and a dropped slow client is cheaper than a
//! stalled broadcast.

use chrono::{DateTime, Utc};
use parley_bus::{topic, Envelope, EventBus, Subscription};
use parley_common::error::CallError;
use parley_common::event::{CallEvent, ChatEvent, Frame, SfuEvent};
use parley_store::Store;
use parley_voice::VoiceState;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One authenticated client socket.
pub struct Connection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
    pub cancel: CancellationToken,
    /// The `user:<id>` subscription plus one per joined room.
    user_subscription: Mutex<Option<Subscription>>,
    rooms: Mutex<HashMap<Uuid, Subscription>>,
    /// Conversation-scoped subscriptions (`conv:<id>`), one per membership,
    /// carrying presence and other conversation notifications.
    conv_subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

impl Connection {
    /// Queue a frame for the writer task. `false` means the queue was full
    /// (slow client) — the caller is expected to tear the connection down.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true; // already dying; swallow quietly
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_error(&self, error: &CallError) {
        self.send_frame(Frame::new("call.error", error.to_payload()));
    }
}

pub struct Hub {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn Store>,
    voice: VoiceState,
    outbound_queue: usize,
}

impl Hub {
    pub fn new(
        bus: Arc<dyn EventBus>,
        store: Arc<dyn Store>,
        voice: VoiceState,
        outbound_queue: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            bus,
            store,
            voice,
            outbound_queue,
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Bind an authenticated user to a new connection: create the outbound
    /// queue, greet with `auth.success`, subscribe the user topic, and
    /// announce presence. Returns the connection and the queue's receiving
    /// end for the writer task.
    pub async fn register(
        self: &Arc<Self>,
        user_id: Uuid,
        username: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            user_id,
            username: username.to_string(),
            created_at: Utc::now(),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            user_subscription: Mutex::new(None),
            rooms: Mutex::new(HashMap::new()),
            conv_subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Greeting goes first so the client sees it before any envelope.
        connection.send_frame(Frame::new("auth.success", json!({ "user_id": user_id })));

        // Everything published to this user's topic is serialized onto the
        // socket; a full queue tears the connection down.
        let hub = Arc::clone(self);
        let conn = Arc::clone(&connection);
        let subscription = self
            .bus
            .subscribe(
                &topic::user(user_id),
                parley_bus::handler(move |env: Envelope| {
                    let hub = Arc::clone(&hub);
                    let conn = Arc::clone(&conn);
                    async move {
                        if !conn.send_frame(Frame::new(env.event, env.payload)) {
                            tracing::warn!(
                                connection = %conn.id,
                                user = %conn.user_id,
                                "outbound queue overflow, dropping slow connection"
                            );
                            // Teardown unsubscribes (and aborts) this very
                            // delivery task, so it must run elsewhere.
                            tokio::spawn(async move { hub.disconnect(&conn).await });
                        }
                    }
                }),
            )
            .await;
        match subscription {
            Ok(sub) => *connection.user_subscription.lock().await = Some(sub),
            Err(e) => tracing::error!(user = %user_id, error = %e, "user topic subscribe failed"),
        }

        // Conversation notifications (presence and friends) ride `conv:`
        // topics, one subscription per membership.
        if let Ok(conversations) = self.store.list_member_conversations(user_id).await {
            let mut conv_subs = connection.conv_subscriptions.lock().await;
            for conversation_id in conversations {
                let hub = Arc::clone(self);
                let conn = Arc::clone(&connection);
                let subscribed = self
                    .bus
                    .subscribe(
                        &topic::conv(conversation_id),
                        parley_bus::handler(move |env: Envelope| {
                            let hub = Arc::clone(&hub);
                            let conn = Arc::clone(&conn);
                            async move {
                                if !conn.send_frame(Frame::new(env.event, env.payload)) {
                                    tokio::spawn(async move { hub.disconnect(&conn).await });
                                }
                            }
                        }),
                    )
                    .await;
                if let Ok(sub) = subscribed {
                    conv_subs.push(sub);
                }
            }
        }

        self.connections
            .write()
            .await
            .insert(connection.id, Arc::clone(&connection));

        tracing::info!(connection = %connection.id, user = %username, "client connected");

        self.publish_presence(user_id, true).await;

        (connection, outbound_rx)
    }

    /// Full teardown cascade: cancel, unsubscribe everything, drop from the
    /// map, evict from every call, update presence. Safe to call twice.
    pub async fn disconnect(self: &Arc<Self>, connection: &Arc<Connection>) {
        if connection.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        connection.cancel.cancel();

        if let Some(sub) = connection.user_subscription.lock().await.take() {
            let _ = self.bus.unsubscribe(&sub).await;
        }
        for (_, sub) in connection.rooms.lock().await.drain() {
            let _ = self.bus.unsubscribe(&sub).await;
        }
        for sub in connection.conv_subscriptions.lock().await.drain(..) {
            let _ = self.bus.unsubscribe(&sub).await;
        }

        self.connections.write().await.remove(&connection.id);

        self.voice
            .handle_disconnect(connection.user_id, &connection.username)
            .await;

        // Offline only when this was the user's last socket.
        let still_online = self
            .connections
            .read()
            .await
            .values()
            .any(|c| c.user_id == connection.user_id);
        if !still_online {
            self.publish_presence(connection.user_id, false).await;
        }

        tracing::info!(
            connection = %connection.id,
            user = %connection.username,
            "client disconnected"
        );
    }

    /// Decode one inbound frame and dispatch it by tag. Errors are reported
    /// to this socket only; nothing here closes the connection.
    pub async fn handle_inbound(self: &Arc<Self>, connection: &Arc<Connection>, text: &str) {
        if connection.is_closed() {
            return;
        }

        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                connection.send_error(&CallError::InvalidPayload(e.to_string()));
                return;
            }
        };

        if frame.event.starts_with("call.") {
            let result = match CallEvent::from_frame(&frame) {
                Ok(event) => {
                    self.voice
                        .calls
                        .handle(connection.user_id, &connection.username, event)
                        .await
                }
                Err(e) => Err(CallError::InvalidPayload(e.to_string())),
            };
            if let Err(error) = result {
                connection.send_error(&error);
            }
            return;
        }

        if frame.event.starts_with("sfu.") {
            let result = match SfuEvent::from_frame(&frame) {
                Ok(event) => {
                    self.voice
                        .group
                        .handle(connection.user_id, &connection.username, event)
                        .await
                }
                Err(e) => Err(CallError::InvalidPayload(e.to_string())),
            };
            if let Err(error) = result {
                connection.send_error(&error);
            }
            return;
        }

        match ChatEvent::from_frame(&frame) {
            Ok(ChatEvent::Auth { .. }) => {
                // Authentication happened on the handshake; repeats are noise.
                tracing::debug!(connection = %connection.id, "duplicate auth frame ignored");
            }
            Ok(ChatEvent::Heartbeat { timestamp }) => {
                connection.send_frame(Frame::new(
                    "heartbeat.ack",
                    json!({
                        "timestamp": timestamp,
                        "server_time": Utc::now().timestamp_millis(),
                    }),
                ));
            }
            Ok(ChatEvent::RoomJoin { room_id }) => {
                if let Err(error) = self.join_room(connection, &room_id).await {
                    connection.send_error(&error);
                }
            }
            Ok(ChatEvent::RoomLeave { room_id }) => {
                if let Err(error) = self.leave_room(connection, &room_id).await {
                    connection.send_error(&error);
                }
            }
            Ok(ChatEvent::MessageSend {
                room_id,
                body_text,
                attachment_id,
            }) => {
                if let Err(error) = self
                    .send_message(connection, &room_id, body_text, attachment_id)
                    .await
                {
                    connection.send_error(&error);
                }
            }
            Ok(ChatEvent::TypingStart { room_id }) => {
                if let Err(error) = self.typing(connection, &room_id, true).await {
                    connection.send_error(&error);
                }
            }
            Ok(ChatEvent::TypingStop { room_id }) => {
                if let Err(error) = self.typing(connection, &room_id, false).await {
                    connection.send_error(&error);
                }
            }
            Err(_) => {
                // Unknown tag: diagnostic only, socket stays open.
                connection.send_error(&CallError::InvalidPayload(format!(
                    "unknown event type: {}",
                    frame.event
                )));
            }
        }
    }

    /// Subscribe the connection to `room:<id>` for broadcast chat events.
    async fn join_room(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        room_id: &str,
    ) -> Result<(), CallError> {
        let room_id = parse_room(room_id)?;
        let is_member = self
            .store
            .is_member(room_id, connection.user_id)
            .await
            .map_err(|e| CallError::Internal(e.to_string()))?;
        if !is_member {
            return Err(CallError::NotMember);
        }

        let mut rooms = connection.rooms.lock().await;
        if rooms.contains_key(&room_id) {
            return Ok(());
        }

        let hub = Arc::clone(self);
        let conn = Arc::clone(connection);
        let subscription = self
            .bus
            .subscribe(
                &topic::room(room_id),
                parley_bus::handler(move |env: Envelope| {
                    let hub = Arc::clone(&hub);
                    let conn = Arc::clone(&conn);
                    async move {
                        if !conn.send_frame(Frame::new(env.event, env.payload)) {
                            tracing::warn!(
                                connection = %conn.id,
                                "outbound queue overflow, dropping slow connection"
                            );
                            tokio::spawn(async move { hub.disconnect(&conn).await });
                        }
                    }
                }),
            )
            .await
            .map_err(|e| CallError::Internal(e.to_string()))?;
        rooms.insert(room_id, subscription);

        tracing::debug!(connection = %connection.id, room = %room_id, "joined room");
        Ok(())
    }

    async fn leave_room(
        &self,
        connection: &Arc<Connection>,
        room_id: &str,
    ) -> Result<(), CallError> {
        let room_id = parse_room(room_id)?;
        if let Some(sub) = connection.rooms.lock().await.remove(&room_id) {
            let _ = self.bus.unsubscribe(&sub).await;
            tracing::debug!(connection = %connection.id, room = %room_id, "left room");
        }
        Ok(())
    }

    /// Persist, then fan out `message.new` on the room topic (the sender is
    /// subscribed too, so it doubles as the echo).
    async fn send_message(
        &self,
        connection: &Arc<Connection>,
        room_id: &str,
        body_text: Option<String>,
        attachment_id: Option<String>,
    ) -> Result<(), CallError> {
        let room_id = parse_room(room_id)?;
        let attachment_id = attachment_id
            .map(|s| {
                Uuid::parse_str(&s).map_err(|_| CallError::InvalidPayload("bad attachment id".into()))
            })
            .transpose()?;
        if body_text.as_deref().unwrap_or("").is_empty() && attachment_id.is_none() {
            return Err(CallError::InvalidPayload("empty message".into()));
        }

        let is_member = self
            .store
            .is_member(room_id, connection.user_id)
            .await
            .map_err(|e| CallError::Internal(e.to_string()))?;
        if !is_member {
            return Err(CallError::NotMember);
        }

        let message = self
            .store
            .create_message(
                room_id,
                connection.user_id,
                body_text.as_deref(),
                attachment_id,
            )
            .await
            .map_err(|e| {
                tracing::error!(room = %room_id, error = %e, "message persist failed");
                CallError::Internal("message could not be stored".into())
            })?;

        let room_topic = topic::room(room_id);
        let _ = self
            .bus
            .publish(
                &room_topic,
                Envelope::new(
                    room_topic.clone(),
                    "message.new",
                    json!({
                        "message_id": message.id,
                        "room_id": room_id,
                        "sender_id": connection.user_id,
                        "sender_name": connection.username,
                        "body_text": message.body_text,
                        "attachment_id": message.attachment_id,
                        "created_at": message.created_at,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    /// Ephemeral typing indicator on the room topic. Requires having joined
    /// the room on this connection; not persisted.
    async fn typing(
        &self,
        connection: &Arc<Connection>,
        room_id: &str,
        started: bool,
    ) -> Result<(), CallError> {
        let room_id = parse_room(room_id)?;
        if !connection.rooms.lock().await.contains_key(&room_id) {
            return Err(CallError::NotMember);
        }

        let room_topic = topic::room(room_id);
        let event = if started { "typing.start" } else { "typing.stop" };
        let _ = self
            .bus
            .publish(
                &room_topic,
                Envelope::new(
                    room_topic.clone(),
                    event,
                    json!({
                        "room_id": room_id,
                        "user_id": connection.user_id,
                        "username": connection.username,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    /// `presence.update` to every conversation the user belongs to.
    async fn publish_presence(&self, user_id: Uuid, online: bool) {
        let conversations = match self.store.list_member_conversations(user_id).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "presence lookup failed");
                return;
            }
        };
        for conversation_id in conversations {
            let conv_topic = topic::conv(conversation_id);
            let _ = self
                .bus
                .publish(
                    &conv_topic,
                    Envelope::new(
                        conv_topic.clone(),
                        "presence.update",
                        json!({ "user_id": user_id, "online": online }),
                    ),
                )
                .await;
        }
    }

    /// Tear down every connection (server shutdown).
    pub async fn shutdown(self: &Arc<Self>) {
        let connections: Vec<Arc<Connection>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };
        for connection in connections {
            self.disconnect(&connection).await;
        }
    }
}

fn parse_room(s: &str) -> Result<Uuid, CallError> {
    Uuid::parse_str(s).map_err(|_| CallError::InvalidRoom(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_bus::memory::MemoryBus;
    use parley_store::memory::MemoryStore;
    use parley_voice::CallSettings;
    use std::time::Duration;

    fn uid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    async fn fixture_with_queue(queue: usize) -> (Arc<MemoryBus>, Arc<MemoryStore>, Arc<Hub>) {
        let bus = MemoryBus::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let voice = VoiceState::new(
            store.clone(),
            bus.clone(),
            CallSettings {
                ice_servers: vec![],
                answer_timeout: Duration::from_secs(15),
                sfu_enabled: true,
            },
        )
        .unwrap();
        let hub = Hub::new(bus.clone(), store.clone(), voice, queue);
        (bus, store, hub)
    }

    async fn fixture() -> (Arc<MemoryBus>, Arc<MemoryStore>, Arc<Hub>) {
        fixture_with_queue(64).await
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>, event: &str) -> Frame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection queue closed");
            if frame.event == event {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn register_greets_with_auth_success() {
        let (_bus, _store, hub) = fixture().await;
        let (_conn, mut rx) = hub.register(uid(10), "alice").await;

        let frame = next_frame(&mut rx, "auth.success").await;
        assert_eq!(frame.payload["user_id"], uid(10).to_string());
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_event_tag_yields_diagnostic_without_closing() {
        let (_bus, _store, hub) = fixture().await;
        let (conn, mut rx) = hub.register(uid(10), "alice").await;

        hub.handle_inbound(&conn, r#"{"type":"wormhole.open","payload":{}}"#)
            .await;

        let error = next_frame(&mut rx, "call.error").await;
        assert_eq!(error.payload["code"], "invalid_payload");
        assert!(!conn.is_closed());
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_json_yields_diagnostic() {
        let (_bus, _store, hub) = fixture().await;
        let (conn, mut rx) = hub.register(uid(10), "alice").await;

        hub.handle_inbound(&conn, "{not json").await;

        let error = next_frame(&mut rx, "call.error").await;
        assert_eq!(error.payload["code"], "invalid_payload");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let (_bus, _store, hub) = fixture().await;
        let (conn, mut rx) = hub.register(uid(10), "alice").await;

        hub.handle_inbound(&conn, r#"{"type":"heartbeat","payload":{"timestamp":42}}"#)
            .await;

        let ack = next_frame(&mut rx, "heartbeat.ack").await;
        assert_eq!(ack.payload["timestamp"], 42);
    }

    #[tokio::test]
    async fn room_join_requires_membership() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (conn, mut rx) = hub.register(uid(12), "mallory").await;

        hub.handle_inbound(
            &conn,
            &format!(r#"{{"type":"room.join","payload":{{"room_id":"{}"}}}}"#, uid(1)),
        )
        .await;

        let error = next_frame(&mut rx, "call.error").await;
        assert_eq!(error.payload["code"], "not_member");
    }

    #[tokio::test]
    async fn message_send_echoes_to_both_members() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;

        let (alice, mut alice_rx) = hub.register(uid(10), "alice").await;
        let (bob, mut bob_rx) = hub.register(uid(11), "bob").await;

        let join = format!(r#"{{"type":"room.join","payload":{{"room_id":"{}"}}}}"#, uid(1));
        hub.handle_inbound(&alice, &join).await;
        hub.handle_inbound(&bob, &join).await;

        hub.handle_inbound(
            &alice,
            &format!(
                r#"{{"type":"message.send","payload":{{"room_id":"{}","body_text":"hi"}}}}"#,
                uid(1)
            ),
        )
        .await;

        let to_bob = next_frame(&mut bob_rx, "message.new").await;
        assert_eq!(to_bob.payload["body_text"], "hi");
        assert_eq!(to_bob.payload["sender_id"], uid(10).to_string());

        let echo = next_frame(&mut alice_rx, "message.new").await;
        assert_eq!(echo.payload["body_text"], "hi");
    }

    #[tokio::test]
    async fn typing_requires_joined_room() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (alice, mut alice_rx) = hub.register(uid(10), "alice").await;

        hub.handle_inbound(
            &alice,
            &format!(r#"{{"type":"typing.start","payload":{{"room_id":"{}"}}}}"#, uid(1)),
        )
        .await;
        let error = next_frame(&mut alice_rx, "call.error").await;
        assert_eq!(error.payload["code"], "not_member");
    }

    #[tokio::test]
    async fn typing_reaches_room_subscribers() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (alice, _alice_rx) = hub.register(uid(10), "alice").await;
        let (bob, mut bob_rx) = hub.register(uid(11), "bob").await;

        let join = format!(r#"{{"type":"room.join","payload":{{"room_id":"{}"}}}}"#, uid(1));
        hub.handle_inbound(&alice, &join).await;
        hub.handle_inbound(&bob, &join).await;

        hub.handle_inbound(
            &alice,
            &format!(r#"{{"type":"typing.start","payload":{{"room_id":"{}"}}}}"#, uid(1)),
        )
        .await;

        let typing = next_frame(&mut bob_rx, "typing.start").await;
        assert_eq!(typing.payload["user_id"], uid(10).to_string());
    }

    #[tokio::test]
    async fn call_events_dispatch_to_the_call_handler() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (alice, mut alice_rx) = hub.register(uid(10), "alice").await;
        let (_bob, mut bob_rx) = hub.register(uid(11), "bob").await;

        hub.handle_inbound(
            &alice,
            &format!(r#"{{"type":"call.join","payload":{{"room_id":"{}"}}}}"#, uid(1)),
        )
        .await;

        let config = next_frame(&mut alice_rx, "call.config").await;
        assert_eq!(config.payload["is_initiator"], true);
        let incoming = next_frame(&mut bob_rx, "call.incoming").await;
        assert_eq!(incoming.payload["caller_id"], uid(10).to_string());
    }

    #[tokio::test]
    async fn call_error_is_reported_to_originator() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (alice, mut alice_rx) = hub.register(uid(10), "alice").await;

        hub.handle_inbound(
            &alice,
            r#"{"type":"call.join","payload":{"room_id":"not-a-uuid"}}"#,
        )
        .await;

        let error = next_frame(&mut alice_rx, "call.error").await;
        assert_eq!(error.payload["code"], "invalid_room");
    }

    #[tokio::test]
    async fn outbound_overflow_tears_the_connection_down() {
        let (bus, _store, hub) = fixture_with_queue(2).await;
        let (conn, rx) = hub.register(uid(10), "alice").await;
        // Never drain the queue.
        std::mem::forget(rx);

        for n in 0..10 {
            bus.publish(
                &topic::user(uid(10)),
                Envelope::new(topic::user(uid(10)), "test.event", json!({ "n": n })),
            )
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.is_closed());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_cascades_into_call_rooms() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;
        let (alice, _alice_rx) = hub.register(uid(10), "alice").await;
        let (_bob, mut bob_rx) = hub.register(uid(11), "bob").await;

        let join = format!(r#"{{"type":"call.join","payload":{{"room_id":"{}"}}}}"#, uid(1));
        hub.handle_inbound(&alice, &join).await;
        let bob_join = format!(r#"{{"type":"call.join","payload":{{"room_id":"{}"}}}}"#, uid(1));
        hub.handle_inbound(&_bob, &bob_join).await;

        hub.disconnect(&alice).await;

        let left = next_frame(&mut bob_rx, "call.participant_left").await;
        assert_eq!(left.payload["user_id"], uid(10).to_string());
        assert_eq!(hub.connection_count().await, 1);

        // Frames arriving after close are ignored.
        hub.handle_inbound(&alice, &join).await;
        assert!(alice.is_closed());
    }

    #[tokio::test]
    async fn presence_flows_to_conversation_members() {
        let (_bus, store, hub) = fixture().await;
        store.add_direct(uid(1), uid(10), uid(11)).await;

        let (_bob, mut bob_rx) = hub.register(uid(11), "bob").await;
        let (alice, _alice_rx) = hub.register(uid(10), "alice").await;

        // Bob sees his own presence echo first; wait for alice's.
        let online = loop {
            let frame = next_frame(&mut bob_rx, "presence.update").await;
            if frame.payload["user_id"] == uid(10).to_string() {
                break frame;
            }
        };
        assert_eq!(online.payload["online"], true);

        hub.disconnect(&alice).await;
        let offline = next_frame(&mut bob_rx, "presence.update").await;
        assert_eq!(offline.payload["user_id"], uid(10).to_string());
        assert_eq!(offline.payload["online"], false);
    }

    #[tokio::test]
    async fn double_disconnect_is_safe() {
        let (_bus, _store, hub) = fixture().await;
        let (conn, _rx) = hub.register(uid(10), "alice").await;

        hub.disconnect(&conn).await;
        hub.disconnect(&conn).await;
        assert_eq!(hub.connection_count().await, 0);
    }
}
