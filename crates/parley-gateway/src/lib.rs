//! # parley-gateway
//!
//! Real-time WebSocket gateway for Parley. Handles:
//! - Client connections with token authentication on the handshake
//! - Inbound event dispatch (chat, P2P calls, SFU signaling)
//! - Outbound serialization through one writer task per connection
//! - Teardown cascades (room leave, call eviction, presence)
//!
//! Wire protocol: every frame, both directions, is UTF-8 JSON
//! `{"type": "<event>", "payload": {...}}`. The first inbound frame must be
//! `auth {token}`; everything else before that closes the socket.

pub mod hub;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hub::Hub;
use parley_common::auth::{Claims, TokenVerifier};
use parley_common::event::{ChatEvent, Frame};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Gateway state shared by every socket.
pub struct GatewayState {
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub handshake_timeout: Duration,
}

/// Build the gateway WebSocket router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Drive one socket: handshake, register, writer task, reader loop, teardown.
async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some(claims) = authenticate(&mut receiver, &mut sender, &state).await else {
        let _ = sender.close().await;
        return;
    };
    let user_id: Uuid = match claims.sub.parse() {
        Ok(id) => id,
        Err(_) => {
            send_auth_error(&mut sender, "token does not carry a user id").await;
            let _ = sender.close().await;
            return;
        }
    };

    let (connection, mut outbound_rx) = state.hub.register(user_id, &claims.username).await;

    // Single writer: everything the connection emits flows through here in
    // enqueue order.
    let writer_cancel = connection.cancel.clone();
    let write_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Reader: inbound frames processed in receive order.
    loop {
        let msg = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            msg = receiver.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                state.hub.handle_inbound(&connection, &text).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }

    state.hub.disconnect(&connection).await;
    write_task.abort();
}

/// Wait for the `auth {token}` frame and verify it. Any other first frame,
/// a bad token, or handshake-timeout expiry fails the connection.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    sender: &mut SplitSink<WebSocket, Message>,
    state: &GatewayState,
) -> Option<Claims> {
    let first = tokio::time::timeout(state.handshake_timeout, async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(_) => {
            send_auth_error(sender, "authentication timed out").await;
            return None;
        }
    };

    let frame: Frame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(_) => {
            send_auth_error(sender, "malformed frame").await;
            return None;
        }
    };
    let token = match ChatEvent::from_frame(&frame) {
        Ok(ChatEvent::Auth { token }) => token,
        _ => {
            send_auth_error(sender, "expected auth frame").await;
            return None;
        }
    };

    match state.verifier.verify(&token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            tracing::warn!(error = %e, "gateway auth failed");
            send_auth_error(sender, "invalid token").await;
            None
        }
    }
}

async fn send_auth_error(sender: &mut SplitSink<WebSocket, Message>, message: &str) {
    let frame = Frame::new("auth.error", json!({ "message": message }));
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sender.send(Message::Text(text.into())).await;
    }
}
