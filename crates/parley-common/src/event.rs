//! Wire event catalog.
//!
//! Every socket frame, inbound and outbound, is the same UTF-8 JSON shape:
//! `{"type": "<event>", "payload": {...}}`. The hub decodes the raw
//! [`Frame`] first, routes on the tag prefix, and only then decodes the
//! payload into the exhaustive per-namespace enums below. Identifiers stay
//! `String` at this layer so the handlers can answer with the precise error
//! code (`invalid_room` vs `invalid_payload`) instead of one blanket decode
//! failure.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One socket frame / one pub-sub payload: `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self { event: event.into(), payload }
    }

    /// Re-tag the frame so a `#[serde(tag = "type", content = "payload")]`
    /// enum can decode it.
    fn tagged(&self) -> Value {
        json!({ "type": self.event, "payload": self.payload })
    }
}

/// Chat-plane events the hub handles itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ChatEvent {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },

    #[serde(rename = "room.join")]
    RoomJoin { room_id: String },

    #[serde(rename = "room.leave")]
    RoomLeave { room_id: String },

    #[serde(rename = "message.send")]
    MessageSend {
        room_id: String,
        #[serde(default)]
        body_text: Option<String>,
        #[serde(default)]
        attachment_id: Option<String>,
    },

    #[serde(rename = "typing.start")]
    TypingStart { room_id: String },

    #[serde(rename = "typing.stop")]
    TypingStop { room_id: String },
}

impl ChatEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        serde_json::from_value(frame.tagged())
    }
}

/// P2P call signaling events (`call.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CallEvent {
    #[serde(rename = "call.join")]
    Join {
        room_id: String,
        /// "audio" or "video"; defaults to audio when omitted.
        #[serde(default)]
        call_type: Option<String>,
    },

    #[serde(rename = "call.leave")]
    Leave { room_id: String },

    #[serde(rename = "call.offer")]
    Offer {
        room_id: String,
        target_id: String,
        sdp: String,
    },

    #[serde(rename = "call.answer")]
    Answer {
        room_id: String,
        target_id: String,
        sdp: String,
    },

    #[serde(rename = "call.ice_candidate")]
    IceCandidate {
        room_id: String,
        target_id: String,
        candidate: Value,
    },

    #[serde(rename = "call.declined")]
    Declined { call_id: String },

    #[serde(rename = "call.cancelled")]
    Cancelled { call_id: String },

    #[serde(rename = "call.ended")]
    Ended { call_id: String },

    #[serde(rename = "call.ready")]
    Ready { room_id: String },

    #[serde(rename = "call.mute_update")]
    MuteUpdate {
        room_id: String,
        /// "audio" or "video"
        kind: String,
        muted: bool,
    },
}

impl CallEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        serde_json::from_value(frame.tagged())
    }
}

/// Group-call signaling events (`sfu.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SfuEvent {
    #[serde(rename = "sfu.join")]
    Join { room_id: String },

    #[serde(rename = "sfu.leave")]
    Leave { room_id: String },

    #[serde(rename = "sfu.offer")]
    Offer { room_id: String, sdp: String },

    #[serde(rename = "sfu.answer")]
    Answer { room_id: String, sdp: String },

    #[serde(rename = "sfu.candidate")]
    Candidate { room_id: String, candidate: Value },

    #[serde(rename = "sfu.tracks")]
    Tracks { room_id: String, tracks: Vec<TrackInfo> },

    #[serde(rename = "sfu.mute_update")]
    MuteUpdate {
        room_id: String,
        kind: String,
        muted: bool,
    },
}

impl SfuEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        serde_json::from_value(frame.tagged())
    }
}

/// Track metadata announced by a publisher so receivers can label streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: String,
    /// "audio" or "video"
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// ICE server descriptor embedded in `call.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Build the advertised ICE server list. STUN entries pass through;
    /// a TURN entry missing either credential is dropped, never advertised.
    pub fn from_config(ice: &crate::config::IceConfig) -> Vec<Self> {
        let mut servers = Vec::new();
        if !ice.stun_urls.is_empty() {
            servers.push(Self {
                urls: ice.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !ice.turn_urls.is_empty() && !ice.turn_username.is_empty() && !ice.turn_password.is_empty()
        {
            servers.push(Self {
                urls: ice.turn_urls.clone(),
                username: Some(ice.turn_username.clone()),
                credential: Some(ice.turn_password.clone()),
            });
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let raw = r#"{"type":"message.send","payload":{"room_id":"r1","body_text":"hi"}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.event, "message.send");
        match ChatEvent::from_frame(&frame).unwrap() {
            ChatEvent::MessageSend { room_id, body_text, .. } => {
                assert_eq!(room_id, "r1");
                assert_eq!(body_text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn call_offer_decodes() {
        let frame = Frame::new(
            "call.offer",
            json!({"room_id": "r", "target_id": "t", "sdp": "v=0"}),
        );
        match CallEvent::from_frame(&frame).unwrap() {
            CallEvent::Offer { sdp, .. } => assert_eq!(sdp, "v=0"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let frame = Frame::new("call.teleport", json!({}));
        assert!(CallEvent::from_frame(&frame).is_err());
    }

    #[test]
    fn turn_without_credentials_is_dropped() {
        let ice = crate::config::IceConfig {
            stun_urls: vec!["stun:stun.example.org:3478".into()],
            turn_urls: vec!["turn:turn.example.org:3478".into()],
            turn_username: String::new(),
            turn_password: String::new(),
            sfu_enabled: true,
        };
        let servers = IceServer::from_config(&ice);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn turn_with_credentials_is_advertised() {
        let ice = crate::config::IceConfig {
            stun_urls: vec![],
            turn_urls: vec!["turn:turn.example.org:3478".into()],
            turn_username: "u".into(),
            turn_password: "p".into(),
            sfu_enabled: true,
        };
        let servers = IceServer::from_config(&ice);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username.as_deref(), Some("u"));
    }
}
