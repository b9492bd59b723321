//! # parley-voice
//!
//! Call signaling and media for Parley.
//!
//! Two call modes share one wire protocol:
//! - **P2P** — two-party calls; the server relays SDP/ICE and tracks room
//!   membership, media flows directly between the clients.
//! - **SFU** — group calls; every participant holds one WebRTC connection
//!   to the server, which forwards RTP between them (no mixing, VP8/Opus
//!   only).
//!
//! [`VoiceState`] is the process-wide bundle the hub talks to: it owns the
//! room managers and handlers and fans disconnects out to both call modes.

pub mod call;
pub mod group;
pub mod p2p;
pub mod sfu;

use parley_bus::EventBus;
use parley_common::config::{AppConfig, CallConfig, IceConfig};
use parley_common::event::IceServer;
use parley_store::Store;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Injected call-plane settings; built once at startup from config.
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Advertised to clients in `call.config` and used by the SFU's own
    /// peer connections.
    pub ice_servers: Vec<IceServer>,
    /// How long a server-initiated offer waits for its answer.
    pub answer_timeout: Duration,
    /// When false every call is signaled P2P regardless of size.
    pub sfu_enabled: bool,
}

impl CallSettings {
    pub fn new(ice: &IceConfig, call: &CallConfig) -> Self {
        Self {
            ice_servers: IceServer::from_config(ice),
            answer_timeout: Duration::from_secs(call.answer_timeout_secs),
            sfu_enabled: ice.sfu_enabled,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.ice, &config.call)
    }
}

/// Process-wide call-plane state: P2P rooms, the SFU, and both signaling
/// handlers, created once at startup with dependencies injected.
#[derive(Clone)]
pub struct VoiceState {
    pub p2p: Arc<p2p::P2pRoomManager>,
    pub calls: Arc<call::CallHandler>,
    pub sfu: Arc<sfu::Sfu>,
    pub group: Arc<group::GroupCallHandler>,
}

impl VoiceState {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        settings: CallSettings,
    ) -> webrtc::error::Result<Self> {
        let settings = Arc::new(settings);
        let p2p = p2p::P2pRoomManager::new(Arc::clone(&bus));
        let sfu = sfu::Sfu::new(Arc::clone(&bus), Arc::clone(&settings))?;
        let calls = call::CallHandler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&p2p),
            Arc::clone(&settings),
        );
        let group = group::GroupCallHandler::new(
            store,
            bus,
            Arc::clone(&sfu),
            Arc::clone(&p2p),
            Arc::clone(&calls),
            settings,
        );
        Ok(Self {
            p2p,
            calls,
            sfu,
            group,
        })
    }

    /// A client socket went away: evict the user from every P2P room and
    /// every SFU room they were in.
    pub async fn handle_disconnect(&self, user_id: Uuid, username: &str) {
        self.calls.handle_disconnect(user_id, username).await;
        self.group.handle_disconnect(user_id).await;
    }

    /// Close every peer connection and drop all rooms.
    pub async fn shutdown(&self) {
        self.sfu.shutdown().await;
    }

    /// Snapshot for health/diagnostics endpoints.
    pub async fn stats(&self) -> VoiceStats {
        let p2p_rooms = self.p2p.get_active_rooms().await;
        let mut p2p_participants = 0;
        for room in &p2p_rooms {
            p2p_participants += room.participant_count().await;
        }
        VoiceStats {
            p2p_rooms: p2p_rooms.len(),
            p2p_participants,
            sfu_rooms: self.sfu.active_room_count().await,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct VoiceStats {
    pub p2p_rooms: usize,
    pub p2p_participants: usize,
    pub sfu_rooms: usize,
}
