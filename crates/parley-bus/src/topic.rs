//! Canonical topic constructors.
//!
//! These three namespaces are the only topic shapes the core uses:
//! `user:<uuid>` for per-user delivery, `room:<uuid>` for broadcast chat
//! events, `conv:<uuid>` for conversation-scoped notifications.

use uuid::Uuid;

pub fn user(id: Uuid) -> String {
    format!("user:{id}")
}

pub fn room(id: Uuid) -> String {
    format!("room:{id}")
}

pub fn conv(id: Uuid) -> String {
    format!("conv:{id}")
}
