//! Client-visible signaling errors.
//!
//! Every failure that is reported back to the originating socket carries one
//! of these stable codes; the human-readable message is advisory and may
//! change. Transport- and media-layer failures that stay inside the server
//! never surface here.

use serde_json::json;

/// A signaling failure reported to the originating client as a
/// `call.error {code, message}` envelope.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid room id: {0}")]
    InvalidRoom(String),

    #[error("invalid target id: {0}")]
    InvalidTarget(String),

    #[error("invalid call id: {0}")]
    InvalidCallId(String),

    #[error("not a member of this conversation")]
    NotMember,

    #[error("not in this call")]
    NotInCall,

    #[error("no active call")]
    NoCall,

    #[error("room not found")]
    RoomNotFound,

    #[error("target is not in the room")]
    TargetNotFound,

    #[error("join failed: {0}")]
    JoinFailed(String),

    #[error("offer failed: {0}")]
    OfferFailed(String),

    #[error("answer failed: {0}")]
    AnswerFailed(String),

    #[error("candidate failed: {0}")]
    CandidateFailed(String),

    /// Repository or bus failure outside the call plane (chat membership
    /// lookups, message persistence). Details stay in the server logs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Stable error code for programmatic handling by clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::InvalidRoom(_) => "invalid_room",
            Self::InvalidTarget(_) => "invalid_target",
            Self::InvalidCallId(_) => "invalid_call_id",
            Self::NotMember => "not_member",
            Self::NotInCall => "not_in_call",
            Self::NoCall => "no_call",
            Self::RoomNotFound => "room_not_found",
            Self::TargetNotFound => "target_not_found",
            Self::JoinFailed(_) => "join_failed",
            Self::OfferFailed(_) => "offer_failed",
            Self::AnswerFailed(_) => "answer_failed",
            Self::CandidateFailed(_) => "candidate_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Wire payload for the `call.error` envelope.
    pub fn to_payload(&self) -> serde_json::Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }
}

/// Convenience alias for signaling-handler results.
pub type CallResult<T> = Result<T, CallError>;
