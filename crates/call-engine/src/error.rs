//! Error types for the call engine
//!
//! Kinds map to recovery scopes: validation and not-found surface to the
//! API caller, upstream faults trigger fallback or canned recovery speech
//! inside the conversation loop, SIP failures terminate the session with a
//! reason, and internal errors are confined to the call they happened in.

use thiserror::Error;

use crate::session::FailReason;

#[derive(Debug, Error)]
pub enum CallEngineError {
    /// Request malformed; recoverable by the caller
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Unknown device or call
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The engine is not ready to take this request (no registration yet,
    /// signaling server down)
    #[error("service not ready: {reason}")]
    NotReady { reason: String },

    /// Signaling-server transport or protocol failure
    #[error("sip transport error: {reason}")]
    SipTransport { reason: String },

    /// A SIP final response terminated the call
    #[error("sip failure {code}: {reason}")]
    SipFailure { code: u16, reason: FailReason },

    /// Media engine command failed
    #[error("media engine error: {reason}")]
    Media { reason: String },

    /// Speech stack exhausted or gateway down
    #[error(transparent)]
    Speech(#[from] voxbridge_speech_core::SpeechError),

    /// Operation exceeded its budget
    #[error("{operation} timed out after {ms} ms")]
    Timeout { operation: &'static str, ms: u64 },

    /// State machine rejected a transition
    #[error("illegal state transition for call {call_id}: {from} -> {to}")]
    IllegalTransition { call_id: String, from: String, to: String },

    /// Unexpected failure confined to one call
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CallEngineError {
    pub fn internal(reason: impl Into<String>) -> Self {
        CallEngineError::Internal { reason: reason.into() }
    }

    /// Whether the conversation loop can absorb this without ending the call
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallEngineError::Speech(e) => e.is_recoverable(),
            CallEngineError::Timeout { .. } | CallEngineError::Media { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CallEngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_speech_core::SpeechError;

    #[test]
    fn recoverability_follows_the_speech_classification() {
        let upstream: CallEngineError =
            SpeechError::Gateway { status: 503, reason: "down".into() }.into();
        assert!(upstream.is_recoverable());

        let store: CallEngineError =
            SpeechError::Store { reason: "disk full".into() }.into();
        assert!(!store.is_recoverable());

        assert!(CallEngineError::Timeout { operation: "stt", ms: 20_000 }.is_recoverable());
        assert!(!CallEngineError::SipTransport { reason: "gone".into() }.is_recoverable());
    }
}
