//! Error types for the media-core crate

use thiserror::Error;

/// Errors produced by the audio-fork server and its sessions
#[derive(Debug, Error)]
pub enum MediaCoreError {
    /// Failed to bind the fork server's listening socket
    #[error("failed to bind audio fork listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// WebSocket handshake with the media engine failed
    #[error("websocket handshake failed: {reason}")]
    Handshake { reason: String },

    /// WebSocket transport error mid-session
    #[error("websocket transport error: {reason}")]
    Transport { reason: String },

    /// Waited for a fork connection that never arrived
    #[error("no audio fork connection for call {call_id} within {waited_ms} ms")]
    ExpectationTimeout { call_id: String, waited_ms: u64 },
}

impl MediaCoreError {
    /// Whether the caller can continue the call without this fork session.
    /// A missing fork only degrades the call (no caller audio); transport
    /// and bind errors are fatal to their scope.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MediaCoreError::ExpectationTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, MediaCoreError>;
