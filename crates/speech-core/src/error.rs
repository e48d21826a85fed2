//! Error types for the speech-core crate

use thiserror::Error;

/// Errors produced by providers, chains and the AI bridge
#[derive(Debug, Error)]
pub enum SpeechError {
    /// A single provider attempt failed (the chain will demote past it)
    #[error("provider {provider} failed: {reason}")]
    Provider { provider: &'static str, reason: String },

    /// A provider attempt exceeded its time budget
    #[error("provider {provider} timed out after {ms} ms")]
    Timeout { provider: &'static str, ms: u64 },

    /// Every configured provider in the chain failed
    #[error("all {attempted} configured {what} providers failed")]
    ChainExhausted { what: &'static str, attempted: usize },

    /// The AI gateway replied with an error after its internal retry
    #[error("ai gateway error (status {status}): {reason}")]
    Gateway { status: u16, reason: String },

    /// The AI gateway was unreachable
    #[error("ai gateway unreachable: {reason}")]
    GatewayUnreachable { reason: String },

    /// Audio artifact store I/O failure
    #[error("audio store error: {reason}")]
    Store { reason: String },
}

impl SpeechError {
    /// Errors the conversation loop can absorb without ending the call:
    /// provider and gateway faults fall back or earn an apology, but a dead
    /// artifact store means nothing can be synthesized at all.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SpeechError::Store { .. })
    }
}

pub type Result<T> = std::result::Result<T, SpeechError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_fatal_to_a_call() {
        assert!(SpeechError::Provider { provider: "google", reason: "500".into() }.is_recoverable());
        assert!(SpeechError::Timeout { provider: "gtts", ms: 15_000 }.is_recoverable());
        assert!(SpeechError::ChainExhausted { what: "stt", attempted: 2 }.is_recoverable());
        assert!(SpeechError::Gateway { status: 503, reason: "down".into() }.is_recoverable());
        assert!(!SpeechError::Store { reason: "read-only fs".into() }.is_recoverable());
    }
}
