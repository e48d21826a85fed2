//! # voxbridge-media-core
//!
//! Audio-side building blocks for the voxbridge call orchestrator:
//!
//! - **Voice activity detection** ([`vad`]) - per-chunk speech/silence
//!   classification of raw 16-bit PCM with one-shot endianness detection.
//! - **Utterance framing** ([`utterance`]) - the state machine that turns a
//!   stream of PCM chunks into discrete caller utterances with pre-roll,
//!   end-of-silence and maximum-duration handling.
//! - **Audio-fork server** ([`fork`]) - a WebSocket server that receives the
//!   media engine's raw PCM fork, one connection per call, and emits framed
//!   utterances to the conversation loop.
//! - **WAV helpers** ([`wav`]) - in-memory RIFF wrapping of PCM buffers for
//!   providers that want a file-shaped payload.
//!
//! The crate owns no telephony state; it consumes bytes and produces
//! [`utterance::Utterance`] values keyed by call id.

pub mod error;
pub mod fork;
pub mod utterance;
pub mod vad;
pub mod wav;

pub use error::{MediaCoreError, Result};
pub use fork::{AudioForkServer, ForkConfig, ForkEvent, ForkExpectations, ForkHandle, ForkTicket};
pub use utterance::{EndReason, Utterance, UtteranceFramer};
pub use vad::{ChunkClass, Endianness, VadConfig};
