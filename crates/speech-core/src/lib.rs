//! # voxbridge-speech-core
//!
//! Speech providers for the voxbridge call orchestrator:
//!
//! - **TTS chain** ([`tts`]) - ordered fallback over text-to-speech
//!   providers; produces an audio artifact addressable by URL.
//! - **STT chain** ([`stt`]) - ordered fallback over speech-to-text
//!   providers; consumes raw PCM and produces a transcript.
//! - **AI bridge** ([`gateway`]) - request/response client to the remote
//!   conversation gateway, with per-call session keys and a single retry on
//!   upstream faults.
//! - **Artifact store** ([`store`]) - the shared audio directory synthesized
//!   speech is written to, plus the sweeper that reaps stale files.
//!
//! Providers are trait objects behind [`tts::TtsProvider`] /
//! [`stt::SttProvider`]; which stages exist in a chain is decided once at
//! startup from the credentials present in the configuration.

pub mod error;
pub mod gateway;
pub mod lang;
pub mod store;
pub mod stt;
pub mod tts;

pub use error::{Result, SpeechError};
pub use gateway::{AiBridge, AiBridgeConfig};
pub use store::{AudioRef, AudioStore};
pub use stt::{SttChain, SttProvider};
pub use tts::{TtsChain, TtsProvider, TtsRequest};
