//! Shared handler state

use std::path::PathBuf;
use std::sync::Arc;

use voxbridge_call_engine::CallEngine;
use voxbridge_speech_core::AudioStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CallEngine>,
    /// TTS artifacts served under `/audio-files/`
    pub store: AudioStore,
    /// Static prompt audio served under `/static/`
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(engine: Arc<CallEngine>, store: AudioStore, static_dir: impl Into<PathBuf>) -> Self {
        Self { engine, store, static_dir: static_dir.into() }
    }
}
