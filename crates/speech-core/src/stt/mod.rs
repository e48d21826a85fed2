//! Speech-to-text provider chain
//!
//! Same fallback discipline as the TTS chain: fixed order, skip stages with
//! unmet preconditions, demote on failure or timeout, error only when the
//! chain is exhausted. Input is mono 16-bit PCM; providers that want a file
//! get an in-memory WAV wrap.
//!
//! An empty transcript is a *result*, not an error - silence recognizes to
//! nothing and the conversation loop just keeps listening.

mod google;
mod webspeech;
mod whisper;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, SpeechError};
pub use crate::tts::{Attempt, AttemptOutcome};

pub use google::GoogleStt;
pub use webspeech::WebSpeechStt;
pub use whisper::WhisperStt;

/// A single speech-to-text backend
#[async_trait]
pub trait SttProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn available(&self) -> bool {
        true
    }

    /// Per-attempt time budget (chain cap: 20 s)
    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn transcribe(&self, pcm: &[u8], sample_rate: u32, language: &str) -> Result<String>;
}

/// Credentials that decide which stages exist
#[derive(Debug, Clone, Default)]
pub struct SttChainConfig {
    pub cloud_stt_key: Option<String>,
    pub openai_key: Option<String>,
}

/// Ordered fallback chain over STT providers
pub struct SttChain {
    providers: Vec<Box<dyn SttProvider>>,
}

impl SttChain {
    /// Build from configuration. The free web stage is constructed
    /// unconditionally but reports itself unavailable when the host lacks a
    /// lossless encoder.
    pub fn from_config(config: &SttChainConfig) -> Self {
        let mut providers: Vec<Box<dyn SttProvider>> = Vec::new();
        if let Some(key) = &config.cloud_stt_key {
            providers.push(Box::new(GoogleStt::new(key.clone())));
        }
        providers.push(Box::new(WebSpeechStt::new()));
        if let Some(key) = &config.openai_key {
            providers.push(Box::new(WhisperStt::new(key.clone())));
        }
        Self { providers }
    }

    pub fn with_providers(providers: Vec<Box<dyn SttProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn transcribe(&self, pcm: &[u8], sample_rate: u32, language: &str) -> Result<String> {
        let (result, _) = self.transcribe_traced(pcm, sample_rate, language).await;
        result
    }

    /// As [`transcribe`](Self::transcribe), also returning the attempt trail.
    pub async fn transcribe_traced(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language: &str,
    ) -> (Result<String>, Vec<Attempt>) {
        let mut attempts = Vec::new();

        for provider in &self.providers {
            if !provider.available() {
                attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::Skipped });
                continue;
            }

            debug!(provider = provider.name(), bytes = pcm.len(), "stt attempt");
            match tokio::time::timeout(provider.timeout(), provider.transcribe(pcm, sample_rate, language)).await
            {
                Ok(Ok(text)) => {
                    attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::Success });
                    return (Ok(text), attempts);
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), "stt attempt failed: {}", e);
                    attempts.push(Attempt {
                        provider: provider.name(),
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                }
                Err(_) => {
                    warn!(provider = provider.name(), "stt attempt timed out");
                    attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::TimedOut });
                }
            }
        }

        let attempted = attempts.iter().filter(|a| a.outcome != AttemptOutcome::Skipped).count();
        (Err(SpeechError::ChainExhausted { what: "stt", attempted }), attempts)
    }
}
