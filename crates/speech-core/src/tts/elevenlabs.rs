//! Key-gated voice-clone TTS (ElevenLabs)
//!
//! The device's opaque voice id selects the cloned voice; without one a
//! stock voice is used so the stage still functions as a fallback.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{TtsArtifact, TtsProvider, TtsRequest};
use crate::error::{Result, SpeechError};

const BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const STOCK_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

pub struct ElevenLabsTts {
    key: String,
    http: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(key: String) -> Self {
        Self { key, http: reqwest::Client::new() }
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact> {
        let voice = request.voice_id.as_deref().unwrap_or(STOCK_VOICE);
        let body = json!({
            "text": request.text,
            "model_id": "eleven_multilingual_v2",
        });

        let response = self
            .http
            .post(format!("{}/{}", BASE, voice))
            .header("xi-api-key", &self.key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Provider { provider: "elevenlabs", reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpeechError::Provider {
                provider: "elevenlabs",
                reason: format!("status {}", status),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Provider { provider: "elevenlabs", reason: e.to_string() })?;
        Ok(TtsArtifact { bytes: bytes.to_vec(), extension: "mp3" })
    }
}
