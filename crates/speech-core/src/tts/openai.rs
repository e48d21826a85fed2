//! Key-gated API TTS (OpenAI speech endpoint)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{TtsArtifact, TtsProvider, TtsRequest};
use crate::error::{Result, SpeechError};

const ENDPOINT: &str = "https://api.openai.com/v1/audio/speech";
const DEFAULT_VOICE: &str = "alloy";

pub struct OpenAiTts {
    key: String,
    http: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(key: String) -> Self {
        Self { key, http: reqwest::Client::new() }
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact> {
        let body = json!({
            "model": "tts-1",
            "input": request.text,
            "voice": DEFAULT_VOICE,
            "response_format": "mp3",
        });

        let response = self
            .http
            .post(ENDPOINT)
            .bearer_auth(&self.key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Provider { provider: "openai", reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Provider {
                provider: "openai",
                reason: format!("status {}: {}", status, text),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Provider { provider: "openai", reason: e.to_string() })?;
        Ok(TtsArtifact { bytes: bytes.to_vec(), extension: "mp3" })
    }
}
