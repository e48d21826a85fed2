//! Key-gated API STT (Whisper-style transcription endpoint)

use std::time::Duration;

use async_trait::async_trait;

use super::SttProvider;
use crate::error::{Result, SpeechError};
use voxbridge_media_core::wav;

const ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

pub struct WhisperStt {
    key: String,
    http: reqwest::Client,
}

impl WhisperStt {
    pub fn new(key: String) -> Self {
        Self { key, http: reqwest::Client::new() }
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    fn name(&self) -> &'static str {
        "whisper"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn transcribe(&self, pcm: &[u8], sample_rate: u32, language: &str) -> Result<String> {
        let container = wav::wrap_pcm(pcm, sample_rate, 1);
        let part = reqwest::multipart::Part::bytes(container)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| SpeechError::Provider { provider: "whisper", reason: e.to_string() })?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", "whisper-1")
            .text("language", language.to_string());

        let response = self
            .http
            .post(ENDPOINT)
            .bearer_auth(&self.key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::Provider { provider: "whisper", reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Provider {
                provider: "whisper",
                reason: format!("status {}: {}", status, text),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SpeechError::Provider { provider: "whisper", reason: e.to_string() })?;
        Ok(payload["text"].as_str().unwrap_or_default().trim().to_string())
    }
}
