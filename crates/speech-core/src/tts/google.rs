//! Cloud TTS over the Google `text:synthesize` REST surface

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use super::{TtsArtifact, TtsProvider, TtsRequest};
use crate::error::{Result, SpeechError};
use crate::lang;

const ENDPOINT: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

pub struct GoogleTts {
    key: String,
    http: reqwest::Client,
}

impl GoogleTts {
    pub fn new(key: String) -> Self {
        Self { key, http: reqwest::Client::new() }
    }
}

#[async_trait]
impl TtsProvider for GoogleTts {
    fn name(&self) -> &'static str {
        "google"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact> {
        let mut voice = json!({ "languageCode": lang::region_tag(&request.language) });
        if let Some(id) = &request.voice_id {
            voice["name"] = json!(id);
        }

        let body = json!({
            "input": { "text": request.text },
            "voice": voice,
            "audioConfig": { "audioEncoding": "MP3" },
        });

        let response = self
            .http
            .post(ENDPOINT)
            .query(&[("key", self.key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Provider { provider: "google", reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Provider {
                provider: "google",
                reason: format!("status {}: {}", status, text),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SpeechError::Provider { provider: "google", reason: e.to_string() })?;
        let encoded = payload["audioContent"].as_str().ok_or(SpeechError::Provider {
            provider: "google",
            reason: "response missing audioContent".into(),
        })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SpeechError::Provider { provider: "google", reason: format!("bad base64: {}", e) })?;

        Ok(TtsArtifact { bytes, extension: "mp3" })
    }
}
