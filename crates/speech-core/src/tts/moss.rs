//! GPU voice-clone TTS server client
//!
//! Talks to a self-hosted synthesis server. Cloning runs a real model per
//! request, so the time budget is the long end of the chain and deployments
//! on low-power hosts leave this stage disabled.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{TtsArtifact, TtsProvider, TtsRequest};
use crate::error::{Result, SpeechError};

pub struct MossTts {
    base_url: String,
    http: reqwest::Client,
}

impl MossTts {
    pub fn new(base_url: String) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), http: reqwest::Client::new() }
    }
}

#[async_trait]
impl TtsProvider for MossTts {
    fn name(&self) -> &'static str {
        "moss"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact> {
        let body = json!({
            "text": request.text,
            "language": request.language,
            "voice": request.voice_id,
        });

        let response = self
            .http
            .post(format!("{}/tts", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Provider { provider: "moss", reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpeechError::Provider {
                provider: "moss",
                reason: format!("status {}", status),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Provider { provider: "moss", reason: e.to_string() })?;
        Ok(TtsArtifact { bytes: bytes.to_vec(), extension: "wav" })
    }
}
