//! Cloud STT over the Google `speech:recognize` REST surface

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use super::SttProvider;
use crate::error::{Result, SpeechError};
use crate::lang;

const ENDPOINT: &str = "https://speech.googleapis.com/v1/speech:recognize";

pub struct GoogleStt {
    key: String,
    http: reqwest::Client,
}

impl GoogleStt {
    pub fn new(key: String) -> Self {
        Self { key, http: reqwest::Client::new() }
    }
}

#[async_trait]
impl SttProvider for GoogleStt {
    fn name(&self) -> &'static str {
        "google"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn transcribe(&self, pcm: &[u8], sample_rate: u32, language: &str) -> Result<String> {
        let body = json!({
            "config": {
                "encoding": "LINEAR16",
                "sampleRateHertz": sample_rate,
                "languageCode": lang::region_tag(language),
            },
            "audio": {
                "content": base64::engine::general_purpose::STANDARD.encode(pcm),
            },
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

        // No results at all means no recognizable speech
        let transcript = payload["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r["alternatives"][0]["transcript"].as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        Ok(transcript.trim().to_string())
    }
}
