//! Free web TTS through the `gtts-cli` subprocess
//!
//! Last-resort stage with no credentials: shells out to the Python wrapper
//! around the public translate TTS endpoint. Output lands in a temp file
//! which is read back and deleted.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{TtsArtifact, TtsProvider, TtsRequest};
use crate::error::{Result, SpeechError};
use crate::lang;

pub struct WebTts {
    command: String,
}

impl WebTts {
    pub fn new() -> Self {
        Self { command: "gtts-cli".to_string() }
    }

    /// Override the wrapper binary (tests, exotic installs)
    pub fn with_command(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("voxbridge-tts-{}.mp3", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl TtsProvider for WebTts {
    fn name(&self) -> &'static str {
        "gtts"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact> {
        let out_path = Self::scratch_path();

        let output = Command::new(&self.command)
            .arg("--lang")
            .arg(lang::legacy_code(&request.language))
            .arg("--output")
            .arg(&out_path)
            .arg(&request.text)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SpeechError::Provider {
                provider: "gtts",
                reason: format!("spawn {}: {}", self.command, e),
            })?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&out_path).await;
            return Err(SpeechError::Provider {
                provider: "gtts",
                reason: format!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let bytes = tokio::fs::read(&out_path).await.map_err(|e| SpeechError::Provider {
            provider: "gtts",
            reason: format!("read output: {}", e),
        })?;
        let _ = tokio::fs::remove_file(&out_path).await;

        if bytes.is_empty() {
            return Err(SpeechError::Provider { provider: "gtts", reason: "empty output file".into() });
        }
        Ok(TtsArtifact { bytes, extension: "mp3" })
    }
}
