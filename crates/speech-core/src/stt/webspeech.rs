//! Free web STT through a subprocess wrapper
//!
//! Shells out to the host's transcription helper (a thin wrapper around the
//! public web speech endpoint). That pipeline re-encodes the capture to a
//! lossless container before upload, so the stage is only available when a
//! `flac` encoder is on the PATH.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::SttProvider;
use crate::error::{Result, SpeechError};
use crate::lang;
use voxbridge_media_core::wav;

const DEFAULT_COMMAND: &str = "webspeech-transcribe";

pub struct WebSpeechStt {
    command: String,
    flac_present: bool,
}

impl WebSpeechStt {
    pub fn new() -> Self {
        Self { command: DEFAULT_COMMAND.to_string(), flac_present: binary_on_path("flac") }
    }

    pub fn with_command(command: impl Into<String>) -> Self {
        Self { command: command.into(), flac_present: binary_on_path("flac") }
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("voxbridge-stt-{}.wav", uuid::Uuid::new_v4()))
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else { return false };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

#[async_trait]
impl SttProvider for WebSpeechStt {
    fn name(&self) -> &'static str {
        "webspeech"
    }

    fn available(&self) -> bool {
        self.flac_present
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn transcribe(&self, pcm: &[u8], sample_rate: u32, language: &str) -> Result<String> {
        let wav_path = Self::scratch_path();
        let container = wav::wrap_pcm(pcm, sample_rate, 1);
        tokio::fs::write(&wav_path, &container).await.map_err(|e| SpeechError::Provider {
            provider: "webspeech",
            reason: format!("write scratch wav: {}", e),
        })?;

        let output = Command::new(&self.command)
            .arg(&wav_path)
            .arg(lang::legacy_code(language))
            .kill_on_drop(true)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&wav_path).await;

        let output = output.map_err(|e| SpeechError::Provider {
            provider: "webspeech",
            reason: format!("spawn {}: {}", self.command, e),
        })?;

        if !output.status.success() {
            return Err(SpeechError::Provider {
                provider: "webspeech",
                reason: format!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
