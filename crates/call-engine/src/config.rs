//! Engine configuration
//!
//! Loaded once at startup from a TOML file, with environment variables
//! overriding the secret-bearing fields so deployments can keep keys out of
//! the config file. Provider keys are optional: presence enables the
//! corresponding stage of the speech chains.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CallEngineError, Result};

/// One `[[devices]]` table: identity and personality of a telephony endpoint
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeviceConfig {
    /// 3-6 digit extension the PBX routes to this device
    pub extension: String,
    /// Unique display name (matched case-insensitively on lookup)
    pub name: String,
    /// Digest auth id (not the extension)
    pub auth_id: Option<String>,
    pub password: Option<String>,
    /// Opaque provider voice id
    pub voice_id: Option<String>,
    /// Short BCP-47 language (`en`, `he`, `ar`, `ru`, `fr`, `es`)
    pub language: Option<String>,
    pub greeting: Option<String>,
    pub thinking_phrase: Option<String>,
    /// Personality system prompt sent ahead of every AI turn
    pub personality: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address advertised in SIP Contact and SDP. Behind NAT this must be
    /// the LAN address, never the public address of a cloud instance.
    pub external_address: String,
    /// Domain used in From/To
    pub sip_domain: String,
    /// Where REGISTER is sent (host:port)
    pub sip_registrar: String,
    /// Where outbound INVITEs egress
    pub outbound_proxy: String,

    /// Signaling server admin socket
    pub sip_host: String,
    pub sip_port: u16,
    pub sip_secret: String,

    /// Media engine admin socket
    pub media_host: String,
    pub media_port: u16,
    pub media_secret: String,
    /// RTP port range, kept clear of any co-located SBC
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,

    /// Control API port
    pub http_port: u16,
    /// Audio-fork WebSocket port
    pub ws_port: u16,
    /// TTS artifact directory
    pub audio_dir: PathBuf,

    /// AI gateway base URL
    pub ai_gateway_url: String,

    /// Provider enablement (each optional)
    pub cloud_tts_key: Option<String>,
    pub cloud_stt_key: Option<String>,
    pub elevenlabs_key: Option<String>,
    pub openai_key: Option<String>,
    pub moss_tts_url: Option<String>,
    pub moss_enabled: bool,

    /// Fallback language when a device has none
    pub language_default: String,

    pub max_conversation_turns: u32,
    pub outbound_ring_timeout_secs: u64,
    /// Requested REGISTER expiry (seconds)
    pub register_expiry: u32,
    /// Allow the caller to interrupt bot playback
    pub barge_in: bool,

    pub devices: Vec<DeviceConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            external_address: "127.0.0.1".into(),
            sip_domain: "127.0.0.1".into(),
            sip_registrar: "127.0.0.1:5060".into(),
            outbound_proxy: "sip:127.0.0.1:5060".into(),
            sip_host: "127.0.0.1".into(),
            sip_port: 9022,
            sip_secret: String::new(),
            media_host: "127.0.0.1".into(),
            media_port: 8021,
            media_secret: String::new(),
            rtp_port_min: 40_000,
            rtp_port_max: 49_999,
            http_port: 3100,
            ws_port: 8077,
            audio_dir: PathBuf::from("/tmp/voxbridge-audio"),
            ai_gateway_url: "http://127.0.0.1:3333".into(),
            cloud_tts_key: None,
            cloud_stt_key: None,
            elevenlabs_key: None,
            openai_key: None,
            moss_tts_url: None,
            moss_enabled: false,
            language_default: "en".into(),
            max_conversation_turns: 10,
            outbound_ring_timeout_secs: 30,
            register_expiry: 3600,
            barge_in: false,
            devices: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML config file and fold in environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CallEngineError::Validation {
            reason: format!("read config {}: {}", path.display(), e),
        })?;
        let mut config: EngineConfig = toml::from_str(&raw).map_err(|e| CallEngineError::Validation {
            reason: format!("parse config {}: {}", path.display(), e),
        })?;
        config.apply_env();
        Ok(config)
    }

    /// Environment variables override the file for secrets and endpoints.
    pub fn apply_env(&mut self) {
        fn take(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = take("VOXBRIDGE_SIP_SECRET") {
            self.sip_secret = v;
        }
        if let Some(v) = take("VOXBRIDGE_MEDIA_SECRET") {
            self.media_secret = v;
        }
        if let Some(v) = take("VOXBRIDGE_AI_GATEWAY_URL") {
            self.ai_gateway_url = v;
        }
        self.cloud_tts_key = take("VOXBRIDGE_CLOUD_TTS_KEY").or(self.cloud_tts_key.take());
        self.cloud_stt_key = take("VOXBRIDGE_CLOUD_STT_KEY").or(self.cloud_stt_key.take());
        self.elevenlabs_key = take("VOXBRIDGE_ELEVENLABS_KEY").or(self.elevenlabs_key.take());
        self.openai_key = take("VOXBRIDGE_OPENAI_KEY").or(self.openai_key.take());
        self.moss_tts_url = take("VOXBRIDGE_MOSS_TTS_URL").or(self.moss_tts_url.take());
    }

    /// URL of the control API's audio route as the media engine sees it.
    pub fn audio_base_url(&self) -> String {
        format!("http://{}:{}/audio-files", self.external_address, self.http_port)
    }

    /// URL of the audio-fork WebSocket as the media engine sees it.
    pub fn fork_ws_url(&self, call_id: &str) -> String {
        format!("ws://{}:{}/{}", self.external_address, self.ws_port, call_id)
    }
}
