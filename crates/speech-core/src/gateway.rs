//! AI gateway bridge
//!
//! Request/response client for the remote conversation gateway. The bridge
//! keeps no session state of its own: the session key is an opaque string
//! derived from the call id and passed upstream, so per-call isolation is
//! the gateway's problem and ours is only to never mix keys.
//!
//! Upstream faults (5xx, or the gateway reporting its session file locked)
//! get exactly one retry under a fresh session key; anything else surfaces
//! to the caller.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Result, SpeechError};

/// Fixed block prepended to every prompt so the model answers like a voice,
/// not a chat window.
const VOICE_CONTEXT: &str = "You are answering a live phone call. Reply with short, natural \
spoken sentences only - no markdown, no lists, no emoji. Answer in the language the caller used.";

/// Session key prefix shared with the gateway deployment
const SESSION_PREFIX: &str = "claude-phone-";

#[derive(Debug, Clone)]
pub struct AiBridgeConfig {
    /// Gateway base URL, e.g. `http://127.0.0.1:3333`
    pub base_url: String,
    /// Per-attempt budget (the gateway runs a full model turn)
    pub timeout: Duration,
}

impl AiBridgeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), timeout: Duration::from_secs(30) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Derive the stable per-call session key.
///
/// ```
/// assert_eq!(voxbridge_speech_core::gateway::session_key("abc"), "claude-phone-abc");
/// ```
pub fn session_key(call_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, call_id)
}

/// Derive the one-shot retry key used after an upstream fault.
pub fn retry_session_key(base: &str, unix_ms: i64) -> String {
    format!("{}-retry-{}", base, unix_ms)
}

/// The "session file locked" condition is reported in the body with varying
/// status codes; the substring is the stable part.
pub fn is_locked_reply(body: &str) -> bool {
    body.to_ascii_lowercase().contains("session file locked")
}

/// Compose the upstream prompt: personality, voice context, then the turn.
pub fn compose_prompt(device_prompt: Option<&str>, text: &str) -> String {
    match device_prompt {
        Some(personality) if !personality.trim().is_empty() => {
            format!("{}\n\n{}\n\n{}", personality.trim(), VOICE_CONTEXT, text)
        }
        _ => format!("{}\n\n{}", VOICE_CONTEXT, text),
    }
}

/// Pull the spoken reply out of the gateway's response envelope.
pub fn extract_speech(payload: &serde_json::Value) -> Option<String> {
    payload["response"]["speech"]["plain"]["speech"].as_str().map(|s| s.to_string())
}

enum AttemptError {
    /// 5xx or locked-session: worth one retry under a fresh key
    Retryable(SpeechError),
    Fatal(SpeechError),
}

/// Client to the conversation gateway
pub struct AiBridge {
    config: AiBridgeConfig,
    http: reqwest::Client,
}

impl AiBridge {
    pub fn new(config: AiBridgeConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    /// Ask the gateway for a reply. `call_id` scopes the conversation to a
    /// session; `device_prompt` is the device personality to speak as.
    pub async fn ask(&self, text: &str, call_id: Option<&str>, device_prompt: Option<&str>) -> Result<String> {
        let prompt = compose_prompt(device_prompt, text);
        let session = call_id.map(session_key);

        match self.attempt(&prompt, session.as_deref()).await {
            Ok(reply) => Ok(reply),
            Err(AttemptError::Fatal(e)) => Err(e),
            Err(AttemptError::Retryable(first)) => {
                let retry_session = session
                    .as_deref()
                    .map(|s| retry_session_key(s, chrono::Utc::now().timestamp_millis()));
                warn!(
                    session = session.as_deref().unwrap_or("-"),
                    "gateway fault, retrying once with fresh session: {}", first
                );
                match self.attempt(&prompt, retry_session.as_deref()).await {
                    Ok(reply) => Ok(reply),
                    Err(AttemptError::Retryable(e)) | Err(AttemptError::Fatal(e)) => Err(e),
                }
            }
        }
    }

    /// Tell the gateway the call's session is done. Best-effort: failures
    /// are logged and swallowed.
    pub async fn end_session(&self, call_id: &str) {
        let body = json!({ "session": session_key(call_id) });
        let result = self
            .http
            .post(format!("{}/conversation/end", self.config.base_url))
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(call_id, "gateway session ended");
            }
            Ok(resp) => warn!(call_id, status = %resp.status(), "gateway session end rejected"),
            Err(e) => warn!(call_id, "gateway session end failed: {}", e),
        }
    }

    async fn attempt(&self, prompt: &str, session: Option<&str>) -> std::result::Result<String, AttemptError> {
        let mut body = json!({ "text": prompt });
        if let Some(key) = session {
            body["session"] = json!(key);
        }

        let response = self
            .http
            .post(format!("{}/conversation/process", self.config.base_url))
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AttemptError::Retryable(SpeechError::GatewayUnreachable { reason: e.to_string() })
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            AttemptError::Retryable(SpeechError::GatewayUnreachable { reason: e.to_string() })
        })?;

        if status.is_server_error() || is_locked_reply(&text) {
            return Err(AttemptError::Retryable(SpeechError::Gateway {
                status: status.as_u16(),
                reason: truncate(&text, 200),
            }));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(SpeechError::Gateway {
                status: status.as_u16(),
                reason: truncate(&text, 200),
            }));
        }

        let payload: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            AttemptError::Fatal(SpeechError::Gateway {
                status: status.as_u16(),
                reason: format!("unparseable body: {}", e),
            })
        })?;
        extract_speech(&payload).ok_or_else(|| {
            AttemptError::Fatal(SpeechError::Gateway {
                status: status.as_u16(),
                reason: "response missing speech payload".into(),
            })
        })
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn session_keys_are_derived_from_the_call_id() {
        assert_eq!(session_key("abc-123"), "claude-phone-abc-123");
        let retry = retry_session_key(&session_key("abc-123"), 1722500000000);
        assert_eq!(retry, "claude-phone-abc-123-retry-1722500000000");
    }

    #[test]
    fn locked_reply_detection_is_case_insensitive() {
        assert!(is_locked_reply("error: Session File Locked by another process"));
        assert!(!is_locked_reply("some other failure"));
    }

    #[test]
    fn prompt_composition_orders_personality_context_turn() {
        let composed = compose_prompt(Some("You are Morpheus."), "what time is it?");
        let personality_at = composed.find("You are Morpheus.").unwrap();
        let context_at = composed.find("live phone call").unwrap();
        let turn_at = composed.find("what time is it?").unwrap();
        assert!(personality_at < context_at && context_at < turn_at);

        let bare = compose_prompt(None, "hi");
        assert!(bare.contains("live phone call") && bare.ends_with("hi"));
    }

    #[test]
    fn speech_extraction_matches_the_gateway_envelope() {
        let payload = serde_json::json!({
            "response": { "speech": { "plain": { "speech": "It is noon." } } }
        });
        assert_eq!(extract_speech(&payload).unwrap(), "It is noon.");
        assert!(extract_speech(&serde_json::json!({"response": {}})).is_none());
    }

    /// One-connection-at-a-time HTTP stub that pops canned responses.
    async fn spawn_stub(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_task = hits.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = vec![0u8; 16384];
                let _ = sock.read(&mut buf).await;
                hits_in_task.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    const OK_BODY: &str =
        r#"{"response":{"speech":{"plain":{"speech":"All good."}}}}"#;

    #[tokio::test]
    async fn upstream_5xx_is_retried_exactly_once() {
        let (base, hits) = spawn_stub(vec![(500, "{}"), (200, OK_BODY)]).await;
        let bridge = AiBridge::new(AiBridgeConfig::new(base));

        let reply = bridge.ask("hello", Some("call-1"), None).await.unwrap();
        assert_eq!(reply, "All good.");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_fault_surfaces_the_error() {
        let (base, hits) = spawn_stub(vec![(500, "{}"), (503, "{}")]).await;
        let bridge = AiBridge::new(AiBridgeConfig::new(base));

        let err = bridge.ask("hello", Some("call-1"), None).await.unwrap_err();
        assert!(matches!(err, SpeechError::Gateway { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let (base, hits) = spawn_stub(vec![(404, "{}"), (200, OK_BODY)]).await;
        let bridge = AiBridge::new(AiBridgeConfig::new(base));

        let err = bridge.ask("hello", None, None).await.unwrap_err();
        assert!(matches!(err, SpeechError::Gateway { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn locked_session_body_triggers_the_retry() {
        let (base, hits) =
            spawn_stub(vec![(200, r#"{"error":"session file locked"}"#), (200, OK_BODY)]).await;
        let bridge = AiBridge::new(AiBridgeConfig::new(base));

        let reply = bridge.ask("hello", Some("call-2"), None).await.unwrap();
        assert_eq!(reply, "All good.");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
