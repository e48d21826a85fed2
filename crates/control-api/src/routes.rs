//! Route table and handlers

use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use voxbridge_call_engine::CallMode;
use voxbridge_speech_core::SpeechError;

use crate::error::ApiError;
use crate::query;
use crate::state::AppState;

const MAX_AUDIO_UPLOAD: usize = 10 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let static_dir = state.static_dir.clone();
    Router::new()
        .route("/api/outbound-call", post(outbound_call))
        .route("/api/call/{call_id}", get(call_status))
        .route("/api/call/{call_id}/hangup", post(hangup_call))
        .route("/api/calls", get(list_calls))
        .route("/api/query", post(personality_query))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/reload", post(reload_devices))
        .route("/healthz", get(healthz))
        .route("/audio", post(upload_audio).layer(DefaultBodyLimit::max(MAX_AUDIO_UPLOAD)))
        .route("/audio-files/{file}", get(serve_audio))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// E.164 (`+` and 7-15 digits) or a bare 3-6 digit extension
pub fn is_valid_target(to: &str) -> bool {
    if let Some(digits) = to.strip_prefix('+') {
        return (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
    }
    (3..=6).contains(&to.len()) && to.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboundCallBody {
    to: String,
    message: String,
    mode: Option<String>,
    device: Option<String>,
    /// Accepted for contract compatibility; the From identity always comes
    /// from the device
    caller_id: Option<String>,
    timeout_seconds: Option<u64>,
    webhook_url: Option<String>,
    /// Opaque caller-supplied context, accepted but not interpreted
    context: Option<serde_json::Value>,
}

async fn outbound_call(
    State(state): State<AppState>,
    Json(body): Json<OutboundCallBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_target(&body.to) {
        return Err(ApiError::BadRequest(
            "to must be E.164 (+ and 7-15 digits) or a 3-6 digit extension".into(),
        ));
    }
    if body.message.is_empty() || body.message.len() > 1000 {
        return Err(ApiError::BadRequest("message length must be 1-1000".into()));
    }
    let mode = match body.mode.as_deref() {
        None | Some("announce") => CallMode::Announce,
        Some("conversation") => CallMode::Conversation,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "mode must be announce or conversation, got {:?}",
                other
            )));
        }
    };
    let timeout_seconds = body.timeout_seconds.unwrap_or(30);
    if !(5..=120).contains(&timeout_seconds) {
        return Err(ApiError::BadRequest("timeoutSeconds must be within [5,120]".into()));
    }
    if let Some(caller_id) = &body.caller_id {
        debug!(%caller_id, "callerId accepted; From identity comes from the device");
    }
    if body.context.is_some() {
        debug!("context accepted, not interpreted");
    }

    let call_id = state.engine.place_call(
        &body.to,
        &body.message,
        mode,
        body.device.as_deref(),
        Duration::from_secs(timeout_seconds),
        body.webhook_url,
    )?;
    info!(%call_id, to = %body.to, "outbound call queued");

    Ok(Json(json!({ "success": true, "callId": call_id, "status": "queued" })))
}

async fn call_status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.engine.call_snapshot(&call_id).await {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(format!("call {}", call_id))),
    }
}

async fn hangup_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.hangup(&call_id)?;
    Ok(Json(json!({ "success": true, "callId": call_id })))
}

async fn list_calls(State(state): State<AppState>) -> impl IntoResponse {
    let calls = state.engine.list_calls().await;
    Json(json!({ "success": true, "count": calls.len(), "calls": calls }))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices: Vec<_> = state
        .engine
        .devices
        .all()
        .into_iter()
        .map(|device| {
            json!({
                "name": device.name,
                "extension": device.extension,
                "language": device.language,
            })
        })
        .collect();
    Json(json!({ "success": true, "devices": devices }))
}

async fn reload_devices(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let count = state.engine.reload_devices()?;
    Ok(Json(json!({ "success": true, "devices": count })))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "ready": state.engine.is_ready(),
        "devices": state.engine.devices.all().len(),
        "activeCalls": state.engine.sessions.active_count(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    target: String,
    query: String,
    format: Option<String>,
    timeout: Option<u64>,
    required_fields: Option<Vec<String>>,
}

async fn personality_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let json_mode = match body.format.as_deref() {
        None | Some("text") => false,
        Some("json") => true,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("format must be text or json, got {:?}", other)));
        }
    };
    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let device = state
        .engine
        .devices
        .find(&body.target)
        .ok_or_else(|| ApiError::NotFound(format!("device {}", body.target)))?;

    let budget = query::clamp_timeout(body.timeout);
    let started = Instant::now();
    let ai = &state.engine.speech.ai;

    let prompt = query::query_prompt(&device, json_mode, false);
    let raw = ask_with_budget(ai, &body.query, &prompt, budget).await?;

    let (raw, data) = if json_mode {
        match validate_payload(&raw, body.required_fields.as_deref()) {
            Some(data) => (raw, Some(data)),
            None => {
                // One strict repair retry before giving up
                warn!(target = %body.target, "model output not JSON, repairing");
                let repair_prompt = query::query_prompt(&device, true, true);
                let retry_raw = ask_with_budget(ai, &body.query, &repair_prompt, budget).await?;
                match validate_payload(&retry_raw, body.required_fields.as_deref()) {
                    Some(data) => (retry_raw, Some(data)),
                    None => return Err(ApiError::UnparseableModelOutput { raw: retry_raw }),
                }
            }
        }
    } else {
        (raw, None)
    };

    Ok(Json(json!({
        "success": true,
        "device": { "name": device.name, "extension": device.extension },
        "response": {
            "raw": raw,
            "data": data,
            "format": if json_mode { "json" } else { "text" },
        },
        "meta": { "duration_ms": started.elapsed().as_millis() as u64 },
    })))
}

async fn ask_with_budget(
    ai: &voxbridge_speech_core::AiBridge,
    question: &str,
    prompt: &str,
    budget: Duration,
) -> Result<String, ApiError> {
    let device_prompt = (!prompt.is_empty()).then_some(prompt);
    match tokio::time::timeout(budget, ai.ask(question, None, device_prompt)).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(SpeechError::GatewayUnreachable { reason })) => Err(ApiError::NotReady(reason)),
        Ok(Err(e)) => Err(ApiError::Internal(e.to_string())),
        Err(_) => Err(ApiError::Internal(format!("query timed out after {:?}", budget))),
    }
}

/// Parse and, when a required-fields list is supplied, shape-check the
/// model's JSON.
fn validate_payload(raw: &str, required_fields: Option<&[String]>) -> Option<serde_json::Value> {
    let data = query::parse_model_json(raw)?;
    if let Some(required) = required_fields {
        let object = data.as_object()?;
        if !required.iter().all(|field| object.contains_key(field)) {
            return None;
        }
    }
    Some(data)
}

async fn upload_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty audio body".into()));
    }
    let extension = match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some("audio/wav") | Some("audio/x-wav") => "wav",
        Some("audio/mpeg") | Some("audio/mp3") => "mp3",
        Some("audio/ogg") => "ogg",
        _ => "bin",
    };
    let saved = state
        .store
        .save(&body, extension)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "success": true, "url": saved.url })))
}

async fn serve_audio(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .store
        .resolve(&file)
        .ok_or_else(|| ApiError::NotFound(format!("audio file {}", file)))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("read {}: {}", path.display(), e)))?;

    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_validation_accepts_e164_and_extensions() {
        assert!(is_valid_target("+15551234567"));
        assert!(is_valid_target("+442071234567"));
        assert!(is_valid_target("12611"));
        assert!(is_valid_target("200"));

        assert!(!is_valid_target("+1"));
        assert!(!is_valid_target("12"));
        assert!(!is_valid_target("1234567"));
        assert!(!is_valid_target("+1555123456789012"));
        assert!(!is_valid_target("call-me"));
        assert!(!is_valid_target(""));
    }
}
