//! Synchronous device personality queries
//!
//! `POST /api/query` asks a device's personality a question and waits for
//! the answer. In JSON mode the system prompt instructs the model to emit a
//! single raw JSON object; models wrap JSON in code fences anyway often
//! enough that the fences are stripped defensively, and a parse failure
//! earns one strict "JSON only" repair retry before giving up with a 422.

use std::time::Duration;

use serde_json::Value;

use voxbridge_call_engine::device::Device;

/// Directive injected into the system prompt for `format=json`
pub const JSON_DIRECTIVE: &str = "Respond with a single raw JSON object only. \
No code fences, no prose, no explanation - just the JSON.";

/// Stricter prompt used for the one repair retry
pub const JSON_REPAIR_DIRECTIVE: &str = "Your previous output was not parseable JSON. \
Respond again with ONLY the raw JSON object. Do not include anything else.";

/// Strip leading/trailing Markdown code fences (``` or ```json) from a
/// model reply.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening fence line
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest.trim())
}

/// Parse a (possibly fenced) model reply as a JSON object.
pub fn parse_model_json(raw: &str) -> Option<Value> {
    let candidate = strip_fences(raw);
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) if value.is_object() || value.is_array() => Some(value),
        _ => None,
    }
}

/// System prompt for a query against a device personality.
pub fn query_prompt(device: &Device, json_mode: bool, repair: bool) -> String {
    let mut prompt = String::new();
    if !device.personality.is_empty() {
        prompt.push_str(&device.personality);
        prompt.push_str("\n\n");
    }
    if json_mode {
        prompt.push_str(if repair { JSON_REPAIR_DIRECTIVE } else { JSON_DIRECTIVE });
    }
    prompt
}

/// Clamp a requested query timeout to the allowed window.
pub fn clamp_timeout(requested: Option<u64>) -> Duration {
    Duration::from_secs(requested.unwrap_or(30).clamp(1, 120))
}
