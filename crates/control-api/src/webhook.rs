//! Webhook egress
//!
//! Sessions that were created with a webhook URL get every state transition
//! POSTed to it. Delivery is strictly best-effort: five seconds per
//! attempt, failures logged, never retried, never allowed to slow a call.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use voxbridge_call_engine::session::SessionEvent;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Consume session events until the engine shuts down.
pub fn spawn_delivery(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
    let client = reqwest::Client::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(url) = event.webhook_url.clone() else {
                continue;
            };
            let client = client.clone();
            tokio::spawn(async move {
                deliver(&client, &url, &event).await;
            });
        }
    })
}

pub fn payload(event: &SessionEvent) -> serde_json::Value {
    let mut body = json!({
        "callId": event.call_id,
        "timestamp": event.timestamp.to_rfc3339(),
        "event": event.event,
        "to": event.to,
        "duration": event.duration,
    });
    if let Some(reason) = &event.reason {
        body["reason"] = json!(reason);
    }
    body
}

async fn deliver(client: &reqwest::Client, url: &str, event: &SessionEvent) {
    let result = client
        .post(url)
        .timeout(DELIVERY_TIMEOUT)
        .json(&payload(event))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            debug!(call_id = %event.call_id, event = %event.event, "webhook delivered");
        }
        Ok(response) => {
            warn!(call_id = %event.call_id, %url, status = %response.status(), "webhook rejected");
        }
        Err(e) => {
            warn!(call_id = %event.call_id, %url, "webhook delivery failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn payload_carries_the_event_shape() {
        let event = SessionEvent {
            call_id: "abc".into(),
            event: "failed".into(),
            to: "+15551234567".into(),
            webhook_url: Some("http://hook".into()),
            duration: Some(12),
            reason: Some("busy".into()),
            timestamp: Utc::now(),
        };
        let body = payload(&event);
        assert_eq!(body["callId"], "abc");
        assert_eq!(body["event"], "failed");
        assert_eq!(body["duration"], 12);
        assert_eq!(body["reason"], "busy");

        let clean = SessionEvent { reason: None, ..event };
        assert!(payload(&clean).get("reason").is_none());
    }
}
