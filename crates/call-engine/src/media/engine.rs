//! Wire client to the media engine's admin WebSocket
//!
//! Commands are JSON frames correlated by request id over one persistent
//! WebSocket, authenticated by a shared secret. Playback is the only
//! long-running command: its response frame arrives when playback ends, and
//! a `stop` command makes the engine end it early.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{MediaEndpoint, MediaEngine};
use crate::error::{CallEngineError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct AdminInner {
    sink: Mutex<WsSink>,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Value>>,
}

impl AdminInner {
    async fn request(&self, mut frame: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        frame["id"] = json!(id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        self.sink
            .lock()
            .await
            .send(Message::text(frame.to_string()))
            .await
            .map_err(|e| CallEngineError::Media { reason: e.to_string() })?;

        let reply = rx
            .await
            .map_err(|_| CallEngineError::Media { reason: "media engine connection lost".into() })?;
        if reply["ok"].as_bool() == Some(true) {
            Ok(reply)
        } else {
            Err(CallEngineError::Media {
                reason: reply["error"].as_str().unwrap_or("command failed").to_string(),
            })
        }
    }

    /// Fire-and-forget command (stop), used from sync context.
    fn send_nowait(self: &Arc<Self>, frame: Value) {
        let inner = self.clone();
        tokio::spawn(async move {
            let _ = inner.sink.lock().await.send(Message::text(frame.to_string())).await;
        });
    }
}

/// Media capability over the engine's admin WebSocket
pub struct RemoteMediaEngine {
    inner: Arc<AdminInner>,
}

impl RemoteMediaEngine {
    pub async fn connect(host: &str, port: u16, secret: &str) -> Result<Self> {
        let url = format!("ws://{}:{}/admin", host, port);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CallEngineError::Media { reason: format!("connect {}: {}", url, e) })?;
        let (sink, mut stream) = ws.split();

        let inner = Arc::new(AdminInner {
            sink: Mutex::new(sink),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        });

        inner
            .sink
            .lock()
            .await
            .send(Message::text(json!({ "cmd": "auth", "secret": secret }).to_string()))
            .await
            .map_err(|e| CallEngineError::Media { reason: e.to_string() })?;
        info!("connected to media engine at {}", url);

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame: Value = match message {
                    Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("unparseable media frame: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                if let Some(id) = frame["id"].as_u64() {
                    if let Some((_, tx)) = reader_inner.pending.remove(&id) {
                        let _ = tx.send(frame);
                    }
                }
            }
            warn!("media engine connection closed");
            reader_inner.pending.clear();
        });

        Ok(Self { inner })
    }
}

#[async_trait]
impl MediaEngine for RemoteMediaEngine {
    async fn create_endpoint(&self) -> Result<Box<dyn MediaEndpoint>> {
        let reply = self.inner.request(json!({ "cmd": "create" })).await?;
        let endpoint_id = reply["endpoint"]
            .as_str()
            .ok_or_else(|| CallEngineError::Media { reason: "create reply missing endpoint".into() })?
            .to_string();
        let local_sdp = reply["sdp"].as_str().unwrap_or_default().to_string();
        debug!(endpoint = %endpoint_id, "media endpoint created");

        Ok(Box::new(RemoteEndpoint {
            id: endpoint_id,
            local_sdp,
            inner: self.inner.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct RemoteEndpoint {
    id: String,
    local_sdp: String,
    inner: Arc<AdminInner>,
    destroyed: AtomicBool,
}

#[async_trait]
impl MediaEndpoint for RemoteEndpoint {
    fn local_sdp(&self) -> String {
        self.local_sdp.clone()
    }

    async fn modify(&self, remote_sdp: &str) -> Result<()> {
        self.inner
            .request(json!({ "cmd": "modify", "endpoint": self.id, "sdp": remote_sdp }))
            .await
            .map(|_| ())
    }

    async fn play(&self, url: &str) -> Result<()> {
        self.inner
            .request(json!({ "cmd": "play", "endpoint": self.id, "url": url }))
            .await
            .map(|_| ())
    }

    async fn fork_audio(&self, ws_url: &str, call_id: &str) -> Result<()> {
        self.inner
            .request(json!({
                "cmd": "fork",
                "endpoint": self.id,
                "ws_url": ws_url,
                "call_id": call_id,
            }))
            .await
            .map(|_| ())
    }

    fn cancel_playback(&self) {
        self.inner.send_nowait(json!({ "cmd": "stop", "endpoint": self.id }));
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.request(json!({ "cmd": "destroy", "endpoint": self.id })).await {
            warn!(endpoint = %self.id, "endpoint destroy failed: {}", e);
        }
    }
}
