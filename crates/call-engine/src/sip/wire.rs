//! Wire client to the signaling server's admin socket
//!
//! The external signaling server owns SIP parsing, transactions and digest
//! auth. This client speaks its admin protocol: newline-delimited JSON
//! frames over TCP, authenticated by a shared secret, with request ids
//! correlating responses and unsolicited frames carrying inbound INVITEs
//! and dialog teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use super::{
    IncomingInvite, InviteProgress, InviteRequest, InviteTransaction, RegisterGrant,
    RegisterRequest, SipDialog, SipStack,
};
use crate::error::{CallEngineError, Result};

struct DialogState {
    destroyed_tx: watch::Sender<bool>,
}

struct WireInner {
    writer: Mutex<OwnedWriteHalf>,
    next_id: AtomicU64,
    pending_register: DashMap<u64, oneshot::Sender<Result<RegisterGrant>>>,
    pending_invite: DashMap<u64, mpsc::Sender<InviteProgress>>,
    dialogs: DashMap<String, Arc<DialogState>>,
    incoming_tx: mpsc::Sender<IncomingInvite>,
}

impl WireInner {
    async fn send(&self, frame: Value) -> Result<()> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CallEngineError::SipTransport { reason: e.to_string() })
    }

    fn dialog_state(&self, dialog_id: &str) -> Arc<DialogState> {
        self.dialogs
            .entry(dialog_id.to_string())
            .or_insert_with(|| {
                let (destroyed_tx, _) = watch::channel(false);
                Arc::new(DialogState { destroyed_tx })
            })
            .clone()
    }
}

/// SIP capability over the signaling server's admin socket
pub struct WireSipStack {
    inner: Arc<WireInner>,
    incoming_rx: Mutex<mpsc::Receiver<IncomingInvite>>,
}

impl WireSipStack {
    /// Connect and authenticate. The read loop runs until the socket drops;
    /// reconnection is the supervisor's job, not this client's.
    pub async fn connect(host: &str, port: u16, secret: &str) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| CallEngineError::SipTransport {
                reason: format!("connect {}:{}: {}", host, port, e),
            })?;
        let (read_half, write_half) = stream.into_split();

        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let inner = Arc::new(WireInner {
            writer: Mutex::new(write_half),
            next_id: AtomicU64::new(1),
            pending_register: DashMap::new(),
            pending_invite: DashMap::new(),
            dialogs: DashMap::new(),
            incoming_tx,
        });

        inner.send(json!({ "type": "auth", "secret": secret })).await?;
        info!("connected to signaling server at {}:{}", host, port);

        tokio::spawn(read_loop(read_half, inner.clone()));
        Ok(Self { inner, incoming_rx: Mutex::new(incoming_rx) })
    }
}

async fn read_loop(read_half: OwnedReadHalf, inner: Arc<WireInner>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("signaling socket read failed: {}", e);
                break;
            }
        };
        let frame: Value = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unparseable signaling frame: {}", e);
                continue;
            }
        };
        dispatch(&inner, frame).await;
    }

    warn!("signaling server connection closed");
    // Every open dialog is gone with the transport
    for entry in inner.dialogs.iter() {
        let _ = entry.value().destroyed_tx.send(true);
    }
    inner.pending_register.clear();
    inner.pending_invite.clear();
}

async fn dispatch(inner: &Arc<WireInner>, frame: Value) {
    let kind = frame["type"].as_str().unwrap_or_default();
    match kind {
        "registered" => {
            let id = frame["id"].as_u64().unwrap_or_default();
            if let Some((_, reply)) = inner.pending_register.remove(&id) {
                let expires_text = match &frame["expires"] {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                };
                let granted = super::parse_granted_expiry(
                    frame["contact"].as_str(),
                    expires_text.as_deref(),
                    frame["requested"].as_u64().unwrap_or(3600) as u32,
                );
                let _ = reply.send(Ok(RegisterGrant { granted_expires: granted }));
            }
        }
        "register_failed" => {
            let id = frame["id"].as_u64().unwrap_or_default();
            if let Some((_, reply)) = inner.pending_register.remove(&id) {
                let _ = reply.send(Err(CallEngineError::SipTransport {
                    reason: format!(
                        "register rejected ({}): {}",
                        frame["code"].as_u64().unwrap_or(0),
                        frame["reason"].as_str().unwrap_or("unknown")
                    ),
                }));
            }
        }
        "progress" => {
            let id = frame["id"].as_u64().unwrap_or_default();
            if frame["code"].as_u64() == Some(180) {
                if let Some(tx) = inner.pending_invite.get(&id) {
                    let _ = tx.try_send(InviteProgress::Ringing);
                }
            }
        }
        "answered" => {
            let id = frame["id"].as_u64().unwrap_or_default();
            let dialog_id = frame["dialog"].as_str().unwrap_or_default().to_string();
            let remote_sdp = frame["sdp"].as_str().unwrap_or_default().to_string();
            if let Some((_, tx)) = inner.pending_invite.remove(&id) {
                let state = inner.dialog_state(&dialog_id);
                let dialog = WireDialog { id: dialog_id, inner: inner.clone(), state };
                let _ = tx.try_send(InviteProgress::Answered { dialog: Box::new(dialog), remote_sdp });
            }
        }
        "invite_failed" => {
            let id = frame["id"].as_u64().unwrap_or_default();
            if let Some((_, tx)) = inner.pending_invite.remove(&id) {
                let _ = tx.try_send(InviteProgress::Failed {
                    code: frame["code"].as_u64().unwrap_or(500) as u16,
                    reason: frame["reason"].as_str().unwrap_or("unknown").to_string(),
                });
            }
        }
        "invite_in" => {
            let dialog_id = frame["dialog"].as_str().unwrap_or_default().to_string();
            let invite = IncomingInvite {
                to_extension: frame["to"].as_str().unwrap_or_default().to_string(),
                from: frame["from"].as_str().unwrap_or_default().to_string(),
                remote_sdp: frame["sdp"].as_str().unwrap_or_default().to_string(),
                transaction: Box::new(WireTransaction { dialog_id, inner: inner.clone() }),
            };
            if inner.incoming_tx.send(invite).await.is_err() {
                warn!("dropping inbound INVITE: engine not consuming");
            }
        }
        "dialog_destroyed" => {
            let dialog_id = frame["dialog"].as_str().unwrap_or_default();
            debug!(dialog = dialog_id, "dialog destroyed");
            if let Some((_, state)) = inner.dialogs.remove(dialog_id) {
                let _ = state.destroyed_tx.send(true);
            }
        }
        other => debug!(kind = other, "ignoring signaling frame"),
    }
}

#[async_trait]
impl SipStack for WireSipStack {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterGrant> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending_register.insert(id, reply_tx);

        self.inner
            .send(json!({
                "type": "register",
                "id": id,
                "aor": request.aor,
                "contact": request.contact,
                "registrar": request.registrar,
                "expires": request.expires,
                "username": request.credentials.username,
                "password": request.credentials.password,
            }))
            .await?;

        reply_rx
            .await
            .map_err(|_| CallEngineError::SipTransport { reason: "signaling connection lost".into() })?
    }

    async fn invite(&self, request: InviteRequest) -> Result<mpsc::Receiver<InviteProgress>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(4);
        self.inner.pending_invite.insert(id, tx);

        let mut frame = json!({
            "type": "invite",
            "id": id,
            "target": request.target_uri,
            "from": request.from_uri,
            "sdp": request.local_sdp,
            "proxy": request.proxy,
        });
        if let Some(display) = &request.display_name {
            frame["display"] = json!(display);
        }
        if let Some(creds) = &request.credentials {
            frame["username"] = json!(creds.username);
            frame["password"] = json!(creds.password);
        }
        self.inner.send(frame).await?;
        Ok(rx)
    }

    async fn next_incoming(&self) -> Option<IncomingInvite> {
        self.incoming_rx.lock().await.recv().await
    }
}

struct WireTransaction {
    dialog_id: String,
    inner: Arc<WireInner>,
}

#[async_trait]
impl InviteTransaction for WireTransaction {
    async fn ringing(&mut self) -> Result<()> {
        self.inner.send(json!({ "type": "ringing", "dialog": self.dialog_id })).await
    }

    async fn answer(&mut self, local_sdp: &str) -> Result<Box<dyn SipDialog>> {
        self.inner
            .send(json!({ "type": "answer", "dialog": self.dialog_id, "sdp": local_sdp }))
            .await?;
        let state = self.inner.dialog_state(&self.dialog_id);
        Ok(Box::new(WireDialog {
            id: self.dialog_id.clone(),
            inner: self.inner.clone(),
            state,
        }))
    }

    async fn reject(&mut self, code: u16) -> Result<()> {
        self.inner.send(json!({ "type": "reject", "dialog": self.dialog_id, "code": code })).await
    }
}

struct WireDialog {
    id: String,
    inner: Arc<WireInner>,
    state: Arc<DialogState>,
}

#[async_trait]
impl SipDialog for WireDialog {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn hangup(&self) -> Result<()> {
        self.inner.send(json!({ "type": "hangup", "dialog": self.id })).await
    }

    async fn wait_destroyed(&self) {
        let mut rx = self.state.destroyed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
