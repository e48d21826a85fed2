//! Audio-fork WebSocket server
//!
//! The media engine duplicates each call's caller audio to this server as a
//! stream of raw 16-bit PCM frames. One WebSocket connection carries one
//! call; the trailing path segment of the connection URL is the call id.
//!
//! An optional leading text frame may carry JSON metadata
//! (`{"sampleRate": 16000}`); everything after that is binary PCM. Each
//! connection gets its own [`UtteranceFramer`] and emits accepted
//! utterances through the [`ForkHandle`] held by the conversation loop.
//!
//! The loop usually knows a fork is coming before the engine connects, so it
//! pre-registers an expectation for the call id. A connection with no
//! matching expectation is still accepted and surfaced as a [`ForkEvent`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{MediaCoreError, Result};
use crate::utterance::{Utterance, UtteranceFramer};
use crate::vad::VadConfig;

/// Audio-fork server configuration
#[derive(Debug, Clone)]
pub struct ForkConfig {
    /// Listen address for fork connections
    pub bind_addr: SocketAddr,
    /// VAD/framing parameters applied to every session
    pub vad: VadConfig,
    /// Sample rate assumed until a metadata frame says otherwise
    pub default_sample_rate: u32,
    /// How long `wait_for` blocks before giving up on a fork connection
    pub expectation_timeout: Duration,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8077".parse().unwrap(),
            vad: VadConfig::default(),
            default_sample_rate: 16_000,
            expectation_timeout: Duration::from_secs(8),
        }
    }
}

/// Text frames on the fork socket: a leading metadata frame, and in-band
/// DTMF reports from engines that detect keypad digits
#[derive(Debug, serde::Deserialize)]
struct ForkTextFrame {
    #[serde(rename = "sampleRate")]
    sample_rate: Option<u32>,
    dtmf: Option<String>,
}

/// Consumer end of one fork session
///
/// Owned by the conversation loop of the call it belongs to. Dropping the
/// handle detaches the loop from the session; the session itself lives until
/// the engine closes the connection.
pub struct ForkHandle {
    call_id: String,
    capture: Arc<AtomicBool>,
    finalize: Arc<Notify>,
    utterances: mpsc::Receiver<Utterance>,
}

impl ForkHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Gate caller-audio capture. Disabled while the bot is speaking so TTS
    /// playback cannot loop back into the recognizer.
    pub fn set_capture(&self, enabled: bool) {
        self.capture.store(enabled, Ordering::Relaxed);
    }

    /// Cut the in-progress utterance now (keypad `#` handling).
    pub fn force_finalize(&self) {
        self.finalize.notify_one();
    }

    /// Next accepted utterance, or `None` once the fork connection closed.
    pub async fn next_utterance(&mut self) -> Option<Utterance> {
        self.utterances.recv().await
    }
}

impl std::fmt::Debug for ForkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkHandle")
            .field("call_id", &self.call_id)
            .field("capture", &self.capture.load(Ordering::Relaxed))
            .finish()
    }
}

/// Sessions that arrived without a pre-registered expectation
#[derive(Debug)]
pub enum ForkEvent {
    /// A fork connected for a call id nobody was waiting on
    UnexpectedSession(ForkHandle),
}

/// Clonable registry used to wait for a fork connection by call id
#[derive(Clone)]
pub struct ForkExpectations {
    pending: Arc<DashMap<String, oneshot::Sender<ForkHandle>>>,
    timeout: Duration,
}

/// A registered expectation: redeem with [`ForkTicket::wait`]
pub struct ForkTicket {
    call_id: String,
    rx: oneshot::Receiver<ForkHandle>,
    pending: Arc<DashMap<String, oneshot::Sender<ForkHandle>>>,
    timeout: Duration,
}

impl ForkTicket {
    /// Wait for the engine to connect the fork. A timeout is non-fatal to
    /// the call (it just means no caller audio) and surfaces as
    /// [`MediaCoreError::ExpectationTimeout`].
    pub async fn wait(self) -> Result<ForkHandle> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(handle)) => Ok(handle),
            // Sender dropped without sending only happens on server shutdown
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&self.call_id);
                Err(MediaCoreError::ExpectationTimeout {
                    call_id: self.call_id,
                    waited_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl ForkExpectations {
    /// Register interest in `call_id` *now*, before telling the media engine
    /// to fork, so a fast-connecting fork cannot race past the caller.
    pub fn expect(&self, call_id: &str) -> ForkTicket {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.to_string(), tx);
        ForkTicket {
            call_id: call_id.to_string(),
            rx,
            pending: self.pending.clone(),
            timeout: self.timeout,
        }
    }

    /// Register and wait in one step.
    pub async fn wait_for(&self, call_id: &str) -> Result<ForkHandle> {
        self.expect(call_id).wait().await
    }

    fn fulfill(&self, call_id: &str, handle: ForkHandle) -> std::result::Result<(), ForkHandle> {
        if let Some((_, tx)) = self.pending.remove(call_id) {
            tx.send(handle)
        } else {
            Err(handle)
        }
    }
}

/// The audio-fork WebSocket server
pub struct AudioForkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ForkConfig,
    expectations: ForkExpectations,
    events_tx: mpsc::UnboundedSender<ForkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ForkEvent>>,
}

impl AudioForkServer {
    /// Bind the listening socket. Pass port 0 to let the OS pick (tests).
    pub async fn bind(config: ForkConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            MediaCoreError::Bind { addr: config.bind_addr.to_string(), reason: e.to_string() }
        })?;
        let local_addr = listener.local_addr().map_err(|e| MediaCoreError::Bind {
            addr: config.bind_addr.to_string(),
            reason: e.to_string(),
        })?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            local_addr,
            expectations: ForkExpectations {
                pending: Arc::new(DashMap::new()),
                timeout: config.expectation_timeout,
            },
            config,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Expectation registry shared with the conversation loops
    pub fn expectations(&self) -> ForkExpectations {
        self.expectations.clone()
    }

    /// Receiver for sessions nobody was waiting on. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ForkEvent>> {
        self.events_rx.take()
    }

    /// Run the accept loop until the task is aborted.
    pub async fn run(self) {
        info!("audio fork server listening on {}", self.local_addr);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let config = self.config.clone();
                    let expectations = self.expectations.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, config, expectations, events).await {
                            warn!(%peer, "fork connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("fork accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: ForkConfig,
    expectations: ForkExpectations,
    events: mpsc::UnboundedSender<ForkEvent>,
) -> Result<()> {
    // Capture the request path during the handshake; its trailing segment is
    // the call id the engine stamped on the fork.
    let path: Arc<std::sync::OnceLock<String>> = Arc::new(std::sync::OnceLock::new());
    let path_in_cb = path.clone();

    let mut ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &http::Request<()>, resp| {
        let _ = path_in_cb.set(req.uri().path().to_string());
        Ok(resp)
    })
    .await
    .map_err(|e| MediaCoreError::Handshake { reason: e.to_string() })?;

    let call_id = path
        .get()
        .map(|p| p.trim_matches('/').rsplit('/').next().unwrap_or("").to_string())
        .unwrap_or_default();
    if call_id.is_empty() {
        warn!(%peer, "fork connection without call id, closing");
        let _ = ws.close(None).await;
        return Ok(());
    }

    let capture = Arc::new(AtomicBool::new(true));
    let finalize = Arc::new(Notify::new());
    let (utter_tx, utter_rx) = mpsc::channel(32);

    let handle = ForkHandle {
        call_id: call_id.clone(),
        capture: capture.clone(),
        finalize: finalize.clone(),
        utterances: utter_rx,
    };

    match expectations.fulfill(&call_id, handle) {
        Ok(()) => debug!(%call_id, %peer, "fork session matched a waiting call"),
        Err(handle) => {
            debug!(%call_id, %peer, "fork session with no waiting call");
            let _ = events.send(ForkEvent::UnexpectedSession(handle));
        }
    }

    let mut framer = UtteranceFramer::new(&call_id, config.default_sample_rate, config.vad.clone());
    let mut chunks: u64 = 0;
    let mut emitted: u64 = 0;

    loop {
        tokio::select! {
            _ = finalize.notified() => {
                if let Some(u) = framer.force_finalize() {
                    emitted += 1;
                    if utter_tx.send(u).await.is_err() {
                        break;
                    }
                }
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<ForkTextFrame>(text.as_str()) {
                            if let Some(rate) = frame.sample_rate {
                                debug!(%call_id, rate, "fork metadata frame");
                                framer.set_sample_rate(rate);
                            }
                            // Keypad '#' cuts the utterance short
                            if frame.dtmf.as_deref().is_some_and(|d| d.contains('#')) {
                                if let Some(u) = framer.force_finalize() {
                                    emitted += 1;
                                    let _ = utter_tx.send(u).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        chunks += 1;
                        if capture.load(Ordering::Relaxed) {
                            if let Some(u) = framer.push(&data[..]) {
                                emitted += 1;
                                // Consumer may be gone; keep draining anyway
                                let _ = utter_tx.send(u).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(p))) => {
                        let _ = ws.send(Message::Pong(p)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(MediaCoreError::Transport { reason: e.to_string() });
                    }
                }
            }
        }
    }

    info!(%call_id, chunks, emitted, "fork session closed");
    Ok(())
}
