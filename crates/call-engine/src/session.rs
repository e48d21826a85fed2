//! Call sessions and the per-call state machine
//!
//! A [`CallSession`] is the authoritative record for one call. All mutation
//! goes through a per-call mailbox task, so exactly one transition is in
//! flight per call id and readers always observe a coherent record.
//!
//! Terminal states are absorbing. A terminal transition emits a
//! [`SessionEvent`] (consumed by webhook delivery) and starts the grace
//! window during which status queries still resolve; the evictor removes the
//! session afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::error::{CallEngineError, Result};

/// Process-unique call identifier. Generated at session creation; this is
/// never the SIP Call-ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Play one message and hang up (outbound only)
    Announce,
    /// Full conversation loop
    Conversation,
}

/// Reason a call ended in FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Busy,
    NoAnswer,
    NotFound,
    Rejected,
    ServiceUnavailable,
    AuthFailed,
    AiUnavailable,
    MediaFailed,
    Internal,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailReason::Busy => "busy",
            FailReason::NoAnswer => "no_answer",
            FailReason::NotFound => "not_found",
            FailReason::Rejected => "rejected",
            FailReason::ServiceUnavailable => "service_unavailable",
            FailReason::AuthFailed => "auth_failed",
            FailReason::AiUnavailable => "ai_unavailable",
            FailReason::MediaFailed => "media_failed",
            FailReason::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Per-call state machine states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Created,
    /// Outbound INVITE sent, nothing heard yet
    Dialing,
    /// 180 received (outbound) or INVITE received (inbound)
    Ringing,
    /// Inbound only: local 200 OK sent
    Accepted,
    /// Media is up
    Answered,
    /// Bot audio is playing
    Speaking,
    /// Waiting on caller audio
    Listening,
    /// Clean end
    Completed,
    /// Terminated with a reason
    Failed(FailReason),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed(_))
    }

    /// Lowercase name used in webhooks and the status API
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Created => "created",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Answered => "answered",
            CallState::Speaking => "speaking",
            CallState::Listening => "listening",
            CallState::Completed => "completed",
            CallState::Failed(_) => "failed",
        }
    }

    /// Legal transitions. Terminal states absorb everything; any live state
    /// may terminate.
    pub fn can_transition(&self, next: &CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (CallState::Created, CallState::Dialing)
                | (CallState::Created, CallState::Ringing)
                | (CallState::Dialing, CallState::Ringing)
                | (CallState::Dialing, CallState::Answered)
                | (CallState::Ringing, CallState::Accepted)
                | (CallState::Ringing, CallState::Answered)
                | (CallState::Accepted, CallState::Answered)
                | (CallState::Answered, CallState::Speaking)
                | (CallState::Answered, CallState::Listening)
                | (CallState::Speaking, CallState::Listening)
                | (CallState::Listening, CallState::Speaking)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Failed(reason) => write!(f, "failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// One (caller utterance, bot reply) pair
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub assistant: String,
}

/// Read-only view of a session for the status API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub direction: Direction,
    pub mode: CallMode,
    pub device: String,
    pub extension: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds since answer (live) or answer-to-end (terminal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub turn_count: usize,
    pub conversation: Vec<ConversationTurn>,
    #[serde(skip)]
    pub terminal: bool,
}

/// Emitted on every applied state transition
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub call_id: String,
    /// Lowercased state name
    pub event: String,
    pub to: String,
    pub webhook_url: Option<String>,
    pub duration: Option<u64>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

enum SessionCommand {
    Transition { to: CallState, reply: oneshot::Sender<Result<()>> },
    RecordTurn { user: String, assistant: String },
    Snapshot { reply: oneshot::Sender<CallSnapshot> },
}

/// The mailbox-owned record
struct CallSession {
    id: CallId,
    direction: Direction,
    mode: CallMode,
    device: Arc<Device>,
    remote: String,
    state: CallState,
    turns: Vec<ConversationTurn>,
    created_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    webhook_url: Option<String>,
}

impl CallSession {
    fn duration(&self) -> Option<u64> {
        let start = self.answered_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - start).num_seconds().max(0) as u64)
    }

    fn snapshot(&self) -> CallSnapshot {
        let reason = match &self.state {
            CallState::Failed(reason) => Some(reason.to_string()),
            _ => None,
        };
        CallSnapshot {
            call_id: self.id.to_string(),
            state: self.state.name().to_string(),
            reason,
            direction: self.direction,
            mode: self.mode,
            device: self.device.name.clone(),
            extension: self.device.extension.clone(),
            to: self.remote.clone(),
            created_at: self.created_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at,
            duration: self.duration(),
            turn_count: self.turns.len(),
            conversation: self.turns.clone(),
            terminal: self.state.is_terminal(),
        }
    }

    fn event(&self) -> SessionEvent {
        let reason = match &self.state {
            CallState::Failed(reason) => Some(reason.to_string()),
            _ => None,
        };
        SessionEvent {
            call_id: self.id.to_string(),
            event: self.state.name().to_string(),
            to: self.remote.clone(),
            webhook_url: self.webhook_url.clone(),
            duration: self.duration(),
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Clonable handle to one session's mailbox
#[derive(Clone)]
pub struct SessionHandle {
    pub id: CallId,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Apply a state transition through the mailbox. Illegal transitions and
    /// transitions on an evicted session error.
    pub async fn transition(&self, to: CallState) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Transition { to, reply })
            .map_err(|_| CallEngineError::NotFound { what: "call", id: self.id.to_string() })?;
        rx.await.map_err(|_| CallEngineError::internal("session mailbox dropped"))?
    }

    /// Terminate with a failure reason, tolerating already-terminal state.
    pub async fn fail(&self, reason: FailReason) {
        let _ = self.transition(CallState::Failed(reason)).await;
        self.cancel.cancel();
    }

    /// Clean completion, tolerating already-terminal state.
    pub async fn complete(&self) {
        let _ = self.transition(CallState::Completed).await;
        self.cancel.cancel();
    }

    pub fn record_turn(&self, user: impl Into<String>, assistant: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::RecordTurn { user: user.into(), assistant: assistant.into() });
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(SessionCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    /// Cancellation scope for everything spawned on behalf of this call
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative teardown (local hangup).
    pub fn hangup(&self) {
        self.cancel.cancel();
    }
}

/// Concurrent session table plus the terminal-session evictor
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    grace: Duration,
}

impl SessionRegistry {
    /// `events_tx` receives every state transition (webhook delivery).
    /// `grace` is how long terminal sessions stay queryable.
    pub fn new(events_tx: mpsc::UnboundedSender<SessionEvent>, grace: Duration) -> Self {
        Self { sessions: DashMap::new(), events_tx, grace }
    }

    /// Create a session and spawn its mailbox task.
    pub fn create(
        &self,
        direction: Direction,
        mode: CallMode,
        device: Arc<Device>,
        remote: impl Into<String>,
        webhook_url: Option<String>,
    ) -> SessionHandle {
        let id = CallId::generate();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { id: id.clone(), cmd_tx, cancel: CancellationToken::new() };

        let session = CallSession {
            id: id.clone(),
            direction,
            mode,
            device,
            remote: remote.into(),
            state: CallState::Created,
            turns: Vec::new(),
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            webhook_url,
        };

        let events_tx = self.events_tx.clone();
        tokio::spawn(run_mailbox(session, cmd_rx, events_tx));

        self.sessions.insert(id.to_string(), handle.clone());
        info!(call_id = %id, ?direction, ?mode, "call session created");
        handle
    }

    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    pub async fn snapshot(&self, call_id: &str) -> Option<CallSnapshot> {
        self.get(call_id)?.snapshot().await
    }

    /// All sessions still in the table: live ones plus terminal ones inside
    /// the grace window.
    pub async fn list(&self) -> Vec<CallSnapshot> {
        let handles: Vec<SessionHandle> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Evictor task: drops terminal sessions once their grace window lapses.
    pub fn spawn_evictor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                self.evict_stale().await;
            }
        })
    }

    async fn evict_stale(&self) {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::seconds(60));
        let handles: Vec<SessionHandle> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();

        for handle in handles {
            let Some(snapshot) = handle.snapshot().await else {
                self.sessions.remove(handle.id.as_str());
                continue;
            };
            if snapshot.terminal {
                let lapsed =
                    snapshot.ended_at.map(|ended| now - ended > grace).unwrap_or(true);
                if lapsed {
                    debug!(call_id = %handle.id, "evicting terminal session");
                    self.sessions.remove(handle.id.as_str());
                }
            }
        }
    }
}

async fn run_mailbox(
    mut session: CallSession,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(command) = cmd_rx.recv().await {
        match command {
            SessionCommand::Transition { to, reply } => {
                let result = apply_transition(&mut session, to, &events_tx);
                let _ = reply.send(result);
            }
            SessionCommand::RecordTurn { user, assistant } => {
                session.turns.push(ConversationTurn { timestamp: Utc::now(), user, assistant });
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(session.snapshot());
            }
        }
    }
    debug!(call_id = %session.id, "session mailbox closed");
}

fn apply_transition(
    session: &mut CallSession,
    to: CallState,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<()> {
    if !session.state.can_transition(&to) {
        // Duplicate terminal requests are routine during teardown races
        if session.state.is_terminal() && to.is_terminal() {
            return Ok(());
        }
        warn!(call_id = %session.id, from = %session.state, to = %to, "illegal transition rejected");
        return Err(CallEngineError::IllegalTransition {
            call_id: session.id.to_string(),
            from: session.state.to_string(),
            to: to.to_string(),
        });
    }

    debug!(call_id = %session.id, from = %session.state, to = %to, "state transition");
    session.state = to;
    match &session.state {
        CallState::Answered => session.answered_at = Some(Utc::now()),
        state if state.is_terminal() => session.ended_at = Some(Utc::now()),
        _ => {}
    }
    let _ = events_tx.send(session.event());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::DeviceRegistry;

    fn device() -> Arc<Device> {
        DeviceRegistry::new(
            &[DeviceConfig { extension: "12611".into(), name: "Morpheus".into(), ..Default::default() }],
            "en",
        )
        .get("12611")
    }

    fn registry() -> (Arc<SessionRegistry>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionRegistry::new(tx, Duration::from_secs(60))), rx)
    }

    #[tokio::test]
    async fn outbound_happy_path_transitions_in_order() {
        let (registry, mut events) = registry();
        let handle =
            registry.create(Direction::Outbound, CallMode::Announce, device(), "+15551234567", None);

        for state in [
            CallState::Dialing,
            CallState::Ringing,
            CallState::Answered,
            CallState::Speaking,
            CallState::Completed,
        ] {
            handle.transition(state).await.unwrap();
        }

        let trace: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.event)
            .collect();
        assert_eq!(trace, vec!["dialing", "ringing", "answered", "speaking", "completed"]);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (registry, _events) = registry();
        let handle =
            registry.create(Direction::Outbound, CallMode::Conversation, device(), "200", None);

        let err = handle.transition(CallState::Speaking).await.unwrap_err();
        assert!(matches!(err, CallEngineError::IllegalTransition { .. }));

        // The session is still usable on its legal path
        handle.transition(CallState::Dialing).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let (registry, _events) = registry();
        let handle =
            registry.create(Direction::Inbound, CallMode::Conversation, device(), "+15550001111", None);

        handle.transition(CallState::Ringing).await.unwrap();
        handle.fail(FailReason::NoAnswer).await;

        let err = handle.transition(CallState::Answered).await.unwrap_err();
        assert!(matches!(err, CallEngineError::IllegalTransition { .. }));

        // A second terminal request is tolerated silently
        handle.complete().await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, "failed");
        assert_eq!(snapshot.reason.as_deref(), Some("no_answer"));
    }

    #[tokio::test]
    async fn duration_counts_from_answer() {
        let (registry, _events) = registry();
        let handle =
            registry.create(Direction::Outbound, CallMode::Announce, device(), "300", None);
        handle.transition(CallState::Dialing).await.unwrap();

        let before_answer = handle.snapshot().await.unwrap();
        assert_eq!(before_answer.duration, None);

        handle.transition(CallState::Answered).await.unwrap();
        handle.complete().await;
        let after = handle.snapshot().await.unwrap();
        assert!(after.duration.is_some());
        assert!(after.ended_at.is_some());
    }

    #[tokio::test]
    async fn turns_are_recorded_in_order() {
        let (registry, _events) = registry();
        let handle =
            registry.create(Direction::Inbound, CallMode::Conversation, device(), "400", None);
        handle.record_turn("מה השעה?", "השעה שתים עשרה");
        handle.record_turn("thanks", "any time");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.turn_count, 2);
        assert_eq!(snapshot.conversation[0].user, "מה השעה?");
        assert_eq!(snapshot.conversation[1].assistant, "any time");
    }

    #[tokio::test]
    async fn evictor_honors_the_grace_window() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new(tx, Duration::ZERO));
        let handle =
            registry.create(Direction::Outbound, CallMode::Announce, device(), "500", None);
        let id = handle.id.to_string();

        handle.transition(CallState::Dialing).await.unwrap();
        registry.evict_stale().await;
        assert!(registry.get(&id).is_some(), "live sessions never evicted");

        handle.complete().await;
        registry.evict_stale().await;
        assert!(registry.get(&id).is_none(), "terminal session past grace is evicted");
    }
}
