//! Scriptable in-process SIP stack for tests
//!
//! Drives the engine's handlers without a signaling server: REGISTER
//! outcomes and INVITE progress are scripted per test, inbound INVITEs are
//! injected, and dialogs expose a control surface to simulate the remote
//! side hanging up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    IncomingInvite, InviteProgress, InviteRequest, InviteTransaction, RegisterGrant,
    RegisterRequest, SipDialog, SipStack,
};
use crate::error::{CallEngineError, Result};

/// One step of a scripted outbound call
pub enum InviteStep {
    /// Emit 180 after a short beat
    Ringing,
    /// Emit the final 2xx with this dialog
    Answer { control: Arc<MockDialogControl>, remote_sdp: String },
    /// Emit a final failure
    Fail { code: u16, reason: String },
    /// Emit nothing (lets ring timeouts fire)
    Silence,
}

/// Shared dialog control: tests hold one to hang up "from the far side"
pub struct MockDialogControl {
    destroyed_tx: watch::Sender<bool>,
    hangups: AtomicUsize,
    pub dialog_id: String,
}

impl MockDialogControl {
    pub fn new(dialog_id: impl Into<String>) -> Arc<Self> {
        let (destroyed_tx, _) = watch::channel(false);
        Arc::new(Self { destroyed_tx, hangups: AtomicUsize::new(0), dialog_id: dialog_id.into() })
    }

    /// Simulate a remote BYE.
    pub fn remote_hangup(&self) {
        let _ = self.destroyed_tx.send(true);
    }

    /// How many local BYEs were sent through this dialog
    pub fn hangup_count(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn dialog(self: &Arc<Self>) -> Box<dyn SipDialog> {
        Box::new(MockDialog { control: self.clone() })
    }
}

struct MockDialog {
    control: Arc<MockDialogControl>,
}

#[async_trait]
impl SipDialog for MockDialog {
    fn id(&self) -> String {
        self.control.dialog_id.clone()
    }

    async fn hangup(&self) -> Result<()> {
        self.control.hangups.fetch_add(1, Ordering::SeqCst);
        let _ = self.control.destroyed_tx.send(true);
        Ok(())
    }

    async fn wait_destroyed(&self) {
        let mut rx = self.control.destroyed_tx.subscribe();
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

/// Recorded + scripted SIP stack
pub struct MockSipStack {
    pub register_requests: Mutex<Vec<RegisterRequest>>,
    register_script: Mutex<VecDeque<Result<RegisterGrant>>>,
    pub invite_requests: Mutex<Vec<InviteRequest>>,
    invite_script: Mutex<VecDeque<Vec<InviteStep>>>,
    incoming_tx: mpsc::Sender<IncomingInvite>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingInvite>>,
}

impl MockSipStack {
    pub fn new() -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        Arc::new(Self {
            register_requests: Mutex::new(Vec::new()),
            register_script: Mutex::new(VecDeque::new()),
            invite_requests: Mutex::new(Vec::new()),
            invite_script: Mutex::new(VecDeque::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    /// Queue the outcome of the next REGISTER. Without a script, REGISTER
    /// succeeds with the requested expiry.
    pub fn script_register(&self, result: Result<RegisterGrant>) {
        self.register_script.lock().push_back(result);
    }

    /// Queue the progress script of the next INVITE.
    pub fn script_invite(&self, steps: Vec<InviteStep>) {
        self.invite_script.lock().push_back(steps);
    }

    /// Deliver an inbound INVITE to the engine.
    pub async fn inject_incoming(
        &self,
        to_extension: &str,
        from: &str,
        remote_sdp: &str,
        control: Arc<MockDialogControl>,
    ) -> Arc<MockTransactionLog> {
        let log = Arc::new(MockTransactionLog::default());
        let invite = IncomingInvite {
            to_extension: to_extension.to_string(),
            from: from.to_string(),
            remote_sdp: remote_sdp.to_string(),
            transaction: Box::new(MockTransaction { control, log: log.clone() }),
        };
        self.incoming_tx.send(invite).await.expect("engine consuming incoming INVITEs");
        log
    }
}

#[async_trait]
impl SipStack for MockSipStack {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterGrant> {
        let expires = request.expires;
        self.register_requests.lock().push(request);
        match self.register_script.lock().pop_front() {
            Some(result) => result,
            None => Ok(RegisterGrant { granted_expires: expires }),
        }
    }

    async fn invite(&self, request: InviteRequest) -> Result<mpsc::Receiver<InviteProgress>> {
        self.invite_requests.lock().push(request);
        let steps = self.invite_script.lock().pop_front().ok_or_else(|| {
            CallEngineError::internal("mock invite without a script")
        })?;

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let progress = match step {
                    InviteStep::Ringing => InviteProgress::Ringing,
                    InviteStep::Answer { control, remote_sdp } => {
                        InviteProgress::Answered { dialog: control.dialog(), remote_sdp }
                    }
                    InviteStep::Fail { code, reason } => InviteProgress::Failed { code, reason },
                    InviteStep::Silence => continue,
                };
                if tx.send(progress).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn next_incoming(&self) -> Option<IncomingInvite> {
        self.incoming_rx.lock().await.recv().await
    }
}

/// What the engine did with an injected INVITE
#[derive(Default)]
pub struct MockTransactionLog {
    pub ringing_sent: AtomicUsize,
    pub answered: Mutex<Option<String>>,
    pub rejected: Mutex<Option<u16>>,
}

struct MockTransaction {
    control: Arc<MockDialogControl>,
    log: Arc<MockTransactionLog>,
}

#[async_trait]
impl InviteTransaction for MockTransaction {
    async fn ringing(&mut self) -> Result<()> {
        self.log.ringing_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn answer(&mut self, local_sdp: &str) -> Result<Box<dyn SipDialog>> {
        *self.log.answered.lock() = Some(local_sdp.to_string());
        Ok(self.control.dialog())
    }

    async fn reject(&mut self, code: u16) -> Result<()> {
        *self.log.rejected.lock() = Some(code);
        Ok(())
    }
}
