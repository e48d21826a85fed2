//! Inbound call handling
//!
//! The accept loop takes INVITEs off the SIP stack and spawns one driver
//! task per call. The driver resolves the device for the dialed extension
//! (misses get the reserved default identity), allocates the media endpoint
//! against the caller's SDP offer, answers, and hands off to the
//! conversation loop. Teardown is guaranteed on every exit path.

use std::sync::Arc;

use tracing::{info, warn};

use voxbridge_media_core::fork::ForkExpectations;

use crate::conversation::{self, ConversationConfig, SpeechStack};
use crate::device::DeviceRegistry;
use crate::error::Result;
use crate::media::MediaEngine;
use crate::session::{CallMode, CallState, Direction, FailReason, SessionHandle, SessionRegistry};
use crate::sip::{IncomingInvite, SipStack};

/// Shared dependencies of inbound drivers
pub struct InboundHandler {
    pub devices: Arc<DeviceRegistry>,
    pub media: Arc<dyn MediaEngine>,
    pub sessions: Arc<SessionRegistry>,
    pub speech: Arc<SpeechStack>,
    pub expectations: ForkExpectations,
    pub fork_ws_base: String,
    pub conversation: ConversationConfig,
}

impl InboundHandler {
    /// Consume INVITEs until the stack shuts down. Each call runs in its own
    /// supervised task; one bad call never takes the loop down.
    pub async fn run_accept_loop(self: Arc<Self>, stack: Arc<dyn SipStack>) {
        info!("inbound accept loop running");
        while let Some(invite) = stack.next_incoming().await {
            let handler = self.clone();
            tokio::spawn(async move {
                let from = invite.from.clone();
                if let Err(e) = handler.drive(invite).await {
                    warn!(%from, "inbound call failed: {}", e);
                }
            });
        }
        info!("inbound accept loop stopped");
    }

    async fn drive(&self, mut invite: IncomingInvite) -> Result<()> {
        let device = self.devices.get(&invite.to_extension);
        info!(
            extension = %invite.to_extension,
            device = %device.name,
            from = %invite.from,
            "inbound call"
        );

        let session = self.sessions.create(
            Direction::Inbound,
            CallMode::Conversation,
            device.clone(),
            invite.from.clone(),
            None,
        );

        session.transition(CallState::Ringing).await?;
        let _ = invite.transaction.ringing().await;

        // Endpoint is allocated against the caller's offer (no early offer
        // on the UAS side)
        let endpoint = match self.media.create_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = invite.transaction.reject(503).await;
                session.fail(FailReason::MediaFailed).await;
                return Err(e);
            }
        };

        let result = async {
            endpoint.modify(&invite.remote_sdp).await?;
            session.transition(CallState::Accepted).await?;
            let dialog = invite.transaction.answer(&endpoint.local_sdp()).await?;
            session.transition(CallState::Answered).await?;

            let call_ws_url = format!("{}/{}", self.fork_ws_base, session.id);
            let activity = conversation::run_conversation(
                &session,
                &device,
                endpoint.as_ref(),
                &self.expectations,
                &call_ws_url,
                &device.greeting,
                &self.speech,
                &self.conversation,
            );

            tokio::select! {
                result = activity => {
                    let _ = dialog.hangup().await;
                    if let Err(e) = result {
                        warn!(call_id = %session.id, "conversation ended with error: {}", e);
                    }
                }
                _ = dialog.wait_destroyed() => {
                    info!(call_id = %session.id, "caller hung up");
                    session.hangup();
                }
            }
            Ok::<(), crate::error::CallEngineError>(())
        }
        .await;

        endpoint.destroy().await;
        self.speech.ai.end_session(session.id.as_str()).await;
        match result {
            Ok(()) => {
                session.complete().await;
                Ok(())
            }
            Err(e) => {
                session.fail(FailReason::Internal).await;
                Err(e)
            }
        }
    }

    /// Session handle lookup passthrough for tests and the control surface
    pub fn session(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.get(call_id)
    }
}
