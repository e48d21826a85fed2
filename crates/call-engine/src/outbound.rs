//! Outbound call placement
//!
//! Calls go out early-offer: the media endpoint is allocated first and its
//! SDP rides in the INVITE, so the far end can start media the moment it
//! answers. Target numbers are rewritten for the PBX trunk dial plan,
//! extensions are dialed verbatim.
//!
//! Every driver task owns its call end to end: place, converse (or
//! announce), tear down. Resources are released before the session goes
//! terminal, whatever the exit path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use voxbridge_media_core::fork::ForkExpectations;

use crate::conversation::{self, ConversationConfig, SpeechStack};
use crate::device::Device;
use crate::error::Result;
use crate::media::{MediaEndpoint, MediaEngine};
use crate::session::{
    CallId, CallMode, CallState, Direction, FailReason, SessionHandle, SessionRegistry,
};
use crate::sip::{InviteProgress, InviteRequest, SipCredentials, SipDialog, SipStack};

/// Trunk prefix for external numbers
const TRUNK_PREFIX: &str = "9";

/// Rewrite a dial target for the PBX. External numbers (`+`-prefixed E.164)
/// become trunk-prefix + national digits: the `+` goes, a leading country
/// `1` goes, `9` goes in front. Extensions pass through verbatim.
///
/// ```
/// use voxbridge_call_engine::outbound::rewrite_target;
///
/// assert_eq!(rewrite_target("+15551234567"), "95551234567");
/// assert_eq!(rewrite_target("12611"), "12611");
/// ```
pub fn rewrite_target(to: &str) -> String {
    match to.strip_prefix('+') {
        Some(digits) => {
            let national = digits.strip_prefix('1').unwrap_or(digits);
            format!("{}{}", TRUNK_PREFIX, national)
        }
        None => to.to_string(),
    }
}

/// SIP final-response code to termination reason
pub fn sip_failure_reason(code: u16) -> FailReason {
    match code {
        486 => FailReason::Busy,
        480 | 408 => FailReason::NoAnswer,
        404 => FailReason::NotFound,
        603 => FailReason::Rejected,
        503 => FailReason::ServiceUnavailable,
        401 | 407 => FailReason::AuthFailed,
        _ => FailReason::Internal,
    }
}

/// A validated outbound call order
pub struct OutboundRequest {
    pub to: String,
    pub message: String,
    pub mode: CallMode,
    pub device: Arc<Device>,
    pub ring_timeout: Duration,
    pub webhook_url: Option<String>,
}

/// Shared dependencies of outbound drivers
pub struct OutboundDialer {
    pub stack: Arc<dyn SipStack>,
    pub media: Arc<dyn MediaEngine>,
    pub sessions: Arc<SessionRegistry>,
    pub speech: Arc<SpeechStack>,
    pub expectations: ForkExpectations,
    /// `ws://<external>:<port>` - call id is appended per call
    pub fork_ws_base: String,
    pub sip_domain: String,
    pub outbound_proxy: String,
    pub conversation: ConversationConfig,
}

impl OutboundDialer {
    /// Queue an outbound call. Returns once the session exists; the driver
    /// task carries the call from there.
    pub fn place_call(self: &Arc<Self>, request: OutboundRequest) -> CallId {
        let session = self.sessions.create(
            Direction::Outbound,
            request.mode,
            request.device.clone(),
            request.to.clone(),
            request.webhook_url.clone(),
        );
        let call_id = session.id.clone();

        let dialer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dialer.drive(session.clone(), request).await {
                warn!(call_id = %session.id, "outbound call failed: {}", e);
                session.fail(FailReason::Internal).await;
            }
        });

        call_id
    }

    async fn drive(&self, session: SessionHandle, request: OutboundRequest) -> Result<()> {
        // Early offer: endpoint first, its SDP goes in the INVITE
        let endpoint = match self.media.create_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                session.fail(FailReason::MediaFailed).await;
                return Err(e);
            }
        };

        let result = self.dial_and_run(&session, &request, endpoint.as_ref()).await;

        // Resources go before the terminal transition
        endpoint.destroy().await;
        match result {
            Ok(()) => {
                session.complete().await;
                Ok(())
            }
            Err(e) => {
                // dial_and_run already applied a specific failure reason
                if session.snapshot().await.map(|s| !s.terminal).unwrap_or(false) {
                    session.fail(FailReason::Internal).await;
                }
                Err(e)
            }
        }
    }

    async fn dial_and_run(
        &self,
        session: &SessionHandle,
        request: &OutboundRequest,
        endpoint: &dyn MediaEndpoint,
    ) -> Result<()> {
        let device = &request.device;
        let target_uri = format!("sip:{}@{}", rewrite_target(&request.to), self.sip_domain);
        let invite = InviteRequest {
            target_uri,
            from_uri: format!("sip:{}@{}", device.extension, self.sip_domain),
            display_name: (!device.name.is_empty()).then(|| device.name.clone()),
            local_sdp: endpoint.local_sdp(),
            proxy: self.outbound_proxy.clone(),
            credentials: device.auth_id.clone().zip(device.password.clone()).map(
                |(username, password)| SipCredentials { username, password },
            ),
        };

        let mut progress = self.stack.invite(invite).await?;
        session.transition(CallState::Dialing).await?;
        info!(call_id = %session.id, to = %request.to, device = %device.name, "dialing");

        // Ring phase: one deadline from dial start, provisionals do not
        // extend it
        let cancel = session.cancellation();
        let ring_deadline = tokio::time::Instant::now() + request.ring_timeout;
        let dialog = loop {
            let event = tokio::select! {
                event = tokio::time::timeout_at(ring_deadline, progress.recv()) => {
                    match event {
                        Ok(event) => event,
                        Err(_) => {
                            session.fail(FailReason::NoAnswer).await;
                            return Ok(());
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    session.complete().await;
                    return Ok(());
                }
            };

            match event {
                Some(InviteProgress::Ringing) => {
                    let _ = session.transition(CallState::Ringing).await;
                }
                Some(InviteProgress::Answered { dialog, remote_sdp }) => {
                    endpoint.modify(&remote_sdp).await?;
                    session.transition(CallState::Answered).await?;
                    break dialog;
                }
                Some(InviteProgress::Failed { code, reason }) => {
                    info!(call_id = %session.id, code, %reason, "call not completed");
                    session.fail(sip_failure_reason(code)).await;
                    return Ok(());
                }
                None => {
                    session.fail(FailReason::ServiceUnavailable).await;
                    return Ok(());
                }
            }
        };

        self.run_connected(session, request, endpoint, dialog.as_ref()).await
    }

    async fn run_connected(
        &self,
        session: &SessionHandle,
        request: &OutboundRequest,
        endpoint: &dyn MediaEndpoint,
        dialog: &dyn SipDialog,
    ) -> Result<()> {
        let device = &request.device;
        let call_ws_url = format!("{}/{}", self.fork_ws_base, session.id);

        let activity = async {
            match request.mode {
                CallMode::Announce => {
                    conversation::run_announce(session, device, endpoint, &request.message, &self.speech)
                        .await
                }
                CallMode::Conversation => {
                    let greeting = if request.message.trim().is_empty() {
                        device.greeting.as_str()
                    } else {
                        request.message.as_str()
                    };
                    conversation::run_conversation(
                        session,
                        device,
                        endpoint,
                        &self.expectations,
                        &call_ws_url,
                        greeting,
                        &self.speech,
                        &self.conversation,
                    )
                    .await
                }
            }
        };

        tokio::select! {
            result = activity => {
                // Local side is done talking; close the dialog
                let _ = dialog.hangup().await;
                if let Err(e) = result {
                    warn!(call_id = %session.id, "conversation ended with error: {}", e);
                }
            }
            _ = dialog.wait_destroyed() => {
                info!(call_id = %session.id, "remote hangup");
                session.hangup();
            }
        }

        self.speech.ai.end_session(session.id.as_str()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_numbers_get_the_trunk_rewrite() {
        assert_eq!(rewrite_target("+15551234567"), "95551234567");
        // Leading 1 is only stripped once, and only as country code
        assert_eq!(rewrite_target("+15551234561"), "95551234561");
        // Non-NANP numbers keep all their digits
        assert_eq!(rewrite_target("+442071234567"), "9442071234567");
    }

    #[test]
    fn extensions_are_dialed_verbatim() {
        assert_eq!(rewrite_target("12611"), "12611");
        assert_eq!(rewrite_target("200"), "200");
    }

    #[test]
    fn sip_codes_map_to_reasons() {
        assert_eq!(sip_failure_reason(486), FailReason::Busy);
        assert_eq!(sip_failure_reason(480), FailReason::NoAnswer);
        assert_eq!(sip_failure_reason(408), FailReason::NoAnswer);
        assert_eq!(sip_failure_reason(404), FailReason::NotFound);
        assert_eq!(sip_failure_reason(603), FailReason::Rejected);
        assert_eq!(sip_failure_reason(503), FailReason::ServiceUnavailable);
        assert_eq!(sip_failure_reason(401), FailReason::AuthFailed);
        assert_eq!(sip_failure_reason(407), FailReason::AuthFailed);
        assert_eq!(sip_failure_reason(500), FailReason::Internal);
    }
}
