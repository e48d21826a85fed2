//! SIP stack capability seam
//!
//! voxbridge does not parse SIP. An external signaling server owns the
//! protocol; this module defines the capability surface the engine consumes
//! (UAC dial-out, inbound INVITE delivery, REGISTER with digest auth,
//! dialog teardown notification) and ships two implementations:
//!
//! - [`wire::WireSipStack`] - a framed JSON client to the signaling
//!   server's admin socket.
//! - [`mock::MockSipStack`] - a scriptable in-process double for tests.

pub mod mock;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Digest credentials. `username` is the device's auth id, never its
/// extension.
#[derive(Debug, Clone)]
pub struct SipCredentials {
    pub username: String,
    pub password: String,
}

/// One REGISTER refresh
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Address of record: `sip:<extension>@<domain>`
    pub aor: String,
    /// Contact URI: `sip:<extension>@<external_address>`
    pub contact: String,
    /// Registrar host:port
    pub registrar: String,
    /// Requested expiry (seconds)
    pub expires: u32,
    pub credentials: SipCredentials,
}

/// Successful registration, with the expiry the registrar actually granted
#[derive(Debug, Clone, Copy)]
pub struct RegisterGrant {
    pub granted_expires: u32,
}

/// Early-offer UAC INVITE
#[derive(Debug, Clone)]
pub struct InviteRequest {
    /// Already-rewritten target URI
    pub target_uri: String,
    /// `sip:<extension>@<domain>`
    pub from_uri: String,
    /// Quoted into the From display when present
    pub display_name: Option<String>,
    /// Local SDP carried in the INVITE (early offer)
    pub local_sdp: String,
    /// Outbound proxy the INVITE egresses through
    pub proxy: String,
    pub credentials: Option<SipCredentials>,
}

/// Progress of an outbound INVITE, streamed until a final event
pub enum InviteProgress {
    /// 180 Ringing
    Ringing,
    /// Final 2xx: the dialog is up
    Answered { dialog: Box<dyn SipDialog>, remote_sdp: String },
    /// Final failure response
    Failed { code: u16, reason: String },
}

impl std::fmt::Debug for InviteProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InviteProgress::Ringing => f.debug_struct("Ringing").finish(),
            InviteProgress::Answered { dialog, remote_sdp } => f
                .debug_struct("Answered")
                .field("dialog", &dialog.id())
                .field("remote_sdp", remote_sdp)
                .finish(),
            InviteProgress::Failed { code, reason } => f
                .debug_struct("Failed")
                .field("code", code)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// An inbound INVITE awaiting a decision
pub struct IncomingInvite {
    /// Extension the INVITE was addressed to
    pub to_extension: String,
    /// Caller identity (number or extension)
    pub from: String,
    /// The caller's SDP offer
    pub remote_sdp: String,
    pub transaction: Box<dyn InviteTransaction>,
}

impl std::fmt::Debug for IncomingInvite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingInvite")
            .field("to_extension", &self.to_extension)
            .field("from", &self.from)
            .finish()
    }
}

/// Server side of an inbound INVITE
#[async_trait]
pub trait InviteTransaction: Send {
    /// Send 180 Ringing
    async fn ringing(&mut self) -> Result<()>;
    /// Send 200 OK with our SDP answer; yields the established dialog
    async fn answer(&mut self, local_sdp: &str) -> Result<Box<dyn SipDialog>>;
    /// Send a final failure response
    async fn reject(&mut self, code: u16) -> Result<()>;
}

/// An established dialog (either direction)
#[async_trait]
pub trait SipDialog: Send + Sync {
    fn id(&self) -> String;
    /// Send BYE
    async fn hangup(&self) -> Result<()>;
    /// Resolves when the dialog is destroyed (remote BYE, local hangup or
    /// transport loss)
    async fn wait_destroyed(&self);
}

/// The signaling capability the engine consumes
#[async_trait]
pub trait SipStack: Send + Sync {
    /// Send one REGISTER and wait for the final response.
    async fn register(&self, request: RegisterRequest) -> Result<RegisterGrant>;

    /// Send an early-offer INVITE; progress arrives on the returned channel
    /// until a final event.
    async fn invite(&self, request: InviteRequest) -> Result<mpsc::Receiver<InviteProgress>>;

    /// Next inbound INVITE addressed to any registered extension.
    async fn next_incoming(&self) -> Option<IncomingInvite>;
}

/// Granted-expiry extraction per registration rules: the Contact header's
/// `expires` parameter wins, then the `Expires` header, then the value we
/// asked for.
pub fn parse_granted_expiry(contact: Option<&str>, expires_header: Option<&str>, requested: u32) -> u32 {
    if let Some(contact) = contact {
        for param in contact.split(';').skip(1) {
            let mut parts = param.trim().splitn(2, '=');
            if parts.next().map(|k| k.eq_ignore_ascii_case("expires")).unwrap_or(false) {
                if let Some(value) = parts.next().and_then(|v| v.trim().parse::<u32>().ok()) {
                    return value;
                }
            }
        }
    }
    if let Some(value) = expires_header.and_then(|v| v.trim().parse::<u32>().ok()) {
        return value;
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_expires_parameter_wins() {
        let granted = parse_granted_expiry(
            Some("<sip:12611@10.0.0.5:5060>;expires=600"),
            Some("3600"),
            1800,
        );
        assert_eq!(granted, 600);
    }

    #[test]
    fn expires_header_is_the_second_choice() {
        assert_eq!(parse_granted_expiry(Some("<sip:12611@10.0.0.5>"), Some("900"), 1800), 900);
        assert_eq!(parse_granted_expiry(None, Some("900"), 1800), 900);
    }

    #[test]
    fn requested_value_is_the_fallback() {
        assert_eq!(parse_granted_expiry(None, None, 1800), 1800);
        assert_eq!(parse_granted_expiry(Some("<sip:x@y>;q=1.0"), Some("abc"), 1800), 1800);
    }
}
