//! Engine facade
//!
//! Owns the wired-together core: device registry, registrar, session table,
//! inbound accept loop and outbound dialer. The control API talks to calls
//! exclusively through this type; it never owns telephony state itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use voxbridge_media_core::fork::ForkExpectations;

use crate::config::EngineConfig;
use crate::conversation::{ConversationConfig, SpeechStack};
use crate::device::DeviceRegistry;
use crate::error::{CallEngineError, Result};
use crate::inbound::InboundHandler;
use crate::media::MediaEngine;
use crate::outbound::{OutboundDialer, OutboundRequest};
use crate::registrar::{MultiRegistrar, RegistrarConfig, RegistrationStatus};
use crate::session::{CallId, CallMode, CallSnapshot, SessionEvent, SessionRegistry};
use crate::sip::SipStack;

/// Terminal sessions stay queryable this long
const SESSION_GRACE: Duration = Duration::from_secs(60);

pub struct CallEngine {
    config: EngineConfig,
    pub devices: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub speech: Arc<SpeechStack>,
    registrar: MultiRegistrar,
    dialer: Arc<OutboundDialer>,
    inbound: Arc<InboundHandler>,
    stack: Arc<dyn SipStack>,
}

impl CallEngine {
    /// Wire the engine. `events_rx` (returned) carries every session state
    /// transition for webhook delivery.
    pub fn new(
        config: EngineConfig,
        stack: Arc<dyn SipStack>,
        media: Arc<dyn MediaEngine>,
        speech: Arc<SpeechStack>,
        devices: Arc<DeviceRegistry>,
        expectations: ForkExpectations,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionRegistry::new(events_tx, SESSION_GRACE));

        let conversation = ConversationConfig {
            max_turns: config.max_conversation_turns,
            barge_in: config.barge_in,
            ..ConversationConfig::default()
        };
        let fork_ws_base = format!("ws://{}:{}", config.external_address, config.ws_port);

        let registrar = MultiRegistrar::new(
            stack.clone(),
            RegistrarConfig {
                domain: config.sip_domain.clone(),
                registrar: config.sip_registrar.clone(),
                external_address: config.external_address.clone(),
                expires: config.register_expiry,
            },
        );

        let dialer = Arc::new(OutboundDialer {
            stack: stack.clone(),
            media: media.clone(),
            sessions: sessions.clone(),
            speech: speech.clone(),
            expectations: expectations.clone(),
            fork_ws_base: fork_ws_base.clone(),
            sip_domain: config.sip_domain.clone(),
            outbound_proxy: config.outbound_proxy.clone(),
            conversation: conversation.clone(),
        });

        let inbound = Arc::new(InboundHandler {
            devices: devices.clone(),
            media,
            sessions: sessions.clone(),
            speech: speech.clone(),
            expectations,
            fork_ws_base,
            conversation,
        });

        let engine = Arc::new(Self {
            config,
            devices,
            sessions,
            speech,
            registrar,
            dialer,
            inbound,
            stack,
        });
        (engine, events_rx)
    }

    /// Start the registrar, the inbound accept loop and the session evictor.
    pub fn start(&self) {
        self.registrar.start(&self.devices.registrable());
        tokio::spawn(self.inbound.clone().run_accept_loop(self.stack.clone()));
        self.sessions.clone().spawn_evictor();
        info!("call engine started");
    }

    pub fn stop(&self) {
        self.registrar.stop();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ready to place calls: every registrable device either has a live
    /// registration or none are configured at all.
    pub fn is_ready(&self) -> bool {
        self.devices.registrable().is_empty() || self.registrar.active_count() > 0
    }

    pub fn registrations(&self) -> Vec<RegistrationStatus> {
        self.registrar.statuses()
    }

    /// Queue an outbound call. `device` may be an extension or a name; no
    /// device means the first configured one.
    pub fn place_call(
        &self,
        to: &str,
        message: &str,
        mode: CallMode,
        device: Option<&str>,
        ring_timeout: Duration,
        webhook_url: Option<String>,
    ) -> Result<CallId> {
        if !self.is_ready() {
            return Err(CallEngineError::NotReady { reason: "no active registration".into() });
        }

        let device = match device {
            Some(identifier) => self.devices.find(identifier).ok_or(CallEngineError::NotFound {
                what: "device",
                id: identifier.to_string(),
            })?,
            None => self
                .devices
                .all()
                .into_iter()
                .next()
                .unwrap_or_else(|| self.devices.default_device()),
        };

        let call_id = self.dialer.place_call(OutboundRequest {
            to: to.to_string(),
            message: message.to_string(),
            mode,
            device,
            ring_timeout,
            webhook_url,
        });
        Ok(call_id)
    }

    pub async fn call_snapshot(&self, call_id: &str) -> Option<CallSnapshot> {
        self.sessions.snapshot(call_id).await
    }

    pub async fn list_calls(&self) -> Vec<CallSnapshot> {
        self.sessions.list().await
    }

    /// Force a call onto its terminal path through cooperative cancellation.
    pub fn hangup(&self, call_id: &str) -> Result<()> {
        match self.sessions.get(call_id) {
            Some(handle) => {
                handle.hangup();
                Ok(())
            }
            None => Err(CallEngineError::NotFound { what: "call", id: call_id.to_string() }),
        }
    }

    pub fn reload_devices(&self) -> Result<usize> {
        let count = self.devices.reload()?;
        self.registrar.start(&self.devices.registrable());
        Ok(count)
    }
}
