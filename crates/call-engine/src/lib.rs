//! # voxbridge-call-engine
//!
//! The orchestration core of voxbridge. This crate binds the telephony edge
//! (an external signaling server and media engine) to the speech stack
//! (provider chains and the AI gateway) and owns every piece of per-call
//! state:
//!
//! - **Device registry** ([`device`]) - the per-extension identities the
//!   orchestrator answers and speaks as.
//! - **Multi-registrar** ([`registrar`]) - one SIP registration per device,
//!   refreshed ahead of expiry, retried on failure.
//! - **Call sessions** ([`session`]) - the authoritative per-call record and
//!   state machine, mutated through a per-call mailbox task.
//! - **Inbound/outbound handlers** ([`inbound`], [`outbound`]) - the call
//!   state machines on both sides of the SIP edge, early-offer on the way
//!   out.
//! - **Conversation loop** ([`conversation`]) - greet, listen, transcribe,
//!   think, speak, repeat.
//! - **Adapters** ([`sip`], [`media`]) - trait seams over the external
//!   signaling server and media engine, with wire clients and test mocks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  CallEngine                  │
//! ├──────────────────────────────────────────────┤
//! │ DeviceRegistry │ MultiRegistrar │ Sessions   │
//! │ InboundHandler │ OutboundDialer │ Loop       │
//! ├──────────────────────────────────────────────┤
//! │   SipStack (trait)   │   MediaEngine (trait) │
//! └──────────────────────────────────────────────┘
//!            │                      │
//!     signaling server         media engine
//! ```

pub mod config;
pub mod conversation;
pub mod device;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod media;
pub mod outbound;
pub mod registrar;
pub mod session;
pub mod sip;

pub use config::EngineConfig;
pub use device::{Device, DeviceRegistry};
pub use engine::CallEngine;
pub use error::{CallEngineError, Result};
pub use session::{CallId, CallMode, CallState, CallSnapshot, Direction, FailReason, SessionRegistry};
