//! # voxbridge-control-api
//!
//! The HTTP control surface. A thin façade over the call engine and the
//! speech stack: outbound call initiation, call status, synchronous device
//! personality queries, device enumeration and reload, audio artifact
//! serving, and best-effort webhook delivery of call state transitions.
//!
//! The API never owns telephony state; every handler resolves through
//! [`voxbridge_call_engine::CallEngine`].

pub mod error;
pub mod query;
pub mod routes;
pub mod state;
pub mod webhook;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
