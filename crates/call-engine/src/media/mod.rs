//! Media engine capability seam
//!
//! RTP termination, playback and the PCM fork live in an external media
//! engine. The engine consumes this narrow surface: allocate an endpoint
//! (which yields local SDP for the early offer), complete negotiation with
//! the peer's SDP, play a URL, attach the audio fork, destroy.
//!
//! Destroy is idempotent and cancellation reaches in-flight playback.

pub mod engine;
pub mod mock;

use async_trait::async_trait;

use crate::error::Result;

/// An allocated media endpoint bound to one call
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Local SDP produced at allocation (the early offer)
    fn local_sdp(&self) -> String;

    /// Complete negotiation once the peer's SDP arrives
    async fn modify(&self, remote_sdp: &str) -> Result<()>;

    /// Fetch and play a WAV/MP3 URL. Resolves when playback finishes or the
    /// endpoint is cancelled/destroyed.
    async fn play(&self, url: &str) -> Result<()>;

    /// Duplicate caller audio as raw 16-bit PCM frames to the given
    /// WebSocket URL, stamped with the call id.
    async fn fork_audio(&self, ws_url: &str, call_id: &str) -> Result<()>;

    /// Stop any in-flight playback without destroying the endpoint.
    fn cancel_playback(&self);

    /// Tear down. Safe to call any number of times.
    async fn destroy(&self);
}

/// Factory for media endpoints
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_endpoint(&self) -> Result<Box<dyn MediaEndpoint>>;
}
