//! In-process media engine double for tests
//!
//! Records every command, simulates playback with a short sleep that a
//! cancel cuts short, and lets tests assert the resource invariants
//! (everything destroyed exactly once, fork attached with the right call
//! id).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{MediaEndpoint, MediaEngine};
use crate::error::Result;

/// Shared log of one mock endpoint's life
#[derive(Default)]
pub struct MockEndpointLog {
    pub modified_with: Mutex<Option<String>>,
    pub played: Mutex<Vec<String>>,
    pub forked: Mutex<Option<(String, String)>>,
    pub destroy_calls: AtomicUsize,
    pub destroyed: AtomicBool,
}

pub struct MockMediaEngine {
    pub endpoints: Mutex<Vec<Arc<MockEndpointLog>>>,
    /// Simulated playback duration
    pub play_duration: Duration,
    pub local_sdp: String,
}

impl MockMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(Vec::new()),
            play_duration: Duration::from_millis(20),
            local_sdp: "v=0\r\no=voxbridge 0 0 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 40000 RTP/AVP 0\r\n".into(),
        })
    }

    pub fn with_play_duration(play_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(Vec::new()),
            play_duration,
            local_sdp: "v=0\r\no=voxbridge 0 0 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 40000 RTP/AVP 0\r\n"
                .into(),
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Log of the nth endpoint created
    pub fn endpoint_log(&self, index: usize) -> Option<Arc<MockEndpointLog>> {
        self.endpoints.lock().get(index).cloned()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_endpoint(&self) -> Result<Box<dyn MediaEndpoint>> {
        let log = Arc::new(MockEndpointLog::default());
        self.endpoints.lock().push(log.clone());
        Ok(Box::new(MockEndpoint {
            log,
            local_sdp: self.local_sdp.clone(),
            play_duration: self.play_duration,
            cancel: Notify::new(),
        }))
    }
}

struct MockEndpoint {
    log: Arc<MockEndpointLog>,
    local_sdp: String,
    play_duration: Duration,
    cancel: Notify,
}

#[async_trait]
impl MediaEndpoint for MockEndpoint {
    fn local_sdp(&self) -> String {
        self.local_sdp.clone()
    }

    async fn modify(&self, remote_sdp: &str) -> Result<()> {
        *self.log.modified_with.lock() = Some(remote_sdp.to_string());
        Ok(())
    }

    async fn play(&self, url: &str) -> Result<()> {
        self.log.played.lock().push(url.to_string());
        tokio::select! {
            _ = tokio::time::sleep(self.play_duration) => {}
            _ = self.cancel.notified() => {}
        }
        Ok(())
    }

    async fn fork_audio(&self, ws_url: &str, call_id: &str) -> Result<()> {
        *self.log.forked.lock() = Some((ws_url.to_string(), call_id.to_string()));
        Ok(())
    }

    fn cancel_playback(&self) {
        self.cancel.notify_waiters();
    }

    async fn destroy(&self) {
        self.log.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.log.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_destroy_is_a_noop() {
        let engine = MockMediaEngine::new();
        let endpoint = engine.create_endpoint().await.unwrap();
        endpoint.destroy().await;
        endpoint.destroy().await;

        let log = engine.endpoint_log(0).unwrap();
        assert_eq!(log.destroy_calls.load(Ordering::SeqCst), 2);
        assert!(log.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_cuts_playback_short() {
        let engine = MockMediaEngine::with_play_duration(Duration::from_secs(30));
        let endpoint = engine.create_endpoint().await.unwrap();

        let started = std::time::Instant::now();
        let play = endpoint.play("http://x/y.mp3");
        tokio::pin!(play);
        tokio::select! {
            _ = &mut play => panic!("playback should still be running"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        endpoint.cancel_playback();
        play.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
