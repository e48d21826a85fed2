//! Text-to-speech provider chain
//!
//! Providers are tried in a fixed order; a stage whose preconditions are
//! unmet (no key, no URL) is never constructed, and a stage that fails or
//! times out demotes to the next. The chain only errors once every
//! configured stage has failed.
//!
//! Chain order:
//! 1. `google` - cloud-key HTTP TTS (preferred when a cloud key exists)
//! 2. `moss` - GPU voice-clone server (explicitly enabled deployments only)
//! 3. `gtts` - free web TTS through a subprocess wrapper
//! 4. `openai` - key-gated API TTS
//! 5. `elevenlabs` - key-gated voice cloning by opaque voice id
//!
//! Every successful synthesis lands in the shared [`AudioStore`] and is
//! returned as a URL the media engine can fetch.

mod elevenlabs;
mod google;
mod gtts;
mod moss;
mod openai;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, SpeechError};
use crate::store::{AudioRef, AudioStore};

pub use elevenlabs::ElevenLabsTts;
pub use google::GoogleTts;
pub use gtts::WebTts;
pub use moss::MossTts;
pub use openai::OpenAiTts;

/// One synthesis request
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    /// Short BCP-47 language (`en`, `he`, ...)
    pub language: String,
    /// Opaque provider voice id from the device, if any
    pub voice_id: Option<String>,
}

/// Synthesized audio before it is written to the store
#[derive(Debug)]
pub struct TtsArtifact {
    pub bytes: Vec<u8>,
    /// File extension determining the served MIME type (`mp3`, `wav`)
    pub extension: &'static str,
}

/// A single text-to-speech backend
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runtime precondition check (beyond construction-time config gating)
    fn available(&self) -> bool {
        true
    }

    /// Per-attempt time budget
    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsArtifact>;
}

/// Outcome of one chain attempt, kept for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(String),
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub provider: &'static str,
    pub outcome: AttemptOutcome,
}

/// Ordered fallback chain over TTS providers
pub struct TtsChain {
    providers: Vec<Box<dyn TtsProvider>>,
    store: AudioStore,
}

/// Credentials/switches that decide which stages exist
#[derive(Debug, Clone, Default)]
pub struct TtsChainConfig {
    pub cloud_tts_key: Option<String>,
    pub moss_tts_url: Option<String>,
    /// Voice cloning is latency-heavy; deployments opt in explicitly
    pub moss_enabled: bool,
    pub openai_key: Option<String>,
    pub elevenlabs_key: Option<String>,
}

impl TtsChain {
    /// Build the chain from configuration, constructing only the stages
    /// whose preconditions are met. The free web stage is always present.
    pub fn from_config(config: &TtsChainConfig, store: AudioStore) -> Self {
        let mut providers: Vec<Box<dyn TtsProvider>> = Vec::new();

        if let Some(key) = &config.cloud_tts_key {
            providers.push(Box::new(GoogleTts::new(key.clone())));
        }
        if config.moss_enabled {
            if let Some(url) = &config.moss_tts_url {
                providers.push(Box::new(MossTts::new(url.clone())));
            }
        }
        providers.push(Box::new(WebTts::new()));
        if let Some(key) = &config.openai_key {
            providers.push(Box::new(OpenAiTts::new(key.clone())));
        }
        if let Some(key) = &config.elevenlabs_key {
            providers.push(Box::new(ElevenLabsTts::new(key.clone())));
        }

        Self { providers, store }
    }

    /// Test/bespoke constructor with an explicit provider list
    pub fn with_providers(providers: Vec<Box<dyn TtsProvider>>, store: AudioStore) -> Self {
        Self { providers, store }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Synthesize `request`, walking the chain in order. Returns the stored
    /// artifact's URL on the first success.
    pub async fn synthesize(&self, request: &TtsRequest) -> Result<AudioRef> {
        let (result, _) = self.synthesize_traced(request).await;
        result
    }

    /// As [`synthesize`](Self::synthesize), also returning the per-provider
    /// attempt trail.
    pub async fn synthesize_traced(&self, request: &TtsRequest) -> (Result<AudioRef>, Vec<Attempt>) {
        let mut attempts = Vec::new();

        for provider in &self.providers {
            if !provider.available() {
                attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::Skipped });
                continue;
            }

            debug!(provider = provider.name(), chars = request.text.len(), "tts attempt");
            match tokio::time::timeout(provider.timeout(), provider.synthesize(request)).await {
                Ok(Ok(artifact)) => {
                    attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::Success });
                    let stored = self.store.save(&artifact.bytes, artifact.extension).await;
                    return (stored, attempts);
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), "tts attempt failed: {}", e);
                    attempts.push(Attempt {
                        provider: provider.name(),
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                }
                Err(_) => {
                    warn!(
                        provider = provider.name(),
                        budget_ms = provider.timeout().as_millis() as u64,
                        "tts attempt timed out"
                    );
                    attempts.push(Attempt { provider: provider.name(), outcome: AttemptOutcome::TimedOut });
                }
            }
        }

        let attempted = attempts.iter().filter(|a| a.outcome != AttemptOutcome::Skipped).count();
        (Err(SpeechError::ChainExhausted { what: "tts", attempted }), attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeTts {
        name: &'static str,
        fail: bool,
        hang: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeTts {
        fn ok(name: &'static str, calls: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self { name, fail: false, hang: false, calls })
        }

        fn failing(name: &'static str, calls: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self { name, fail: true, hang: false, calls })
        }

        fn hanging(name: &'static str, calls: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self { name, fail: false, hang: true, calls })
        }
    }

    #[async_trait]
    impl TtsProvider for FakeTts {
        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }

        async fn synthesize(&self, _request: &TtsRequest) -> Result<TtsArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail {
                return Err(SpeechError::Provider { provider: self.name, reason: "boom".into() });
            }
            Ok(TtsArtifact { bytes: b"fake-mp3".to_vec(), extension: "mp3" })
        }
    }

    fn request() -> TtsRequest {
        TtsRequest { text: "hello caller".into(), language: "en".into(), voice_id: None }
    }

    fn store() -> (tempfile::TempDir, AudioStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = AudioStore::open(tmp.path(), "http://127.0.0.1:3000/audio-files").unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn first_success_wins_and_later_stages_never_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let later = Arc::new(AtomicUsize::new(0));
        let (_tmp, store) = store();
        let chain = TtsChain::with_providers(
            vec![FakeTts::ok("first", calls.clone()), FakeTts::ok("second", later.clone())],
            store,
        );

        let (result, attempts) = chain.synthesize_traced(&request()).await;
        let audio = result.unwrap();
        assert!(audio.url.ends_with(".mp3"));
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].provider, "first");
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_demotes_in_declared_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tmp, store) = store();
        let chain = TtsChain::with_providers(
            vec![
                FakeTts::failing("a", calls.clone()),
                FakeTts::failing("b", calls.clone()),
                FakeTts::ok("c", calls.clone()),
            ],
            store,
        );

        let (result, attempts) = chain.synthesize_traced(&request()).await;
        assert!(result.is_ok());
        let names: Vec<_> = attempts.iter().map(|a| a.provider).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_a_failed_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tmp, store) = store();
        let chain = TtsChain::with_providers(
            vec![FakeTts::hanging("slow", calls.clone()), FakeTts::ok("fast", calls.clone())],
            store,
        );

        let (result, attempts) = chain.synthesize_traced(&request()).await;
        assert!(result.is_ok());
        assert_eq!(attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn exhausted_chain_surfaces_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tmp, store) = store();
        let chain = TtsChain::with_providers(
            vec![FakeTts::failing("a", calls.clone()), FakeTts::failing("b", calls.clone())],
            store,
        );

        let (result, attempts) = chain.synthesize_traced(&request()).await;
        match result {
            Err(SpeechError::ChainExhausted { what, attempted }) => {
                assert_eq!(what, "tts");
                assert_eq!(attempted, 2);
            }
            other => panic!("expected ChainExhausted, got {:?}", other.map(|a| a.url)),
        }
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn config_gating_builds_expected_stages() {
        let (_tmp, store) = store();
        let chain = TtsChain::from_config(
            &TtsChainConfig {
                cloud_tts_key: Some("k".into()),
                moss_tts_url: Some("http://gpu:5000".into()),
                moss_enabled: false,
                openai_key: None,
                elevenlabs_key: Some("k2".into()),
            },
            store,
        );
        // moss disabled and openai keyless: both absent; gtts always present
        assert_eq!(chain.provider_names(), vec!["google", "gtts", "elevenlabs"]);
    }
}
