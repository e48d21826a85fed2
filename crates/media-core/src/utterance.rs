//! Utterance framing
//!
//! Turns the per-call PCM chunk stream into discrete utterances. The framer
//! idles in a pre-roll state until a speech chunk arrives, carries the
//! pre-roll into the utterance, and finalizes on a long-enough silence run,
//! on the hard duration cap, or on an external trigger (keypad `#`).
//!
//! Finalized audio still has to pass an acceptance filter before it is
//! emitted; throat clearing and line noise produce "utterances" with almost
//! no speech content, and shipping those to STT wastes a provider round trip.

use std::collections::VecDeque;

use crate::vad::{ChunkClass, EndiannessDetector, VadConfig};

/// Relaxed acceptance floor for externally triggered finalization
const TRIGGERED_MIN_SPEECH_MS: f64 = 100.0;
const TRIGGERED_MIN_SPEECH_RATIO: f64 = 0.05;

/// Normal acceptance ratio of speech bytes to total bytes
const MIN_SPEECH_RATIO: f64 = 0.12;

/// Why an utterance was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The caller stopped talking for the configured gap
    EndSilence,
    /// The utterance hit the hard duration cap
    MaxUtterance,
    /// An external trigger (DTMF `#`) forced the cut
    DtmfTrigger,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::EndSilence => write!(f, "end_silence"),
            EndReason::MaxUtterance => write!(f, "max_utterance"),
            EndReason::DtmfTrigger => write!(f, "dtmf_trigger"),
        }
    }
}

/// One framed caller utterance
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Call this audio belongs to
    pub call_id: String,
    /// Raw 16-bit mono PCM, byte order already normalized by the session
    pub pcm: Vec<u8>,
    /// Sample rate of the payload
    pub sample_rate: u32,
    /// Total utterance length including pre-roll and trailing silence (ms)
    pub duration_ms: u64,
    /// Accumulated speech-classified audio inside it (ms)
    pub speech_ms: u64,
    /// What ended the utterance
    pub reason: EndReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Idle,
    InSpeech,
}

/// Chunk-stream to utterance state machine for a single fork session
pub struct UtteranceFramer {
    config: VadConfig,
    call_id: String,
    sample_rate: u32,
    detector: EndiannessDetector,
    state: FramerState,
    /// Pre-roll ring: (chunk, duration_ms)
    preroll: VecDeque<(Vec<u8>, f64)>,
    preroll_ms: f64,
    buf: Vec<u8>,
    total_ms: f64,
    speech_ms: f64,
    silence_run_ms: f64,
    speech_bytes: usize,
}

impl UtteranceFramer {
    pub fn new(call_id: impl Into<String>, sample_rate: u32, config: VadConfig) -> Self {
        Self {
            config,
            call_id: call_id.into(),
            sample_rate: sample_rate.max(1),
            detector: EndiannessDetector::new(),
            state: FramerState::Idle,
            preroll: VecDeque::new(),
            preroll_ms: 0.0,
            buf: Vec::new(),
            total_ms: 0.0,
            speech_ms: 0.0,
            silence_run_ms: 0.0,
            speech_bytes: 0,
        }
    }

    /// Update the sample rate (from the fork's metadata frame). Only
    /// meaningful before the first chunk.
    pub fn set_sample_rate(&mut self, rate: u32) {
        if rate > 0 {
            self.sample_rate = rate;
        }
    }

    pub fn is_in_speech(&self) -> bool {
        self.state == FramerState::InSpeech
    }

    fn chunk_duration_ms(&self, bytes: usize) -> f64 {
        (bytes / 2) as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Feed one PCM chunk. Returns a finalized, accepted utterance when the
    /// chunk completes one.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Utterance> {
        if chunk.len() < 2 {
            return None;
        }

        let stats = self.detector.observe(chunk, &self.config);
        let class = stats.classify(&self.config);
        let dur = self.chunk_duration_ms(chunk.len());

        match self.state {
            FramerState::Idle => {
                if class == ChunkClass::Speech {
                    self.begin_utterance();
                    self.append(chunk, dur, class);
                    None
                } else {
                    self.push_preroll(chunk, dur);
                    None
                }
            }
            FramerState::InSpeech => {
                self.append(chunk, dur, class);

                if self.silence_run_ms >= self.config.end_silence_ms as f64 {
                    self.finalize(EndReason::EndSilence)
                } else if self.total_ms >= self.config.max_utterance_ms as f64 {
                    self.finalize(EndReason::MaxUtterance)
                } else {
                    None
                }
            }
        }
    }

    /// Cut the current utterance immediately (keypad trigger). Applies the
    /// relaxed acceptance floor. No-op while idle.
    pub fn force_finalize(&mut self) -> Option<Utterance> {
        if self.state == FramerState::InSpeech {
            self.finalize(EndReason::DtmfTrigger)
        } else {
            None
        }
    }

    fn push_preroll(&mut self, chunk: &[u8], dur: f64) {
        self.preroll.push_back((chunk.to_vec(), dur));
        self.preroll_ms += dur;
        while self.preroll_ms > self.config.preroll_ms as f64 {
            match self.preroll.pop_front() {
                Some((_, d)) if self.preroll_ms - d >= self.config.preroll_ms as f64 => {
                    self.preroll_ms -= d;
                }
                Some(front) => {
                    // Dropping this one would cut below the window; keep it.
                    self.preroll.push_front(front);
                    break;
                }
                None => break,
            }
        }
    }

    fn begin_utterance(&mut self) {
        self.buf.clear();
        self.total_ms = 0.0;
        self.speech_ms = 0.0;
        self.silence_run_ms = 0.0;
        self.speech_bytes = 0;

        for (chunk, dur) in self.preroll.drain(..) {
            self.total_ms += dur;
            self.buf.extend_from_slice(&chunk);
        }
        self.preroll_ms = 0.0;
        self.state = FramerState::InSpeech;
    }

    fn append(&mut self, chunk: &[u8], dur: f64, class: ChunkClass) {
        self.buf.extend_from_slice(chunk);
        self.total_ms += dur;
        match class {
            ChunkClass::Speech => {
                self.speech_ms += dur;
                self.speech_bytes += chunk.len();
                self.silence_run_ms = 0.0;
            }
            ChunkClass::Silence => {
                self.silence_run_ms += dur;
            }
            ChunkClass::Ambiguous => {}
        }
    }

    fn finalize(&mut self, reason: EndReason) -> Option<Utterance> {
        let (min_speech_ms, min_ratio) = match reason {
            EndReason::DtmfTrigger => (TRIGGERED_MIN_SPEECH_MS, TRIGGERED_MIN_SPEECH_RATIO),
            _ => (self.config.min_speech_ms as f64, MIN_SPEECH_RATIO),
        };

        let ratio = if self.buf.is_empty() {
            0.0
        } else {
            self.speech_bytes as f64 / self.buf.len() as f64
        };
        let accepted = self.speech_ms >= min_speech_ms && ratio >= min_ratio;

        let utterance = if accepted {
            Some(Utterance {
                call_id: self.call_id.clone(),
                pcm: std::mem::take(&mut self.buf),
                sample_rate: self.sample_rate,
                duration_ms: self.total_ms.round() as u64,
                speech_ms: self.speech_ms.round() as u64,
                reason,
            })
        } else {
            tracing::debug!(
                call_id = %self.call_id,
                speech_ms = self.speech_ms,
                ratio,
                %reason,
                "dropping utterance below acceptance floor"
            );
            None
        };

        self.buf.clear();
        self.total_ms = 0.0;
        self.speech_ms = 0.0;
        self.silence_run_ms = 0.0;
        self.speech_bytes = 0;
        self.state = FramerState::Idle;
        utterance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    /// 20 ms of speech-level PCM (320 samples)
    fn speech_chunk() -> Vec<u8> {
        (0..320i16)
            .map(|i| if i % 2 == 0 { 16384i16 } else { -16384i16 })
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    /// 20 ms of digital silence
    fn silence_chunk() -> Vec<u8> {
        vec![0u8; 640]
    }

    fn framer() -> UtteranceFramer {
        UtteranceFramer::new("call-1", RATE, VadConfig::default())
    }

    fn feed_ms(f: &mut UtteranceFramer, chunk_fn: fn() -> Vec<u8>, ms: u64) -> Vec<Utterance> {
        let mut out = Vec::new();
        for _ in 0..(ms / 20) {
            if let Some(u) = f.push(&chunk_fn()) {
                out.push(u);
            }
        }
        out
    }

    #[test]
    fn speech_then_silence_emits_end_silence() {
        let mut f = framer();
        assert!(feed_ms(&mut f, speech_chunk, 1000).is_empty());
        let emitted = feed_ms(&mut f, silence_chunk, 1600);
        assert_eq!(emitted.len(), 1);
        let u = &emitted[0];
        assert_eq!(u.reason, EndReason::EndSilence);
        assert!(u.speech_ms >= 1000);
        assert_eq!(u.call_id, "call-1");
    }

    #[test]
    fn preroll_is_carried_into_the_utterance() {
        let mut f = framer();
        // 400 ms of lead-in silence; only ~200 ms should be retained
        feed_ms(&mut f, silence_chunk, 400);
        feed_ms(&mut f, speech_chunk, 1000);
        let emitted = feed_ms(&mut f, silence_chunk, 1600);
        assert_eq!(emitted.len(), 1);
        let u = &emitted[0];
        // 200 ms preroll + 1000 ms speech + 1500 ms tail, with one-chunk slack
        assert!(u.duration_ms >= 2660 && u.duration_ms <= 2740, "got {}", u.duration_ms);
    }

    #[test]
    fn short_blip_is_rejected() {
        let mut f = framer();
        feed_ms(&mut f, speech_chunk, 100); // below 350 ms floor
        let emitted = feed_ms(&mut f, silence_chunk, 1600);
        assert!(emitted.is_empty());
    }

    #[test]
    fn continuous_speech_caps_at_max_utterance() {
        let mut f = framer();
        // 60 020 ms of uninterrupted speech: exactly one utterance at the cap
        let emitted = feed_ms(&mut f, speech_chunk, 60_020);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].reason, EndReason::MaxUtterance);
        assert!(emitted[0].duration_ms >= 60_000);
    }

    #[test]
    fn force_finalize_uses_relaxed_floor() {
        let mut f = framer();
        // 120 ms of speech: under the normal 350 ms floor, over the 100 ms
        // triggered floor
        feed_ms(&mut f, speech_chunk, 120);
        let u = f.force_finalize().expect("triggered finalize should emit");
        assert_eq!(u.reason, EndReason::DtmfTrigger);
        assert!(u.speech_ms >= 100);
    }

    #[test]
    fn force_finalize_while_idle_is_noop() {
        let mut f = framer();
        assert!(f.force_finalize().is_none());
        feed_ms(&mut f, silence_chunk, 200);
        assert!(f.force_finalize().is_none());
    }

    #[test]
    fn low_speech_ratio_is_rejected() {
        let mut f = framer();
        // 400 ms speech buried in a long ambiguous hum: ratio below 0.12
        feed_ms(&mut f, speech_chunk, 400);
        let hum = || -> Vec<u8> {
            (0..320i16)
                .map(|i| if i % 2 == 0 { 300i16 } else { -300i16 })
                .flat_map(|s| s.to_le_bytes())
                .collect()
        };
        // Ambiguous chunks never extend the silence run, so push 4 s of hum
        // then real silence to finalize
        for _ in 0..200 {
            assert!(f.push(&hum()).is_none());
        }
        let emitted = feed_ms(&mut f, silence_chunk, 1600);
        assert!(emitted.is_empty(), "400ms/6s speech ratio must fail the filter");
    }

    #[test]
    fn next_utterance_starts_fresh_after_emit() {
        let mut f = framer();
        feed_ms(&mut f, speech_chunk, 600);
        assert_eq!(feed_ms(&mut f, silence_chunk, 1600).len(), 1);
        // Second round
        feed_ms(&mut f, speech_chunk, 600);
        let second = feed_ms(&mut f, silence_chunk, 1600);
        assert_eq!(second.len(), 1);
        assert!(second[0].duration_ms < 3000);
    }
}
