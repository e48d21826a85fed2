//! Voice activity detection over raw 16-bit PCM
//!
//! Classification is energy-based: a chunk counts as speech when its RMS or
//! peak amplitude clears the configured thresholds, and as silence when it is
//! dominated by near-zero samples with low RMS. Chunks that clear neither bar
//! are ambiguous and extend neither the speech nor the silence run.
//!
//! The media engine does not declare the byte order of its PCM fork, so the
//! detector scores both interpretations of the first audible chunk and keeps
//! the winner for the rest of the session.

/// Amplitude below which a sample counts toward the near-zero ratio
const NEAR_ZERO_AMPLITUDE: i32 = 100;

/// Byte order of the 16-bit PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little-endian samples (the common case, assumed until detection)
    #[default]
    Little,
    /// Big-endian samples
    Big,
}

/// Tunable detection thresholds
///
/// Defaults match the orchestrator's telephony profile: 16 kHz mono with a
/// 1.5 s end-of-utterance gap.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Silence run that ends an utterance (ms)
    pub end_silence_ms: u64,
    /// Minimum accumulated speech for an utterance to be accepted (ms)
    pub min_speech_ms: u64,
    /// Hard cap on utterance length (ms)
    pub max_utterance_ms: u64,
    /// Audio retained before the first speech chunk (ms)
    pub preroll_ms: u64,
    /// RMS at or above which a chunk is speech
    pub speech_rms: f64,
    /// Peak amplitude at or above which a chunk is speech
    pub speech_peak: i32,
    /// Near-zero sample ratio above which a chunk may be silence
    pub silence_near_zero_ratio: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            end_silence_ms: 1500,
            min_speech_ms: 350,
            max_utterance_ms: 60_000,
            preroll_ms: 200,
            speech_rms: 650.0,
            speech_peak: 2200,
            silence_near_zero_ratio: 0.94,
        }
    }
}

impl VadConfig {
    pub fn with_end_silence_ms(mut self, ms: u64) -> Self {
        self.end_silence_ms = ms;
        self
    }

    pub fn with_min_speech_ms(mut self, ms: u64) -> Self {
        self.min_speech_ms = ms;
        self
    }

    pub fn with_max_utterance_ms(mut self, ms: u64) -> Self {
        self.max_utterance_ms = ms;
        self
    }
}

/// Classification of one PCM chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClass {
    /// Cleared the speech thresholds
    Speech,
    /// Dominated by near-zero samples
    Silence,
    /// Neither; extends no run
    Ambiguous,
}

/// Amplitude statistics of one chunk under a fixed byte order
#[derive(Debug, Clone, Copy)]
pub struct ChunkStats {
    pub rms: f64,
    pub peak: i32,
    pub near_zero_ratio: f64,
    pub samples: usize,
}

impl ChunkStats {
    /// Combined loudness used for byte-order arbitration on the first
    /// audible chunk.
    pub fn score(&self) -> f64 {
        self.rms + self.peak as f64
    }

    pub fn classify(&self, config: &VadConfig) -> ChunkClass {
        if self.rms >= config.speech_rms || self.peak >= config.speech_peak {
            ChunkClass::Speech
        } else if self.near_zero_ratio > config.silence_near_zero_ratio && self.rms < config.speech_rms {
            ChunkClass::Silence
        } else {
            ChunkClass::Ambiguous
        }
    }
}

/// Compute amplitude statistics of `pcm` interpreted with `order`.
/// A trailing odd byte is ignored.
pub fn chunk_stats(pcm: &[u8], order: Endianness) -> ChunkStats {
    let n = pcm.len() / 2;
    if n == 0 {
        return ChunkStats { rms: 0.0, peak: 0, near_zero_ratio: 1.0, samples: 0 };
    }

    let mut sum_sq = 0f64;
    let mut peak = 0i32;
    let mut near_zero = 0usize;

    for pair in pcm.chunks_exact(2) {
        let sample = match order {
            Endianness::Little => i16::from_le_bytes([pair[0], pair[1]]),
            Endianness::Big => i16::from_be_bytes([pair[0], pair[1]]),
        } as i32;
        let mag = sample.abs();
        sum_sq += (sample * sample) as f64;
        if mag > peak {
            peak = mag;
        }
        if mag < NEAR_ZERO_AMPLITUDE {
            near_zero += 1;
        }
    }

    ChunkStats {
        rms: (sum_sq / n as f64).sqrt(),
        peak,
        near_zero_ratio: near_zero as f64 / n as f64,
        samples: n,
    }
}

/// One-shot endianness detector
///
/// Assumes little-endian until the first chunk that is audible under either
/// interpretation, then locks in the higher-scoring byte order for the rest
/// of the session.
#[derive(Debug, Default)]
pub struct EndiannessDetector {
    decided: Option<Endianness>,
}

impl EndiannessDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte order (LE until detection locks in)
    pub fn current(&self) -> Endianness {
        self.decided.unwrap_or(Endianness::Little)
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    /// Observe a chunk, returning the stats under the byte order selected for
    /// it. Detection only locks in once a chunk is audible, so a silent lead-in
    /// cannot freeze a wrong guess.
    pub fn observe(&mut self, pcm: &[u8], config: &VadConfig) -> ChunkStats {
        if let Some(order) = self.decided {
            return chunk_stats(pcm, order);
        }

        let le = chunk_stats(pcm, Endianness::Little);
        let be = chunk_stats(pcm, Endianness::Big);
        let (order, stats) = if be.score() > le.score() {
            (Endianness::Big, be)
        } else {
            (Endianness::Little, le)
        };

        if stats.classify(config) == ChunkClass::Speech {
            tracing::debug!(?order, rms = stats.rms, peak = stats.peak, "locked PCM byte order");
            self.decided = Some(order);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_le(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pcm_be(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_be_bytes()).collect()
    }

    fn loud(n: usize) -> Vec<i16> {
        (0..n).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect()
    }

    #[test]
    fn silence_classifies_as_silence() {
        let pcm = pcm_le(&vec![0i16; 320]);
        let stats = chunk_stats(&pcm, Endianness::Little);
        assert_eq!(stats.classify(&VadConfig::default()), ChunkClass::Silence);
        assert_eq!(stats.near_zero_ratio, 1.0);
    }

    #[test]
    fn loud_tone_classifies_as_speech() {
        let pcm = pcm_le(&loud(320));
        let stats = chunk_stats(&pcm, Endianness::Little);
        assert_eq!(stats.classify(&VadConfig::default()), ChunkClass::Speech);
    }

    #[test]
    fn low_hum_is_ambiguous() {
        // Above near-zero everywhere but below the speech thresholds
        let samples: Vec<i16> = (0..320).map(|i| if i % 2 == 0 { 300 } else { -300 }).collect();
        let stats = chunk_stats(&pcm_le(&samples), Endianness::Little);
        assert_eq!(stats.classify(&VadConfig::default()), ChunkClass::Ambiguous);
    }

    #[test]
    fn empty_chunk_counts_as_full_silence() {
        let stats = chunk_stats(&[], Endianness::Little);
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.classify(&VadConfig::default()), ChunkClass::Silence);
    }

    #[test]
    fn detector_stays_le_on_silent_lead_in() {
        let mut det = EndiannessDetector::new();
        det.observe(&pcm_le(&vec![0i16; 160]), &VadConfig::default());
        assert!(!det.is_decided());
        assert_eq!(det.current(), Endianness::Little);
    }

    #[test]
    fn detector_locks_big_endian_on_speech() {
        let mut det = EndiannessDetector::new();
        // Silent first chunk must not lock anything
        det.observe(&pcm_be(&vec![0i16; 160]), &VadConfig::default());
        assert!(!det.is_decided());

        det.observe(&pcm_be(&loud(320)), &VadConfig::default());
        assert!(det.is_decided());
        assert_eq!(det.current(), Endianness::Big);

        // Later chunks no longer re-arbitrate
        det.observe(&pcm_le(&loud(320)), &VadConfig::default());
        assert_eq!(det.current(), Endianness::Big);
    }

    #[test]
    fn detector_locks_little_endian_on_speech() {
        let mut det = EndiannessDetector::new();
        det.observe(&pcm_le(&loud(320)), &VadConfig::default());
        assert!(det.is_decided());
        assert_eq!(det.current(), Endianness::Little);
    }
}
