//! In-memory WAV container helpers
//!
//! Several STT providers only accept file-shaped audio. This wraps a raw
//! 16-bit PCM buffer in a minimal RIFF/WAVE header without touching disk.

use bytes::{BufMut, BytesMut};

/// Wrap mono/interleaved 16-bit PCM in a standard 44-byte RIFF header.
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;

    let mut out = BytesMut::with_capacity(44 + pcm.len());
    out.put_slice(b"RIFF");
    out.put_u32_le(36 + data_len);
    out.put_slice(b"WAVE");

    out.put_slice(b"fmt ");
    out.put_u32_le(16); // PCM fmt chunk size
    out.put_u16_le(1); // PCM
    out.put_u16_le(channels);
    out.put_u32_le(sample_rate);
    out.put_u32_le(byte_rate);
    out.put_u16_le(block_align);
    out.put_u16_le(bits_per_sample);

    out.put_slice(b"data");
    out.put_u32_le(data_len);
    out.put_slice(pcm);
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_canonical() {
        let pcm: Vec<u8> = (0..320u32).flat_map(|_| 1000i16.to_le_bytes()).collect();
        let wav = wrap_pcm(&pcm, 16_000, 1);

        assert_eq!(wav.len(), 44 + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        // Sample rate field
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        // Byte rate = rate * channels * 2
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 32_000);
        // Payload intact
        assert_eq!(&wav[44..], &pcm[..]);
    }

    #[test]
    fn empty_payload_still_produces_valid_header() {
        let wav = wrap_pcm(&[], 8_000, 1);
        assert_eq!(wav.len(), 44);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 0);
    }
}
