use anyhow::Result;

use crate::g711::{linear_to_mulaw, mulaw_to_linear};
use crate::{Codec, CodecError};

/// G.711 mu-law, payload type 0.
#[derive(Default)]
pub struct PCMU {}

impl PCMU {
    pub fn new() -> Self {
        Self {}
    }
}

impl Codec for PCMU {
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        for (sample, out) in src.iter().zip(dst.iter_mut()) {
            *out = linear_to_mulaw(*sample);
        }
        Ok(src.len())
    }

    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<usize> {
        if dst.len() < src.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        for (byte, out) in src.iter().zip(dst.iter_mut()) {
            *out = mulaw_to_linear(*byte);
        }
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_roundtrip_lengths() {
        let pcm: Vec<i16> = (0..160)
            .map(|i| (1000.0 * (0.1 * i as f64).sin()) as i16)
            .collect();

        let mut codec = PCMU::new();
        let mut encoded = vec![0u8; pcm.len()];
        let n = codec.encode(&pcm, &mut encoded).unwrap();
        assert_eq!(n, 160);

        let mut decoded = vec![0i16; n];
        let n = codec.decode(&encoded[..n], &mut decoded).unwrap();
        assert_eq!(n, 160);

        // 160 encoded bytes from 320 bytes of PCM, and 320 decoded bytes
        // back out again.
        assert_eq!(encoded.len() * 2, pcm.len() * 2);
        assert_eq!(decoded.len() * 2, pcm.len() * 2);

        for (a, b) in pcm.iter().zip(decoded.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 64);
        }
    }

    #[test]
    fn test_short_buffer() {
        let mut codec = PCMU::new();
        let mut dst = [0u8; 4];
        assert!(codec.encode(&[0i16; 8], &mut dst).is_err());
    }
}
