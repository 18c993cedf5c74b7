use anyhow::Result;

use crate::g711::{alaw_to_linear, linear_to_alaw};
use crate::{Codec, CodecError};

/// G.711 A-law, payload type 8.
#[derive(Default)]
pub struct PCMA {}

impl PCMA {
    pub fn new() -> Self {
        Self {}
    }
}

impl Codec for PCMA {
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        for (sample, out) in src.iter().zip(dst.iter_mut()) {
            *out = linear_to_alaw(*sample);
        }
        Ok(src.len())
    }

    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<usize> {
        if dst.len() < src.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        for (byte, out) in src.iter().zip(dst.iter_mut()) {
            *out = alaw_to_linear(*byte);
        }
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_preserved() {
        let pcm: Vec<i16> = (0..160)
            .map(|i| (1000.0 * (0.1 * i as f64).sin()) as i16)
            .collect();

        let mut codec = PCMA::new();
        let mut encoded = vec![0u8; pcm.len()];
        let encoded_n = codec.encode(&pcm, &mut encoded).unwrap();
        let mut decoded = vec![0i16; encoded_n];
        let decoded_n = codec.decode(&encoded[..encoded_n], &mut decoded).unwrap();
        assert_eq!(decoded_n, pcm.len());
    }
}
