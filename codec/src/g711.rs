//! G.711 companding math and lookup tables.
//!
//! Both variants run off precomputed tables: a 65536-entry encode table
//! indexed by `pcm + 32768` and a 256-entry decode table per variant.
//! The per-sample functions below define the tables and are kept around
//! for the table builders and the tests.

use lazy_static::lazy_static;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

lazy_static! {
    static ref MULAW_ENCODE: Vec<u8> = {
        let mut table = vec![0u8; 65536];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = encode_mulaw_sample((i as i32 - 32768) as i16);
        }
        table
    };
    static ref ALAW_ENCODE: Vec<u8> = {
        let mut table = vec![0u8; 65536];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = encode_alaw_sample((i as i32 - 32768) as i16);
        }
        table
    };
    static ref MULAW_DECODE: [i16; 256] = {
        let mut table = [0i16; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = decode_mulaw_sample(i as u8);
        }
        table
    };
    static ref ALAW_DECODE: [i16; 256] = {
        let mut table = [0i16; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = decode_alaw_sample(i as u8);
        }
        table
    };
}

/// Companded segment of a clipped magnitude: the index of the leading bit
/// above bit 7, or zero when the magnitude fits in the linear segment.
fn segment(magnitude: i32) -> u8 {
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    exponent
}

fn encode_mulaw_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80u8
    } else {
        0x00
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let exponent = segment(pcm);
    let mantissa = ((pcm >> (exponent + 3)) & 0x0f) as u8;
    !(sign | (exponent << 4) | mantissa)
}

fn decode_mulaw_sample(byte: u8) -> i16 {
    let mu = !byte;
    let sign = mu & 0x80;
    let exponent = (mu >> 4) & 0x07;
    let mantissa = (mu & 0x0f) as i32;

    let sample = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -sample as i16
    } else {
        sample as i16
    }
}

fn encode_alaw_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    // A-law keeps the sign bit set for non-negative samples.
    let sign = if pcm >= 0 {
        0x80u8
    } else {
        pcm = -pcm - 1;
        0x00
    };
    if pcm > CLIP {
        pcm = CLIP;
    }

    let exponent = segment(pcm);
    let mantissa = if exponent == 0 {
        ((pcm >> 4) & 0x0f) as u8
    } else {
        ((pcm >> (exponent + 3)) & 0x0f) as u8
    };
    (sign | (exponent << 4) | mantissa) ^ 0x55
}

fn decode_alaw_sample(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let sign = a & 0x80;
    let exponent = (a >> 4) & 0x07;
    let mantissa = (a & 0x0f) as i32;

    let mut sample = (mantissa << 4) + 8;
    if exponent != 0 {
        sample = (sample + 0x100) << (exponent - 1);
    }
    if sign != 0 {
        sample as i16
    } else {
        -sample as i16
    }
}

pub fn linear_to_mulaw(sample: i16) -> u8 {
    MULAW_ENCODE[(sample as i32 + 32768) as usize]
}

pub fn mulaw_to_linear(byte: u8) -> i16 {
    MULAW_DECODE[byte as usize]
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    ALAW_ENCODE[(sample as i32 + 32768) as usize]
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    ALAW_DECODE[byte as usize]
}

/// Transcode between the two companded formats through linear PCM.
pub fn mulaw_to_alaw(byte: u8) -> u8 {
    linear_to_alaw(mulaw_to_linear(byte))
}

pub fn alaw_to_mulaw(byte: u8) -> u8 {
    linear_to_mulaw(alaw_to_linear(byte))
}
