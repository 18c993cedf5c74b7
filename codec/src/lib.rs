use anyhow::Result;
use thiserror::Error;

pub mod g711;
pub mod pcma;
pub mod pcmu;

pub use pcma::PCMA;
pub use pcmu::PCMU;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("destination buffer too small")]
    BufferTooSmall,
}

pub trait Codec: Send {
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<usize>;
    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<usize>;
}
