//! RTP media engine.
//!
//! Wire handling for RTP packets, per-stream sequencing and jitter
//! accounting, the loss-tolerant jitter buffer, receiver-report
//! generation, the canned SDP audio body, and the per-call socket loop
//! that paces G.711 frames.

pub mod buffer;
pub mod packet;
pub mod rtcp;
pub mod sdp;
pub mod stream;
pub mod transport;

pub use packet::{PacketError, PayloadType, RtpPacket};
pub use stream::{RtpSession, SessionConfig, StreamStats};
pub use transport::{MediaHandle, RtpTransport};
