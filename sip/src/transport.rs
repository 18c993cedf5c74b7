use thiserror::Error;

use super::message::Message;

pub use super::udp::UdpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport bound")]
    NoTransport,
    #[error("transport send failed: {0}")]
    SendFailed(String),
}

/// What the signaling transport delivers to its owner. The owner selects
/// over this stream; parse failures arrive as events so they can be
/// counted without unwinding anything.
#[derive(Debug)]
pub enum SipEvent {
    Message(Message),
    ParseError,
    Error(String),
}
