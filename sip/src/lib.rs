//! SIP signaling: message codec, transaction state machines, and the UDP
//! transport they ride on.
//!
//! The message codec parses and emits RFC 3261-style text messages. The
//! transaction layer matches requests and responses to client/server
//! transactions and drives the retransmission and timeout timers that make
//! delivery reliable over a datagram transport.

pub mod fsm;
pub mod message;
pub mod transaction;
pub mod transport;
pub mod udp;
