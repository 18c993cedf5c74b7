use std::net::SocketAddr;
use std::time::{Duration, Instant};

use media::{MediaHandle, RtpSession, RtpTransport};
use sip::message::Message;
use strum_macros;
use strum_macros::EnumString;

#[derive(
    strum_macros::Display, EnumString, Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum CallState {
    Incoming,
    Calling,
    Ringing,
    Established,
    Terminated,
    Failed,
}

/// One dialog, keyed by Call-ID. At most one lives in the active set per
/// Call-ID; terminal calls leave the set and land in the counters.
pub struct Call {
    pub id: String,
    pub local: String,
    pub remote: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub state: CallState,
    pub started_at: Instant,
    pub answered_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    /// Peer signaling address.
    pub remote_addr: SocketAddr,
    /// Peer media endpoint learned from its session body.
    pub remote_media: Option<(String, u16)>,
    /// The dialog-creating INVITE, kept for answering and for ACK
    /// construction.
    pub request: Option<Message>,
    /// Media resources allocated at answer time, waiting for the dialog to
    /// establish.
    pub pending_media: Option<(RtpSession, RtpTransport)>,
    /// Live media loop once established.
    pub media: Option<MediaHandle>,
}

impl Call {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CallState::Terminated | CallState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct CallSummary {
    pub id: String,
    pub state: CallState,
    pub local: String,
    pub remote: String,
    pub duration: Duration,
}

/// A registered binding in the user table.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: String,
    pub contact: String,
    pub expires: u32,
    pub remote: SocketAddr,
    pub registered_at: Instant,
}

impl Registration {
    pub fn expired(&self) -> bool {
        self.registered_at.elapsed() >= Duration::from_secs(self.expires as u64)
    }
}

/// Counter and table snapshot handed to observers by copy.
#[derive(Debug, Default, Clone)]
pub struct AgentStats {
    pub calls_received: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub active_calls: usize,
    pub registered_users: usize,
    pub transactions: usize,
    pub parse_errors: u64,
    pub uptime: Duration,
}
