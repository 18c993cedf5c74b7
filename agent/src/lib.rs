//! The user agent: REGISTER/INVITE/ACK/BYE dispatch, the user and call
//! tables, auto-answer, and the counters observers read by snapshot.

pub mod call;
pub mod config;
pub mod server;

pub use call::{AgentStats, CallState, CallSummary, Registration};
pub use config::Config;
pub use server::UserAgent;
