//! voxlink - encrypted relay/P2P transport for real-time voice calls
//!
//! This library provides the transport core of a two-party call: the
//! encrypted packet envelope, per-stream acknowledgement and retransmission,
//! congestion and bitrate control, jitter buffering, relay/P2P path
//! selection and the session state machine that ties them together.

pub mod audio;
pub mod config;
pub mod network;
pub mod protocol;
pub mod session;

pub use config::SessionConfig;
pub use protocol::Packet;
pub use session::{ConnectionState, ErrorCode, Session};
