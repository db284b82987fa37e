//! Network module for relay and P2P call transport
//!
//! Handles the packet envelope, sequence/ack bookkeeping, retransmission,
//! congestion control, jitter buffering, path selection and the sockets
//! underneath.

mod congestion;
mod encryption;
pub mod endpoint;
mod endpoint_selector;
mod error;
mod history;
mod jitter_buffer;
pub mod obfuscated_tcp;
mod reliable_queue;
mod sequence_tracker;
pub mod socks5;
mod transport;

pub use congestion::{BandwidthAction, BitrateController, CongestionController, MAX_INFLIGHT_SLOTS};
pub use encryption::{EnvelopeVersion, WireCodec, FINGERPRINT_LEN, KEY_LEN, MSG_KEY_LEN};
pub use endpoint::{Endpoint, EndpointKind, EndpointMap, RelayDescriptor};
pub use endpoint_selector::{
    EndpointSelector, PathSwitch, PingKind, PingRequest, ProbeOutcome, SwitchReason,
    UdpConnectivity,
};
pub use error::{CryptoError, NetworkError};
pub use history::History;
pub use jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterBufferResult, JitterBufferState, JitterBufferStats,
    PlaybackHint,
};
pub use reliable_queue::{ReliableOutgoingPacket, ReliableQueue, MAX_SENT_SEQS};
pub use sequence_tracker::{
    seqgt, AckOutcome, AckedPacket, RecentOutgoingPacket, SequenceTracker, ACK_WINDOW,
    MAX_RECENT_PACKETS,
};
pub use transport::{TcpLinkHandle, TransportEvent, UdpTransport};
