//! Wire protocol definitions
//!
//! Session packet framings, extra (signaling) records, and the relay
//! control protocol.

pub mod extra;
mod packet;
pub mod relay;
mod wire;

pub use extra::{ExtraRecord, InitAckRecord, InitRecord, StreamDescriptor, StreamKind};
pub use packet::{
    EcFrames, Fragment, Framing, Packet, StreamData, CURRENT_FRAMING_MIN_VERSION,
    LEGACY_FRAMING_MAGIC, STREAM_ID_AUDIO, STREAM_ID_SIGNALING, STREAM_ID_VIDEO,
};
pub use relay::{is_relay_control, PeerTag, RelayRequest, RelayResponse, PEER_TAG_LEN};
pub use wire::{ParseError, WireReader};

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 11;

/// Oldest peer protocol version we interoperate with
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Whether a peer advertising `[min_version, version]` can talk to us
pub fn is_compatible(peer_version: u32, peer_min_version: u32) -> bool {
    peer_version >= MIN_PROTOCOL_VERSION && PROTOCOL_VERSION >= peer_min_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible(PROTOCOL_VERSION, MIN_PROTOCOL_VERSION));
        assert!(is_compatible(5, 3));
        assert!(!is_compatible(2, 1));
        assert!(!is_compatible(20, PROTOCOL_VERSION + 1));
    }
}
