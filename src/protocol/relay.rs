//! Relay control protocol
//!
//! Control datagrams are distinguished from session packets by a 28-byte
//! marker: the 16-byte peer tag followed by twelve `0xFF` bytes. Requests
//! carry a TL constructor and body; relay responses additionally carry a
//! SHA-256 trailer over `peer_tag || constructor || body`, which is checked
//! before a response is trusted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use bytes::BufMut;
use sha2::{Digest, Sha256};

use super::wire::{ParseError, WireReader};

pub const PEER_TAG_LEN: usize = 16;
pub const MARKER_LEN: usize = PEER_TAG_LEN + 12;
const SIGNATURE_LEN: usize = 32;

pub const TLID_REFLECTOR_PING: u32 = 0xFDB4_C0A7;
pub const TLID_REFLECTOR_SELF_INFO: u32 = 0xC015_72C7;
pub const TLID_REFLECTOR_PEER_INFO: u32 = 0x27D9_371C;
pub const TLID_REFLECTOR_REQUEST_PACKETS_INFO: u32 = 0x1A06_FC96;
pub const TLID_REFLECTOR_LAST_PACKETS_INFO: u32 = 0x0E10_7305;

pub type PeerTag = [u8; PEER_TAG_LEN];

/// Whether a datagram is relay control traffic rather than a session packet
pub fn is_relay_control(data: &[u8]) -> bool {
    data.len() >= MARKER_LEN + 4 && data[PEER_TAG_LEN..MARKER_LEN].iter().all(|&b| b == 0xFF)
}

/// Requests a participant sends to its relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRequest {
    /// Raw path-RTT probe, answered with [`RelayResponse::SelfInfo`]
    Ping { query_id: i64 },
    /// Ask which of our recent packets the relay has seen
    RequestPacketsInfo { query_id: i64 },
}

/// Signed responses from a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayResponse {
    /// Our address as the relay sees it
    SelfInfo {
        date: i32,
        query_id: i64,
        public_addr: SocketAddr,
    },
    /// Both participants' public addresses, used for P2P attempts
    PeerInfo {
        my_addr: SocketAddrV4,
        peer_addr: SocketAddrV4,
    },
    /// Sequence numbers of our packets recently forwarded by the relay
    LastPacketsInfo {
        date: i32,
        query_id: i64,
        packet_ids: Vec<u32>,
    },
}

fn put_marker(out: &mut Vec<u8>, tag: &PeerTag) {
    out.put_slice(tag);
    out.put_bytes(0xFF, MARKER_LEN - PEER_TAG_LEN);
}

fn signature(tag: &PeerTag, signed: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(signed);
    hasher.finalize().into()
}

impl RelayRequest {
    pub fn encode(&self, tag: &PeerTag) -> Vec<u8> {
        let mut out = Vec::with_capacity(MARKER_LEN + 12);
        put_marker(&mut out, tag);
        match self {
            RelayRequest::Ping { query_id } => {
                out.put_u32_le(TLID_REFLECTOR_PING);
                out.put_i64_le(*query_id);
            }
            RelayRequest::RequestPacketsInfo { query_id } => {
                out.put_u32_le(TLID_REFLECTOR_REQUEST_PACKETS_INFO);
                out.put_i64_le(*query_id);
            }
        }
        out
    }

    /// Parse a request (relay side); returns the sender's peer tag
    pub fn decode(data: &[u8]) -> Result<(PeerTag, Self), ParseError> {
        if !is_relay_control(data) {
            return Err(ParseError::BadValue("relay marker"));
        }
        let mut r = WireReader::new(data);
        let tag = r.array::<PEER_TAG_LEN>()?;
        r.bytes(MARKER_LEN - PEER_TAG_LEN)?;
        let request = match r.u32()? {
            TLID_REFLECTOR_PING => RelayRequest::Ping { query_id: r.i64()? },
            TLID_REFLECTOR_REQUEST_PACKETS_INFO => {
                RelayRequest::RequestPacketsInfo { query_id: r.i64()? }
            }
            other => return Err(ParseError::UnknownType(other)),
        };
        Ok((tag, request))
    }
}

impl RelayResponse {
    /// Serialize and sign (relay side)
    pub fn encode(&self, tag: &PeerTag) -> Vec<u8> {
        let mut signed = Vec::with_capacity(40);
        match self {
            RelayResponse::SelfInfo {
                date,
                query_id,
                public_addr,
            } => {
                signed.put_u32_le(TLID_REFLECTOR_SELF_INFO);
                signed.put_i32_le(*date);
                signed.put_i64_le(*query_id);
                let ip = match public_addr.ip() {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                signed.put_slice(&ip.octets());
                signed.put_i32_le(public_addr.port() as i32);
            }
            RelayResponse::PeerInfo { my_addr, peer_addr } => {
                signed.put_u32_le(TLID_REFLECTOR_PEER_INFO);
                signed.put_u32_le(u32::from(*my_addr.ip()));
                signed.put_u32_le(my_addr.port() as u32);
                signed.put_u32_le(u32::from(*peer_addr.ip()));
                signed.put_u32_le(peer_addr.port() as u32);
            }
            RelayResponse::LastPacketsInfo {
                date,
                query_id,
                packet_ids,
            } => {
                signed.put_u32_le(TLID_REFLECTOR_LAST_PACKETS_INFO);
                signed.put_i32_le(*date);
                signed.put_i64_le(*query_id);
                signed.put_u32_le(packet_ids.len() as u32);
                for id in packet_ids {
                    signed.put_u32_le(*id);
                }
            }
        }

        let mut out = Vec::with_capacity(MARKER_LEN + signed.len() + SIGNATURE_LEN);
        put_marker(&mut out, tag);
        out.put_slice(&signed);
        out.put_slice(&signature(tag, &signed));
        out
    }

    /// Parse and verify a response addressed to `tag`
    pub fn decode(data: &[u8], tag: &PeerTag) -> Result<Self, ParseError> {
        if !is_relay_control(data) || data.len() < MARKER_LEN + 4 + SIGNATURE_LEN {
            return Err(ParseError::Truncated);
        }
        let (signed_part, sig) = data.split_at(data.len() - SIGNATURE_LEN);
        let signed = &signed_part[MARKER_LEN..];
        if signature(tag, signed).as_slice() != sig {
            return Err(ParseError::BadValue("relay signature"));
        }

        let mut r = WireReader::new(signed);
        let response = match r.u32()? {
            TLID_REFLECTOR_SELF_INFO => {
                let date = r.i32()?;
                let query_id = r.i64()?;
                let ip = Ipv6Addr::from(r.array::<16>()?);
                let port = r.i32()?;
                let ip = match ip.to_ipv4_mapped() {
                    Some(v4) => IpAddr::V4(v4),
                    None => IpAddr::V6(ip),
                };
                RelayResponse::SelfInfo {
                    date,
                    query_id,
                    public_addr: SocketAddr::new(ip, port as u16),
                }
            }
            TLID_REFLECTOR_PEER_INFO => {
                let my_ip = Ipv4Addr::from(r.u32()?);
                let my_port = r.u32()? as u16;
                let peer_ip = Ipv4Addr::from(r.u32()?);
                let peer_port = r.u32()? as u16;
                RelayResponse::PeerInfo {
                    my_addr: SocketAddrV4::new(my_ip, my_port),
                    peer_addr: SocketAddrV4::new(peer_ip, peer_port),
                }
            }
            TLID_REFLECTOR_LAST_PACKETS_INFO => {
                let date = r.i32()?;
                let query_id = r.i64()?;
                let count = r.u32()? as usize;
                if count > r.remaining() / 4 {
                    return Err(ParseError::Truncated);
                }
                let mut packet_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    packet_ids.push(r.u32()?);
                }
                RelayResponse::LastPacketsInfo {
                    date,
                    query_id,
                    packet_ids,
                }
            }
            other => return Err(ParseError::UnknownType(other)),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: PeerTag = [0x11; PEER_TAG_LEN];

    #[test]
    fn test_ping_request_is_control_traffic() {
        let bytes = RelayRequest::Ping { query_id: 77 }.encode(&TAG);
        assert!(is_relay_control(&bytes));
        let (tag, request) = RelayRequest::decode(&bytes).unwrap();
        assert_eq!(tag, TAG);
        assert_eq!(request, RelayRequest::Ping { query_id: 77 });
    }

    #[test]
    fn test_signed_self_info() {
        let response = RelayResponse::SelfInfo {
            date: 1_700_000_000,
            query_id: 5,
            public_addr: "203.0.113.9:40000".parse().unwrap(),
        };
        let bytes = response.encode(&TAG);
        assert_eq!(RelayResponse::decode(&bytes, &TAG).unwrap(), response);
    }

    #[test]
    fn test_forged_response_is_rejected() {
        let response = RelayResponse::PeerInfo {
            my_addr: "198.51.100.1:1000".parse().unwrap(),
            peer_addr: "198.51.100.2:2000".parse().unwrap(),
        };
        let mut bytes = response.encode(&TAG);
        let n = bytes.len();
        bytes[n - 40] ^= 0x01;
        assert!(RelayResponse::decode(&bytes, &TAG).is_err());

        let other_tag = [0x22; PEER_TAG_LEN];
        assert!(RelayResponse::decode(&response.encode(&TAG), &other_tag).is_err());
    }

    #[test]
    fn test_session_packet_is_not_control() {
        let mut datagram = TAG.to_vec();
        datagram.extend_from_slice(&[0x01; 40]);
        assert!(!is_relay_control(&datagram));
    }
}
