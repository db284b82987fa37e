//! Extra (signaling) records piggybacked on session packets
//!
//! Record layout: `len:u8 | type:u8 | body`, where `len` counts the type byte
//! and the body. A `len` of 0 escapes to a `u16` length for records that do
//! not fit in a byte (group call keys).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::BufMut;
use sha2::{Digest, Sha256};

use super::wire::{ParseError, WireReader};

pub const EXTRA_TYPE_STREAM_FLAGS: u8 = 1;
pub const EXTRA_TYPE_STREAM_CSD: u8 = 2;
pub const EXTRA_TYPE_LAN_ENDPOINT: u8 = 3;
pub const EXTRA_TYPE_NETWORK_CHANGED: u8 = 4;
pub const EXTRA_TYPE_GROUP_CALL_KEY: u8 = 5;
pub const EXTRA_TYPE_GROUP_CALL_UPGRADE: u8 = 6;
pub const EXTRA_TYPE_IPV6_ENDPOINT: u8 = 7;
pub const EXTRA_TYPE_INIT: u8 = 8;
pub const EXTRA_TYPE_INIT_ACK: u8 = 9;
pub const EXTRA_TYPE_PING: u8 = 10;
pub const EXTRA_TYPE_PONG: u8 = 11;

/// Stream flag bits carried by [`ExtraRecord::StreamFlags`]
pub const STREAM_FLAG_ENABLED: u32 = 1;
pub const STREAM_FLAG_DTX: u32 = 2;
pub const STREAM_FLAG_EXTRA_EC: u32 = 4;
pub const STREAM_FLAG_PAUSED: u32 = 8;

/// Capability bits carried by [`InitRecord::flags`]
pub const INIT_FLAG_DATA_SAVING: u32 = 1;
pub const INIT_FLAG_GROUP_CALLS: u32 = 2;
pub const INIT_FLAG_SHORT_ENVELOPE: u32 = 4;
pub const INIT_FLAG_VIDEO: u32 = 8;
pub const INIT_FLAG_P2P: u32 = 16;

/// Network-changed flag: the sender switched to data saving
pub const NETWORK_CHANGED_FLAG_DATA_SAVING: u32 = 1;

/// Build a codec identifier from its four-character code
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub const CODEC_OPUS: u32 = fourcc(b"Opus");
pub const CODEC_VP8: u32 = fourcc(b"VP80");
pub const CODEC_VP9: u32 = fourcc(b"VP90");
pub const CODEC_AVC: u32 = fourcc(b"AVC ");

/// Kind of a negotiated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Audio = 1,
    Video = 2,
}

impl TryFrom<u8> for StreamKind {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StreamKind::Audio),
            2 => Ok(StreamKind::Video),
            other => Err(ParseError::UnknownType(other as u32)),
        }
    }
}

/// Handshake request advertising our protocol range and capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRecord {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub flags: u32,
    pub audio_codecs: Vec<u32>,
    pub frame_duration_ms: u16,
}

/// One stream announced in an init-ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub id: u8,
    pub kind: StreamKind,
    pub codec: u32,
    pub frame_duration_ms: u16,
    pub enabled: bool,
}

/// Handshake response listing the streams the sender will transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAckRecord {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub streams: Vec<StreamDescriptor>,
}

/// A typed signaling record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraRecord {
    StreamFlags {
        stream_id: u8,
        flags: u32,
    },
    StreamCsd {
        stream_id: u8,
        width: u16,
        height: u16,
        csd: Vec<Vec<u8>>,
    },
    LanEndpoint(SocketAddrV4),
    Ipv6Endpoint(SocketAddrV6),
    NetworkChanged {
        flags: u32,
    },
    GroupCallKey(Vec<u8>),
    GroupCallUpgradeRequest,
    Init(InitRecord),
    InitAck(InitAckRecord),
    Ping(u32),
    Pong(u32),
}

impl ExtraRecord {
    pub fn type_id(&self) -> u8 {
        match self {
            ExtraRecord::StreamFlags { .. } => EXTRA_TYPE_STREAM_FLAGS,
            ExtraRecord::StreamCsd { .. } => EXTRA_TYPE_STREAM_CSD,
            ExtraRecord::LanEndpoint(_) => EXTRA_TYPE_LAN_ENDPOINT,
            ExtraRecord::Ipv6Endpoint(_) => EXTRA_TYPE_IPV6_ENDPOINT,
            ExtraRecord::NetworkChanged { .. } => EXTRA_TYPE_NETWORK_CHANGED,
            ExtraRecord::GroupCallKey(_) => EXTRA_TYPE_GROUP_CALL_KEY,
            ExtraRecord::GroupCallUpgradeRequest => EXTRA_TYPE_GROUP_CALL_UPGRADE,
            ExtraRecord::Init(_) => EXTRA_TYPE_INIT,
            ExtraRecord::InitAck(_) => EXTRA_TYPE_INIT_ACK,
            ExtraRecord::Ping(_) => EXTRA_TYPE_PING,
            ExtraRecord::Pong(_) => EXTRA_TYPE_PONG,
        }
    }

    /// Records that must be handled every time they arrive
    pub fn bypasses_dedup(&self) -> bool {
        matches!(
            self,
            ExtraRecord::Init(_)
                | ExtraRecord::InitAck(_)
                | ExtraRecord::Ping(_)
                | ExtraRecord::Pong(_)
        )
    }

    /// Serialize the type-specific body
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            ExtraRecord::StreamFlags { stream_id, flags } => {
                out.put_u8(*stream_id);
                out.put_u32_le(*flags);
            }
            ExtraRecord::StreamCsd {
                stream_id,
                width,
                height,
                csd,
            } => {
                out.put_u8(*stream_id);
                out.put_u16_le(*width);
                out.put_u16_le(*height);
                out.put_u8(csd.len() as u8);
                for blob in csd {
                    out.put_u16_le(blob.len() as u16);
                    out.put_slice(blob);
                }
            }
            ExtraRecord::LanEndpoint(addr) => {
                out.put_slice(&addr.ip().octets());
                out.put_u16_le(addr.port());
            }
            ExtraRecord::Ipv6Endpoint(addr) => {
                out.put_slice(&addr.ip().octets());
                out.put_u16_le(addr.port());
            }
            ExtraRecord::NetworkChanged { flags } => out.put_u32_le(*flags),
            ExtraRecord::GroupCallKey(key) => out.put_slice(key),
            ExtraRecord::GroupCallUpgradeRequest => {}
            ExtraRecord::Init(init) => init.encode(out),
            ExtraRecord::InitAck(ack) => ack.encode(out),
            ExtraRecord::Ping(id) | ExtraRecord::Pong(id) => out.put_u32_le(*id),
        }
    }

    /// Parse a body for the given record type
    pub fn decode_body(type_id: u8, body: &[u8]) -> Result<Self, ParseError> {
        let mut r = WireReader::new(body);
        let record = match type_id {
            EXTRA_TYPE_STREAM_FLAGS => ExtraRecord::StreamFlags {
                stream_id: r.u8()?,
                flags: r.u32()?,
            },
            EXTRA_TYPE_STREAM_CSD => {
                let stream_id = r.u8()?;
                let width = r.u16()?;
                let height = r.u16()?;
                let count = r.u8()?;
                let mut csd = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let len = r.u16()? as usize;
                    csd.push(r.bytes(len)?.to_vec());
                }
                ExtraRecord::StreamCsd {
                    stream_id,
                    width,
                    height,
                    csd,
                }
            }
            EXTRA_TYPE_LAN_ENDPOINT => {
                let ip = Ipv4Addr::from(r.array::<4>()?);
                ExtraRecord::LanEndpoint(SocketAddrV4::new(ip, r.u16()?))
            }
            EXTRA_TYPE_IPV6_ENDPOINT => {
                let ip = Ipv6Addr::from(r.array::<16>()?);
                ExtraRecord::Ipv6Endpoint(SocketAddrV6::new(ip, r.u16()?, 0, 0))
            }
            EXTRA_TYPE_NETWORK_CHANGED => ExtraRecord::NetworkChanged { flags: r.u32()? },
            EXTRA_TYPE_GROUP_CALL_KEY => {
                let key = r.rest();
                if key.len() != 256 {
                    return Err(ParseError::BadValue("group call key length"));
                }
                ExtraRecord::GroupCallKey(key.to_vec())
            }
            EXTRA_TYPE_GROUP_CALL_UPGRADE => ExtraRecord::GroupCallUpgradeRequest,
            EXTRA_TYPE_INIT => ExtraRecord::Init(InitRecord::decode(&mut r)?),
            EXTRA_TYPE_INIT_ACK => ExtraRecord::InitAck(InitAckRecord::decode(&mut r)?),
            EXTRA_TYPE_PING => ExtraRecord::Ping(r.u32()?),
            EXTRA_TYPE_PONG => ExtraRecord::Pong(r.u32()?),
            other => return Err(ParseError::UnknownType(other as u32)),
        };
        Ok(record)
    }

    /// Serialize as a length-prefixed record
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let len = body.len() + 1;
        if len <= u8::MAX as usize {
            out.put_u8(len as u8);
        } else {
            out.put_u8(0);
            out.put_u16_le(len as u16);
        }
        out.put_u8(self.type_id());
        out.put_slice(&body);
    }

    /// Parse one length-prefixed record
    ///
    /// Returns `Ok(None)` for a well-formed record of an unknown type, which
    /// is skipped rather than failing the whole packet.
    pub fn decode(r: &mut WireReader<'_>) -> Result<Option<Self>, ParseError> {
        let len = match r.u8()? {
            0 => r.u16()? as usize,
            n => n as usize,
        };
        if len == 0 {
            return Err(ParseError::BadValue("empty extra record"));
        }
        let raw = r.bytes(len)?;
        match Self::decode_body(raw[0], &raw[1..]) {
            Ok(record) => Ok(Some(record)),
            Err(ParseError::UnknownType(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fingerprint used to skip retransmitted copies of an already-handled record
    pub fn dedup_hash(&self) -> u64 {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let digest = Sha256::digest(&body);
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }
}

impl InitRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.protocol_version);
        out.put_u32_le(self.min_protocol_version);
        out.put_u32_le(self.flags);
        out.put_u8(self.audio_codecs.len() as u8);
        for codec in &self.audio_codecs {
            out.put_u32_le(*codec);
        }
        out.put_u16_le(self.frame_duration_ms);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ParseError> {
        let protocol_version = r.u32()?;
        let min_protocol_version = r.u32()?;
        let flags = r.u32()?;
        let count = r.u8()?;
        let mut audio_codecs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            audio_codecs.push(r.u32()?);
        }
        Ok(Self {
            protocol_version,
            min_protocol_version,
            flags,
            audio_codecs,
            frame_duration_ms: r.u16()?,
        })
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl InitAckRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.protocol_version);
        out.put_u32_le(self.min_protocol_version);
        out.put_u8(self.streams.len() as u8);
        for stream in &self.streams {
            out.put_u8(stream.id);
            out.put_u8(stream.kind as u8);
            out.put_u32_le(stream.codec);
            out.put_u16_le(stream.frame_duration_ms);
            out.put_u8(stream.enabled as u8);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ParseError> {
        let protocol_version = r.u32()?;
        let min_protocol_version = r.u32()?;
        let count = r.u8()?;
        let mut streams = Vec::with_capacity(count as usize);
        for _ in 0..count {
            streams.push(StreamDescriptor {
                id: r.u8()?,
                kind: StreamKind::try_from(r.u8()?)?,
                codec: r.u32()?,
                frame_duration_ms: r.u16()?,
                enabled: r.u8()? != 0,
            });
        }
        Ok(Self {
            protocol_version,
            min_protocol_version,
            streams,
        })
    }
}
