//! Logical session packet and its two on-the-wire framings
//!
//! Current framing (peer protocol >= 10):
//! - seq: u32, ack_seq: u32, ack_mask: u32
//! - flags: u8 (stream id in bits 0-1, then len16, extra EC, extra signaling,
//!   recv_ts, fragmented, keyframe)
//! - stream_id_ext: u8 when the 2-bit stream id is 3
//! - stream data (stream id != 0): length u8|u16, pts u32,
//!   [fragment_index u8, fragment_count u8], payload
//! - [recv_ts: u32], [extra EC records], [extra signaling records]
//!
//! Legacy framing starts with the `decryptedAudioBlock` TL constructor, a
//! TL string of random bytes, and an explicit packet type byte; bodies are
//! TL `bytes`.

use bytes::BufMut;
use rand::RngCore;

use super::extra::ExtraRecord;
use super::wire::{put_tl_bytes, ParseError, WireReader};

/// TL constructor that opens every legacy-framed packet
pub const LEGACY_FRAMING_MAGIC: u32 = 0xDBF9_48C1;

/// First peer protocol version that understands the current framing
pub const CURRENT_FRAMING_MIN_VERSION: u32 = 10;

pub const STREAM_ID_SIGNALING: u8 = 0;
pub const STREAM_ID_AUDIO: u8 = 1;
pub const STREAM_ID_VIDEO: u8 = 2;

const FLAG_STREAM_MASK: u8 = 0x03;
const FLAG_LEN16: u8 = 0x04;
const FLAG_EXTRA_EC: u8 = 0x08;
const FLAG_EXTRA_SIGNALING: u8 = 0x10;
const FLAG_RECV_TS: u8 = 0x20;
const FLAG_FRAGMENTED: u8 = 0x40;
const FLAG_KEYFRAME: u8 = 0x80;

const LEGACY_TYPE_INIT: u8 = 1;
const LEGACY_TYPE_INIT_ACK: u8 = 2;
const LEGACY_TYPE_STREAM_DATA: u8 = 4;
const LEGACY_TYPE_PING: u8 = 6;
const LEGACY_TYPE_PONG: u8 = 7;
const LEGACY_TYPE_NOP: u8 = 14;
const LEGACY_TYPE_STREAM_EC: u8 = 17;

const LEGACY_PFLAG_HAS_EXTRA: u8 = 0x01;
const LEGACY_PFLAG_HAS_DATA: u8 = 0x02;
const LEGACY_PFLAG_HAS_RECV_TS: u8 = 0x04;

const LEGACY_DATA_KEYFRAME: u8 = 0x01;
const LEGACY_DATA_FRAGMENTED: u8 = 0x02;

/// Which framing a packet uses on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Legacy,
    Current,
}

impl Framing {
    /// Framing to use towards a peer speaking `peer_version`
    pub fn for_peer_version(peer_version: u32) -> Self {
        if peer_version >= CURRENT_FRAMING_MIN_VERSION {
            Framing::Current
        } else {
            Framing::Legacy
        }
    }
}

/// Position of a fragment within a larger frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub index: u8,
    pub count: u8,
}

/// Media payload carried by a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    /// Presentation timestamp in milliseconds
    pub pts: u32,
    pub keyframe: bool,
    pub fragment: Option<Fragment>,
    pub payload: Vec<u8>,
}

/// Redundant copies of earlier frames (error correction)
///
/// Frame `i` belongs to `base_pts - (i + 1) * frame_duration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcFrames {
    pub base_pts: u32,
    pub frames: Vec<Vec<u8>>,
}

/// A decoded session packet, independent of framing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub seq: u32,
    pub ack_seq: u32,
    pub ack_mask: u32,
    pub stream_id: u8,
    pub data: Option<StreamData>,
    pub recv_ts: Option<u32>,
    pub ec: Option<EcFrames>,
    pub extras: Vec<ExtraRecord>,
}

impl Packet {
    /// A signaling-stream packet carrying only extras
    pub fn signaling(seq: u32, extras: Vec<ExtraRecord>) -> Self {
        Self {
            seq,
            stream_id: STREAM_ID_SIGNALING,
            extras,
            ..Default::default()
        }
    }

    /// Serialize using the given framing
    pub fn encode(&self, framing: Framing) -> Vec<u8> {
        match framing {
            Framing::Current => self.encode_current(),
            Framing::Legacy => self.encode_legacy(),
        }
    }

    /// Parse a decrypted packet, detecting its framing
    pub fn decode(data: &[u8]) -> Result<(Self, Framing), ParseError> {
        if data.len() >= 4 && data[..4] == LEGACY_FRAMING_MAGIC.to_le_bytes() {
            Ok((Self::decode_legacy(data)?, Framing::Legacy))
        } else {
            Ok((Self::decode_current(data)?, Framing::Current))
        }
    }

    fn encode_current(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.put_u32_le(self.seq);
        out.put_u32_le(self.ack_seq);
        out.put_u32_le(self.ack_mask);

        let has_stream = self.stream_id != STREAM_ID_SIGNALING;
        let data = if has_stream { self.data.as_ref() } else { None };
        let ec = match (data, &self.ec) {
            (Some(_), Some(ec)) if !ec.frames.is_empty() => Some(ec),
            _ => None,
        };

        let mut flags = self.stream_id.min(FLAG_STREAM_MASK);
        if let Some(d) = data {
            if d.payload.len() > u8::MAX as usize {
                flags |= FLAG_LEN16;
            }
            if d.fragment.is_some() {
                flags |= FLAG_FRAGMENTED;
            }
            if d.keyframe {
                flags |= FLAG_KEYFRAME;
            }
        }
        if ec.is_some() {
            flags |= FLAG_EXTRA_EC;
        }
        if !self.extras.is_empty() {
            flags |= FLAG_EXTRA_SIGNALING;
        }
        if self.recv_ts.is_some() {
            flags |= FLAG_RECV_TS;
        }
        out.put_u8(flags);
        if self.stream_id >= FLAG_STREAM_MASK {
            out.put_u8(self.stream_id);
        }

        if has_stream {
            let empty = StreamData {
                pts: 0,
                keyframe: false,
                fragment: None,
                payload: Vec::new(),
            };
            let d = data.unwrap_or(&empty);
            if flags & FLAG_LEN16 != 0 {
                out.put_u16_le(d.payload.len() as u16);
            } else {
                out.put_u8(d.payload.len() as u8);
            }
            out.put_u32_le(d.pts);
            if let Some(fragment) = d.fragment {
                out.put_u8(fragment.index);
                out.put_u8(fragment.count);
            }
            out.put_slice(&d.payload);
        }

        if let Some(ts) = self.recv_ts {
            out.put_u32_le(ts);
        }

        if let Some(ec) = ec {
            // Positions encode pts offsets, so stop at the first frame that
            // does not fit instead of skipping it
            let frames: Vec<&Vec<u8>> = ec
                .frames
                .iter()
                .take(u8::MAX as usize)
                .take_while(|f| f.len() <= u8::MAX as usize)
                .collect();
            out.put_u8(frames.len() as u8);
            for frame in frames {
                out.put_u8(frame.len() as u8);
                out.put_slice(frame);
            }
        }

        if !self.extras.is_empty() {
            out.put_u8(self.extras.len() as u8);
            for extra in &self.extras {
                extra.encode(&mut out);
            }
        }
        out
    }

    fn decode_current(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = WireReader::new(data);
        let seq = r.u32()?;
        let ack_seq = r.u32()?;
        let ack_mask = r.u32()?;
        let flags = r.u8()?;
        let mut stream_id = flags & FLAG_STREAM_MASK;
        if stream_id == FLAG_STREAM_MASK {
            stream_id = r.u8()?;
        }

        let mut packet = Packet {
            seq,
            ack_seq,
            ack_mask,
            stream_id,
            ..Default::default()
        };

        if stream_id != STREAM_ID_SIGNALING {
            let len = if flags & FLAG_LEN16 != 0 {
                r.u16()? as usize
            } else {
                r.u8()? as usize
            };
            let pts = r.u32()?;
            let fragment = if flags & FLAG_FRAGMENTED != 0 {
                let index = r.u8()?;
                let count = r.u8()?;
                if count == 0 || index >= count {
                    return Err(ParseError::BadValue("fragment index"));
                }
                Some(Fragment { index, count })
            } else {
                None
            };
            packet.data = Some(StreamData {
                pts,
                keyframe: flags & FLAG_KEYFRAME != 0,
                fragment,
                payload: r.bytes(len)?.to_vec(),
            });
        }

        if flags & FLAG_RECV_TS != 0 {
            packet.recv_ts = Some(r.u32()?);
        }

        if flags & FLAG_EXTRA_EC != 0 {
            let base_pts = packet
                .data
                .as_ref()
                .map(|d| d.pts)
                .ok_or(ParseError::BadValue("EC without stream data"))?;
            let count = r.u8()?;
            let mut frames = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = r.u8()? as usize;
                frames.push(r.bytes(len)?.to_vec());
            }
            packet.ec = Some(EcFrames { base_pts, frames });
        }

        if flags & FLAG_EXTRA_SIGNALING != 0 {
            let count = r.u8()?;
            for _ in 0..count {
                if let Some(extra) = ExtraRecord::decode(&mut r)? {
                    packet.extras.push(extra);
                }
            }
        }

        Ok(packet)
    }

    fn encode_legacy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.put_u32_le(LEGACY_FRAMING_MAGIC);
        let mut random = [0u8; 7];
        rand::thread_rng().fill_bytes(&mut random);
        put_tl_bytes(&mut out, &random);

        let mut extras: Vec<&ExtraRecord> = self.extras.iter().collect();
        let mut body = Vec::new();
        let packet_type = if let Some(d) = &self.data {
            body.put_u8(self.stream_id);
            let mut dflags = 0;
            if d.keyframe {
                dflags |= LEGACY_DATA_KEYFRAME;
            }
            if d.fragment.is_some() {
                dflags |= LEGACY_DATA_FRAGMENTED;
            }
            body.put_u8(dflags);
            body.put_u32_le(d.pts);
            if let Some(fragment) = d.fragment {
                body.put_u8(fragment.index);
                body.put_u8(fragment.count);
            }
            body.put_slice(&d.payload);
            LEGACY_TYPE_STREAM_DATA
        } else if let Some(ec) = self.ec.as_ref().filter(|ec| !ec.frames.is_empty()) {
            body.put_u8(self.stream_id);
            body.put_u32_le(ec.base_pts);
            let frames = &ec.frames[..ec.frames.len().min(u8::MAX as usize)];
            body.put_u8(frames.len() as u8);
            for frame in frames {
                put_tl_bytes(&mut body, frame);
            }
            LEGACY_TYPE_STREAM_EC
        } else if let Some(pos) = extras.iter().position(|e| {
            matches!(
                e,
                ExtraRecord::Init(_)
                    | ExtraRecord::InitAck(_)
                    | ExtraRecord::Ping(_)
                    | ExtraRecord::Pong(_)
            )
        }) {
            let primary = extras.remove(pos);
            primary.encode_body(&mut body);
            match primary {
                ExtraRecord::Init(_) => LEGACY_TYPE_INIT,
                ExtraRecord::InitAck(_) => LEGACY_TYPE_INIT_ACK,
                ExtraRecord::Ping(_) => LEGACY_TYPE_PING,
                _ => LEGACY_TYPE_PONG,
            }
        } else {
            LEGACY_TYPE_NOP
        };

        out.put_u8(packet_type);
        out.put_u32_le(self.ack_seq);
        out.put_u32_le(self.seq);
        out.put_u32_le(self.ack_mask);

        let mut pflags = 0;
        if !extras.is_empty() {
            pflags |= LEGACY_PFLAG_HAS_EXTRA;
        }
        if packet_type != LEGACY_TYPE_NOP {
            pflags |= LEGACY_PFLAG_HAS_DATA;
        }
        if self.recv_ts.is_some() {
            pflags |= LEGACY_PFLAG_HAS_RECV_TS;
        }
        out.put_u8(pflags);

        if !extras.is_empty() {
            out.put_u8(extras.len() as u8);
            for extra in extras {
                let mut raw = vec![extra.type_id()];
                extra.encode_body(&mut raw);
                put_tl_bytes(&mut out, &raw);
            }
        }
        if packet_type != LEGACY_TYPE_NOP {
            put_tl_bytes(&mut out, &body);
        }
        if let Some(ts) = self.recv_ts {
            out.put_u32_le(ts);
        }
        out
    }

    fn decode_legacy(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = WireReader::new(data);
        if r.u32()? != LEGACY_FRAMING_MAGIC {
            return Err(ParseError::BadValue("legacy magic"));
        }
        r.tl_bytes()?;
        let packet_type = r.u8()?;
        let ack_seq = r.u32()?;
        let seq = r.u32()?;
        let ack_mask = r.u32()?;
        let pflags = r.u8()?;

        let mut packet = Packet {
            seq,
            ack_seq,
            ack_mask,
            ..Default::default()
        };

        if pflags & LEGACY_PFLAG_HAS_EXTRA != 0 {
            let count = r.u8()?;
            for _ in 0..count {
                let raw = r.tl_bytes()?;
                let (&type_id, body) = raw
                    .split_first()
                    .ok_or(ParseError::BadValue("empty legacy extra"))?;
                match ExtraRecord::decode_body(type_id, body) {
                    Ok(extra) => packet.extras.push(extra),
                    Err(ParseError::UnknownType(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let body = if pflags & LEGACY_PFLAG_HAS_DATA != 0 {
            r.tl_bytes()?
        } else {
            &[]
        };
        let mut b = WireReader::new(body);
        match packet_type {
            LEGACY_TYPE_STREAM_DATA => {
                packet.stream_id = b.u8()?;
                let dflags = b.u8()?;
                let pts = b.u32()?;
                let fragment = if dflags & LEGACY_DATA_FRAGMENTED != 0 {
                    let index = b.u8()?;
                    let count = b.u8()?;
                    if count == 0 || index >= count {
                        return Err(ParseError::BadValue("fragment index"));
                    }
                    Some(Fragment { index, count })
                } else {
                    None
                };
                packet.data = Some(StreamData {
                    pts,
                    keyframe: dflags & LEGACY_DATA_KEYFRAME != 0,
                    fragment,
                    payload: b.rest().to_vec(),
                });
            }
            LEGACY_TYPE_STREAM_EC => {
                packet.stream_id = b.u8()?;
                let base_pts = b.u32()?;
                let count = b.u8()?;
                let mut frames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frames.push(b.tl_bytes()?.to_vec());
                }
                packet.ec = Some(EcFrames { base_pts, frames });
            }
            LEGACY_TYPE_INIT | LEGACY_TYPE_INIT_ACK | LEGACY_TYPE_PING | LEGACY_TYPE_PONG => {
                let extra_type = match packet_type {
                    LEGACY_TYPE_INIT => super::extra::EXTRA_TYPE_INIT,
                    LEGACY_TYPE_INIT_ACK => super::extra::EXTRA_TYPE_INIT_ACK,
                    LEGACY_TYPE_PING => super::extra::EXTRA_TYPE_PING,
                    _ => super::extra::EXTRA_TYPE_PONG,
                };
                packet
                    .extras
                    .insert(0, ExtraRecord::decode_body(extra_type, body)?);
            }
            LEGACY_TYPE_NOP => {}
            other => return Err(ParseError::UnknownType(other as u32)),
        }

        if pflags & LEGACY_PFLAG_HAS_RECV_TS != 0 {
            packet.recv_ts = Some(r.u32()?);
        }
        Ok(packet)
    }
}
