//! Checked byte reading and TL-style helpers shared by every codec
//!
//! All integers on the wire are little-endian. Reads never panic: running
//! out of input yields [`ParseError::Truncated`], so a malformed datagram
//! fails at the parse boundary and is treated as a dropped packet.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Errors raised while parsing wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Truncated input")]
    Truncated,

    #[error("Invalid value: {0}")]
    BadValue(&'static str),

    #[error("Unknown type: {0:#x}")]
    UnknownType(u32),
}

/// Bounds-checked reader over a byte slice
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize) -> Result<(), ParseError> {
        if self.buf.remaining() < n {
            Err(ParseError::Truncated)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, ParseError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ParseError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, ParseError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32, ParseError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn i64(&mut self) -> Result<i64, ParseError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// Borrow the next `n` bytes
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Everything that has not been consumed yet
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// TL `bytes`: 1-byte length (< 254) or `0xFE` + 3-byte length, padded to 4
    pub fn tl_bytes(&mut self) -> Result<&'a [u8], ParseError> {
        let first = self.u8()?;
        let (len, header) = if first < 254 {
            (first as usize, 1)
        } else if first == 254 {
            let b = self.array::<3>()?;
            (
                b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16,
                4,
            )
        } else {
            return Err(ParseError::BadValue("tl length prefix"));
        };
        let data = self.bytes(len)?;
        let padding = (4 - (header + len) % 4) % 4;
        self.bytes(padding)?;
        Ok(data)
    }
}

/// Append TL `bytes` (see [`WireReader::tl_bytes`])
pub fn put_tl_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let header = if data.len() < 254 {
        out.put_u8(data.len() as u8);
        1
    } else {
        out.put_u8(254);
        let len = data.len() as u32;
        out.put_slice(&len.to_le_bytes()[..3]);
        4
    };
    out.put_slice(data);
    let padding = (4 - (header + data.len()) % 4) % 4;
    out.put_bytes(0, padding);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_truncation() {
        let data = [1u8, 2, 3];
        let mut reader = WireReader::new(&data);
        assert_eq!(reader.u16(), Ok(0x0201));
        assert_eq!(reader.u32(), Err(ParseError::Truncated));
        // A failed read consumes nothing
        assert_eq!(reader.u8(), Ok(3));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_tl_bytes_short_and_long() {
        let short = vec![7u8; 5];
        let long = vec![9u8; 300];

        let mut out = Vec::new();
        put_tl_bytes(&mut out, &short);
        assert_eq!(out.len() % 4, 0);
        put_tl_bytes(&mut out, &long);
        assert_eq!(out.len() % 4, 0);

        let mut reader = WireReader::new(&out);
        assert_eq!(reader.tl_bytes().unwrap(), short.as_slice());
        assert_eq!(reader.tl_bytes().unwrap(), long.as_slice());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_tl_bytes_rejects_bad_prefix() {
        let data = [255u8, 0, 0, 0];
        assert!(WireReader::new(&data).tl_bytes().is_err());
    }
}
