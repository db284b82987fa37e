//! Obfuscated TCP framing for relay links
//!
//! A link opens with a 64-byte random header. Bytes 8..56 seed two
//! AES-256-CTR streams: the header as sent keys the client->relay direction,
//! the same 48 bytes reversed key relay->client. Bytes 56..60 carry the
//! framing tag, and the last 8 header bytes go out already encrypted so the
//! relay can check the tag after decrypting.
//!
//! Frames use the abridged length prefix: `len / 4` as one byte when below
//! 0x7F, else 0x7F followed by `len / 4` as 3 little-endian bytes. Frame
//! lengths are multiples of 4.

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::NetworkError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const HEADER_LEN: usize = 64;

/// Abridged framing tag at header bytes 56..60
pub const ABRIDGED_TAG: [u8; 4] = [0xEF; 4];

/// Largest frame the 3-byte length can express
pub const MAX_FRAME_LEN: usize = 0xFF_FFFF * 4;

/// First words a header must not start with, so the link does not look like
/// HTTP or another transport mode
const FORBIDDEN_FIRST_WORDS: [[u8; 4]; 6] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0xEE; 4],
    [0xDD; 4],
];

/// Encrypting half of an obfuscated link
pub struct FrameSealer {
    cipher: Aes256Ctr,
}

/// Decrypting half of an obfuscated link
pub struct FrameOpener {
    cipher: Aes256Ctr,
}

fn ctr(key: &[u8], iv: &[u8]) -> Result<Aes256Ctr, NetworkError> {
    Aes256Ctr::new_from_slices(key, iv)
        .map_err(|_| NetworkError::TcpHandshake("bad key material".into()))
}

fn reversed_key_material(header: &[u8; HEADER_LEN]) -> [u8; 48] {
    let mut rev = [0u8; 48];
    rev.copy_from_slice(&header[8..56]);
    rev.reverse();
    rev
}

fn random_header(rng: &mut impl RngCore) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    loop {
        rng.fill_bytes(&mut header);
        let first: [u8; 4] = [header[0], header[1], header[2], header[3]];
        if header[0] == 0xEF
            || FORBIDDEN_FIRST_WORDS.contains(&first)
            || header[4..8] == [0, 0, 0, 0]
        {
            continue;
        }
        return header;
    }
}

/// Build the header a client sends first, and the link ciphers
pub fn client_handshake(
    rng: &mut impl RngCore,
) -> Result<([u8; HEADER_LEN], FrameSealer, FrameOpener), NetworkError> {
    let mut header = random_header(rng);
    header[56..60].copy_from_slice(&ABRIDGED_TAG);

    let mut encrypt = ctr(&header[8..40], &header[40..56])?;
    let rev = reversed_key_material(&header);
    let decrypt = ctr(&rev[..32], &rev[32..])?;

    let mut encrypted = header;
    encrypt.apply_keystream(&mut encrypted);
    header[56..].copy_from_slice(&encrypted[56..]);

    Ok((
        header,
        FrameSealer { cipher: encrypt },
        FrameOpener { cipher: decrypt },
    ))
}

/// Accept a client header (relay side)
pub fn server_handshake(
    header: &[u8; HEADER_LEN],
) -> Result<(FrameSealer, FrameOpener), NetworkError> {
    let mut decrypt = ctr(&header[8..40], &header[40..56])?;
    let rev = reversed_key_material(header);
    let encrypt = ctr(&rev[..32], &rev[32..])?;

    let mut plain = *header;
    decrypt.apply_keystream(&mut plain);
    if plain[56..60] != ABRIDGED_TAG {
        return Err(NetworkError::TcpHandshake("unsupported framing tag".into()));
    }
    Ok((
        FrameSealer { cipher: encrypt },
        FrameOpener { cipher: decrypt },
    ))
}

impl FrameSealer {
    /// Length-prefix, pad to 4 bytes and encrypt one frame
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let padded_len = payload.len().div_ceil(4) * 4;
        if padded_len > MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(payload.len()));
        }
        let words = padded_len / 4;
        let mut out = Vec::with_capacity(padded_len + 4);
        if words < 0x7F {
            out.push(words as u8);
        } else {
            out.push(0x7F);
            out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
        }
        out.extend_from_slice(payload);
        out.resize(out.len() + padded_len - payload.len(), 0);
        self.cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

impl FrameOpener {
    /// Read and decrypt the next frame
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Vec<u8>, NetworkError> {
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await?;
        self.cipher.apply_keystream(&mut first);
        let words = if first[0] >= 0x7F {
            let mut ext = [0u8; 3];
            reader.read_exact(&mut ext).await?;
            self.cipher.apply_keystream(&mut ext);
            u32::from_le_bytes([ext[0], ext[1], ext[2], 0]) as usize
        } else {
            first[0] as usize
        };
        let mut frame = vec![0u8; words * 4];
        reader.read_exact(&mut frame).await?;
        self.cipher.apply_keystream(&mut frame);
        Ok(frame)
    }

    /// Decrypt bytes received outside `read_frame`
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_header_shape() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let (header, _, _) = client_handshake(&mut rng).unwrap();
            assert_ne!(header[0], 0xEF);
            assert_ne!(&header[..4], b"POST");
            assert_ne!(header[4..8], [0, 0, 0, 0]);
            // The tag is never visible on the wire
            let (_, _) = server_handshake(&header).unwrap();
        }
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut header, _, _) = client_handshake(&mut rand::thread_rng()).unwrap();
        header[57] ^= 0x01;
        assert!(server_handshake(&header).is_err());
    }

    #[tokio::test]
    async fn test_frames_both_directions() {
        let (mut client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let (header, mut client_seal, mut client_open) =
            client_handshake(&mut rand::thread_rng()).unwrap();
        client_io.write_all(&header).await.unwrap();

        let mut received = [0u8; HEADER_LEN];
        server_io.read_exact(&mut received).await.unwrap();
        let (mut server_seal, mut server_open) = server_handshake(&received).unwrap();

        let small = vec![7u8; 40];
        let large = vec![9u8; 2000];
        for frame in [&small, &large] {
            let sealed = client_seal.seal(frame).unwrap();
            client_io.write_all(&sealed).await.unwrap();
        }
        assert_eq!(server_open.read_frame(&mut server_io).await.unwrap(), small);
        assert_eq!(server_open.read_frame(&mut server_io).await.unwrap(), large);

        let reply = server_seal.seal(&[1, 2, 3, 4, 5]).unwrap();
        server_io.write_all(&reply).await.unwrap();
        // Padded to a 4-byte multiple
        assert_eq!(
            client_open.read_frame(&mut client_io).await.unwrap(),
            vec![1, 2, 3, 4, 5, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (header, mut seal, _) = client_handshake(&mut rand::thread_rng()).unwrap();
        let (_, mut open) = server_handshake(&header).unwrap();
        let sealed = seal.seal(&[3u8; 600]).unwrap();

        let mut reader = tokio_test::io::Builder::new()
            .read(&sealed[..5])
            .read(&sealed[5..])
            .build();
        let frame = tokio_test::assert_ok!(open.read_frame(&mut reader).await);
        assert_eq!(frame, vec![3u8; 600]);
    }

    #[test]
    fn test_length_prefix_switches_at_0x7f_words() {
        let (_, mut seal, _) = client_handshake(&mut rand::thread_rng()).unwrap();
        assert_eq!(seal.seal(&[0u8; 0x7E * 4]).unwrap().len(), 1 + 0x7E * 4);
        assert_eq!(seal.seal(&[0u8; 0x7F * 4]).unwrap().len(), 4 + 0x7F * 4);
    }
}
