//! Packet framing codecs over a raw byte stream.
//!
//! Three framings are supported:
//!
//! * [`Codec::Abridged`] — init tag `0xef`; each packet is a 1-or-4-byte
//!   word count followed by the payload.
//! * [`Codec::Intermediate`] — init tag `0xeeeeeeee`; each packet is a
//!   4-byte LE byte length followed by the payload.
//! * [`Codec::Full`] — no init tag; length + running sequence number +
//!   payload + CRC-32.
//!
//! An optional obfuscation keystream is applied around whichever codec is
//! active; the codec itself never sees plaintext-vs-obfuscated bytes differ.

use ferrite_crypto::ObfuscationCipher;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::InvocationError;

/// Which transport framing (and obfuscation) a connection uses.
#[derive(Clone, Debug, Default)]
pub enum TransportKind {
    /// Abridged framing: smallest overhead.
    #[default]
    Abridged,
    /// Intermediate framing: plain 4-byte lengths.
    Intermediate,
    /// Full framing: lengths, sequence numbers and CRC-32 checksums.
    Full,
    /// Abridged framing under an AES-CTR obfuscation layer.
    ///
    /// `secret` is an optional 16-byte key mixed into the keystream
    /// derivation (for obfuscation-aware proxies).
    Obfuscated {
        /// Optional proxy secret.
        secret: Option<[u8; 16]>,
    },
}

/// A packet framing codec.
///
/// Cloning yields an independent copy; the send and receive pumps each own
/// one so their running state (sequence numbers) advances separately.
#[derive(Clone, Debug)]
pub enum Codec {
    /// Word-count framing.
    Abridged,
    /// Byte-length framing.
    Intermediate,
    /// Byte-length framing with sequence numbers and checksums.
    Full {
        /// Running packet counter for this direction.
        seqno: u32,
    },
}

// An implausible word count: anything over 1 MiB of payload.
const MAX_ABRIDGED_WORDS: usize = 0x40000;
// An implausible intermediate/full length.
const MAX_PACKET_BYTES: usize = 0x400000;

impl Codec {
    /// The codec matching a transport kind (obfuscated links frame with
    /// abridged under the keystream).
    pub fn for_kind(kind: &TransportKind) -> Self {
        match kind {
            TransportKind::Abridged | TransportKind::Obfuscated { .. } => Self::Abridged,
            TransportKind::Intermediate => Self::Intermediate,
            TransportKind::Full => Self::Full { seqno: 0 },
        }
    }

    /// The init tag written once at connect time, if this codec has one.
    pub fn tag(&self) -> Option<Vec<u8>> {
        match self {
            Self::Abridged => Some(vec![0xef]),
            Self::Intermediate => Some(vec![0xee, 0xee, 0xee, 0xee]),
            Self::Full { .. } => None,
        }
    }

    /// The 4-byte protocol tag embedded in an obfuscation handshake header.
    pub fn obfuscated_tag(&self) -> [u8; 4] {
        match self {
            Self::Abridged => [0xef; 4],
            Self::Intermediate => [0xee; 4],
            // Full framing is never used under obfuscation; the tag slot
            // still needs a value for completeness.
            Self::Full { .. } => [0xdd; 4],
        }
    }

    /// Frame `payload` and write it out, applying `cipher` when present.
    pub async fn write_packet<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        cipher: &mut Option<ObfuscationCipher>,
        payload: &[u8],
    ) -> Result<(), InvocationError> {
        let mut packet = match self {
            Self::Abridged => {
                let words = payload.len() / 4;
                let mut buf = Vec::with_capacity(4 + payload.len());
                if words < 0x7f {
                    buf.push(words as u8);
                } else {
                    buf.extend_from_slice(&[
                        0x7f,
                        (words & 0xff) as u8,
                        ((words >> 8) & 0xff) as u8,
                        ((words >> 16) & 0xff) as u8,
                    ]);
                }
                buf.extend_from_slice(payload);
                buf
            }
            Self::Intermediate => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Self::Full { seqno } => {
                let total = (payload.len() + 12) as u32;
                let seq = *seqno;
                *seqno = seqno.wrapping_add(1);

                let mut buf = Vec::with_capacity(total as usize);
                buf.extend_from_slice(&total.to_le_bytes());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(payload);
                let crc = crc32_ieee(&buf);
                buf.extend_from_slice(&crc.to_le_bytes());
                buf
            }
        };

        if let Some(cipher) = cipher {
            cipher.apply(&mut packet);
        }
        writer.write_all(&packet).await?;
        Ok(())
    }

    /// Read the next framed packet, applying `cipher` when present.
    pub async fn read_packet<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        cipher: &mut Option<ObfuscationCipher>,
    ) -> Result<Vec<u8>, InvocationError> {
        match self {
            Self::Abridged => {
                let mut head = [0u8; 1];
                read_deciphered(reader, cipher, &mut head).await?;
                let words = if head[0] < 0x7f {
                    head[0] as usize
                } else {
                    let mut ext = [0u8; 3];
                    read_deciphered(reader, cipher, &mut ext).await?;
                    let w = ext[0] as usize | (ext[1] as usize) << 8 | (ext[2] as usize) << 16;
                    if w == 1 {
                        // A one-word extended packet is the transport's way
                        // of sending a bare status code.
                        let mut code = [0u8; 4];
                        read_deciphered(reader, cipher, &mut code).await?;
                        return Err(InvocationError::Transport {
                            code: i32::from_le_bytes(code),
                        });
                    }
                    w
                };
                if words == 0 || words > MAX_ABRIDGED_WORDS {
                    return Err(InvocationError::Frame(format!(
                        "implausible abridged word count {words}"
                    )));
                }
                let mut payload = vec![0u8; words * 4];
                read_deciphered(reader, cipher, &mut payload).await?;
                Ok(payload)
            }
            Self::Intermediate => {
                let mut len_buf = [0u8; 4];
                read_deciphered(reader, cipher, &mut len_buf).await?;
                let len = u32::from_le_bytes(len_buf) as usize;
                if len == 4 {
                    let mut code = [0u8; 4];
                    read_deciphered(reader, cipher, &mut code).await?;
                    let code = i32::from_le_bytes(code);
                    if code < 0 {
                        return Err(InvocationError::Transport { code });
                    }
                    return Ok(code.to_le_bytes().to_vec());
                }
                if len == 0 || len > MAX_PACKET_BYTES {
                    return Err(InvocationError::Frame(format!(
                        "implausible packet length {len}"
                    )));
                }
                let mut payload = vec![0u8; len];
                read_deciphered(reader, cipher, &mut payload).await?;
                Ok(payload)
            }
            Self::Full { seqno } => {
                let mut len_buf = [0u8; 4];
                read_deciphered(reader, cipher, &mut len_buf).await?;
                let total = u32::from_le_bytes(len_buf) as usize;
                if total < 12 || total > MAX_PACKET_BYTES {
                    return Err(InvocationError::Frame(format!(
                        "implausible full-frame length {total}"
                    )));
                }
                let mut rest = vec![0u8; total - 4];
                read_deciphered(reader, cipher, &mut rest).await?;

                let (body, crc_bytes) = rest.split_at(rest.len() - 4);
                let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
                let mut checked = len_buf.to_vec();
                checked.extend_from_slice(body);
                let actual = crc32_ieee(&checked);
                if actual != expected {
                    return Err(InvocationError::Frame(format!(
                        "CRC mismatch (got {actual:#010x}, expected {expected:#010x})"
                    )));
                }

                *seqno = seqno.wrapping_add(1);
                Ok(body[4..].to_vec())
            }
        }
    }
}

async fn read_deciphered<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut Option<ObfuscationCipher>,
    buf: &mut [u8],
) -> Result<(), InvocationError> {
    reader.read_exact(buf).await?;
    if let Some(cipher) = cipher {
        cipher.apply(buf);
    }
    Ok(())
}

// ─── CRC-32 (IEEE 802.3 polynomial) ──────────────────────────────────────────

fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xedb88320;
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        let mut b = byte as u32;
        for _ in 0..8 {
            let mix = (crc ^ b) & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= POLY;
            }
            b >>= 1;
        }
    }
    crc ^ 0xffffffff
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(codec: &mut Codec, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut send_side = codec.clone();
        send_side.write_packet(&mut wire, &mut None, payload).await.unwrap();
        codec.read_packet(&mut wire.as_slice(), &mut None).await.unwrap()
    }

    #[tokio::test]
    async fn abridged_round_trip_small_and_large() {
        let mut codec = Codec::Abridged;
        let small = vec![1u8; 64];
        assert_eq!(round_trip(&mut codec, &small).await, small);

        // 0x7f * 4 bytes and above takes the extended length form.
        let large = vec![2u8; 0x7f * 4 + 400];
        assert_eq!(round_trip(&mut codec, &large).await, large);
    }

    #[tokio::test]
    async fn intermediate_round_trip() {
        let mut codec = Codec::Intermediate;
        let payload = vec![9u8; 1000];
        assert_eq!(round_trip(&mut codec, &payload).await, payload);
    }

    #[tokio::test]
    async fn full_round_trip_and_crc_guard() {
        let mut codec = Codec::Full { seqno: 0 };
        let payload = vec![7u8; 256];

        let mut wire = Vec::new();
        Codec::Full { seqno: 0 }
            .write_packet(&mut wire, &mut None, &payload)
            .await
            .unwrap();
        assert_eq!(
            codec.read_packet(&mut wire.as_slice(), &mut None).await.unwrap(),
            payload
        );

        // Flip a payload bit: the checksum must catch it.
        wire[10] ^= 0x40;
        let mut codec = Codec::Full { seqno: 0 };
        assert!(matches!(
            codec.read_packet(&mut wire.as_slice(), &mut None).await,
            Err(InvocationError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn abridged_surfaces_transport_status() {
        // Extended form with word count 1 carries a status code.
        let mut wire = vec![0x7f, 0x01, 0x00, 0x00];
        wire.extend_from_slice(&(-404i32).to_le_bytes());
        let mut codec = Codec::Abridged;
        match codec.read_packet(&mut wire.as_slice(), &mut None).await {
            Err(InvocationError::Transport { code }) => assert_eq!(code, -404),
            other => panic!("expected transport status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn intermediate_surfaces_negative_status() {
        let mut wire = 4u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&(-429i32).to_le_bytes());
        let mut codec = Codec::Intermediate;
        match codec.read_packet(&mut wire.as_slice(), &mut None).await {
            Err(InvocationError::Transport { code }) => assert_eq!(code, -429),
            other => panic!("expected transport status, got {other:?}"),
        }
    }
}
