//! Datagram layer: one packet per UDP datagram.
//!
//! ```text
//! packet   = kind(1) session(4) body
//! Connect  = mtu(2) mtc(1) window(4) loss(1) mode(1) [public_key(32)] crc32(4)
//! Accept   = same as Connect
//! Confirm / Data / Reset, insecure = frames* crc32(4)
//! Confirm / Data / Reset, secure   = counter(8) ciphertext(frames*) tag(16)
//! ```
//!
//! The CRC covers every byte before it. Sealed packets set the high bit of
//! `kind` and authenticate `kind || session` as associated data instead.
//! Resets carry no frames; a sealed one proves it came from the remote.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use terntrust::crypto::aead::TAG_LEN;
use terntrust::{Key, KEY_LEN};

use crate::error::{Result, TernStreamError};
use crate::frame::{Frame, FRAGMENT_HEADER_LEN, SEGMENT_HEADER_LEN};
use crate::transport::MAX_FRAGMENTS;
use crate::handshake::{ConnectionMode, SecureSession};

/// kind(1) + session(4).
pub const HEADER_LEN: usize = 5;
/// Trailing CRC32 of unsealed packets.
pub const CHECKSUM_LEN: usize = 4;
/// counter(8) + AEAD tag.
pub const SEAL_OVERHEAD: usize = 8 + TAG_LEN;
/// IPv6 and UDP headers, reserved out of every MTU.
pub const IP_UDP_OVERHEAD: usize = 48;

const SECURE_FLAG: u8 = 0x80;
const OFFER_LEN: usize = 2 + 1 + 4 + 1 + 1;

/// Packet kinds, without the secure flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0x01,
    Accept = 0x02,
    Confirm = 0x03,
    Data = 0x04,
    Reset = 0x05,
}

impl TryFrom<u8> for PacketKind {
    type Error = TernStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketKind::Connect),
            0x02 => Ok(PacketKind::Accept),
            0x03 => Ok(PacketKind::Confirm),
            0x04 => Ok(PacketKind::Data),
            0x05 => Ok(PacketKind::Reset),
            other => Err(TernStreamError::UnknownPacketType(other)),
        }
    }
}

/// Connection parameters proposed in Connect and answered in Accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub mtu: u16,
    pub channels: u8,
    /// The sender's downstream window in bytes.
    pub window: u32,
    /// The sender's downstream loss ratio, scaled to `0..=255`.
    pub loss: u8,
    pub mode: ConnectionMode,
    /// Present exactly when `mode` is secure.
    pub public_key: Option<Key>,
}

impl Offer {
    pub fn loss_ratio(&self) -> f32 {
        f32::from(self.loss) / 255.0
    }

    pub fn encode_loss(ratio: f32) -> u8 {
        (ratio.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    fn encoded_len(&self) -> usize {
        OFFER_LEN + if self.mode.is_secure() { KEY_LEN } else { 0 }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.mtu);
        buf.put_u8(self.channels);
        buf.put_u32(self.window);
        buf.put_u8(self.loss);
        buf.put_u8(self.mode as u8);
        if let Some(key) = &self.public_key {
            buf.put_slice(key.as_bytes());
        }
    }

    fn decode(mut body: &[u8]) -> Result<Self> {
        ensure_len(body, OFFER_LEN)?;
        let mtu = body.get_u16();
        let channels = body.get_u8();
        let window = body.get_u32();
        let loss = body.get_u8();
        let mode = ConnectionMode::from_u8(body.get_u8())?;
        let public_key = if mode.is_secure() {
            ensure_len(body, KEY_LEN)?;
            Some(Key::from_slice(&body[..KEY_LEN])?)
        } else {
            None
        };
        Ok(Self {
            mtu,
            channels,
            window,
            loss,
            mode,
            public_key,
        })
    }
}

/// Frames carried by Confirm and Data packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Plain(Vec<Frame>),
    /// Encrypted frames, opened by the connection's [`SecureSession`].
    Sealed { counter: u64, ciphertext: Bytes },
}

impl Body {
    /// Seal `frames` for a packet of `kind` on `session`.
    pub fn seal(
        secure: &mut SecureSession,
        kind: PacketKind,
        session: u32,
        frames: &[Frame],
    ) -> Result<Self> {
        let mut plaintext = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
        for frame in frames {
            frame.encode_into(&mut plaintext);
        }
        let (counter, ciphertext) = secure.seal(&plaintext, &aad(kind, true, session))?;
        Ok(Body::Sealed {
            counter,
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// The frames, authenticating and decrypting a sealed body.
    pub fn open(
        self,
        secure: Option<&mut SecureSession>,
        kind: PacketKind,
        session: u32,
    ) -> Result<Vec<Frame>> {
        match (self, secure) {
            (Body::Plain(frames), _) => Ok(frames),
            (Body::Sealed { counter, ciphertext }, Some(secure)) => {
                let plaintext = secure.open(counter, &ciphertext, &aad(kind, true, session))?;
                Frame::decode_all(&plaintext)
            }
            (Body::Sealed { .. }, None) => Err(TernStreamError::HandshakeFailed(
                "sealed packet before key agreement".into(),
            )),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Body::Sealed { .. })
    }
}

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect { session: u32, offer: Offer },
    Accept { session: u32, offer: Offer },
    /// Carries no frames. Sealed on secure sessions.
    Reset { session: u32, body: Body },
    Confirm { session: u32, body: Body },
    Data { session: u32, body: Body },
}

impl Packet {
    /// An unsealed Reset, the only kind a host can send without a session.
    pub fn reset(session: u32) -> Self {
        Packet::Reset {
            session,
            body: Body::Plain(Vec::new()),
        }
    }

    /// A packet of `kind` carrying `body`. Connect and Accept carry offers
    /// instead, so they map to Data.
    pub fn with_body(kind: PacketKind, session: u32, body: Body) -> Self {
        match kind {
            PacketKind::Confirm => Packet::Confirm { session, body },
            PacketKind::Reset => Packet::Reset { session, body },
            _ => Packet::Data { session, body },
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Connect { .. } => PacketKind::Connect,
            Packet::Accept { .. } => PacketKind::Accept,
            Packet::Reset { .. } => PacketKind::Reset,
            Packet::Confirm { .. } => PacketKind::Confirm,
            Packet::Data { .. } => PacketKind::Data,
        }
    }

    pub fn session(&self) -> u32 {
        match self {
            Packet::Connect { session, .. }
            | Packet::Accept { session, .. }
            | Packet::Reset { session, .. }
            | Packet::Confirm { session, .. }
            | Packet::Data { session, .. } => *session,
        }
    }

    /// The frames body of Confirm, Data and Reset packets.
    pub fn body(&self) -> Option<&Body> {
        match self {
            Packet::Confirm { body, .. } | Packet::Data { body, .. } | Packet::Reset { body, .. } => {
                Some(body)
            }
            Packet::Connect { .. } | Packet::Accept { .. } => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let sealed = self.body().is_some_and(Body::is_sealed);
        let kind = self.kind() as u8 | if sealed { SECURE_FLAG } else { 0 };
        buf.put_u8(kind);
        buf.put_u32(self.session());
        match (self, self.body()) {
            (Packet::Connect { offer, .. } | Packet::Accept { offer, .. }, _) => {
                offer.encode_into(&mut buf);
            }
            (_, Some(Body::Plain(frames))) => {
                for frame in frames {
                    frame.encode_into(&mut buf);
                }
            }
            (_, Some(Body::Sealed { counter, ciphertext })) => {
                buf.put_u64(*counter);
                buf.put_slice(ciphertext);
                return buf.freeze();
            }
            (_, None) => {}
        }
        let checksum = checksum(&buf);
        buf.put_u32(checksum);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match (self, self.body()) {
                (Packet::Connect { offer, .. } | Packet::Accept { offer, .. }, _) => {
                    offer.encoded_len() + CHECKSUM_LEN
                }
                (_, Some(Body::Plain(frames))) => {
                    frames.iter().map(Frame::encoded_len).sum::<usize>() + CHECKSUM_LEN
                }
                (_, Some(Body::Sealed { ciphertext, .. })) => 8 + ciphertext.len(),
                (_, None) => CHECKSUM_LEN,
            }
    }

    /// Parse a datagram. Checksums are verified here; sealed bodies are
    /// left for [`Body::open`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure_len(data, HEADER_LEN)?;
        let raw_kind = data[0];
        let sealed = raw_kind & SECURE_FLAG != 0;
        let kind = PacketKind::try_from(raw_kind & !SECURE_FLAG)?;
        let session = (&data[1..5]).get_u32();

        if sealed {
            if !matches!(kind, PacketKind::Confirm | PacketKind::Data | PacketKind::Reset) {
                return Err(TernStreamError::UnknownPacketType(raw_kind));
            }
            let mut rest = &data[HEADER_LEN..];
            ensure_len(rest, SEAL_OVERHEAD)?;
            let counter = rest.get_u64();
            let body = Body::Sealed {
                counter,
                ciphertext: Bytes::copy_from_slice(rest),
            };
            return Ok(Packet::with_body(kind, session, body));
        }

        ensure_len(data, HEADER_LEN + CHECKSUM_LEN)?;
        let (covered, trailer) = data.split_at(data.len() - CHECKSUM_LEN);
        let expected = (&trailer[..]).get_u32();
        let actual = checksum(covered);
        if expected != actual {
            return Err(TernStreamError::ChecksumMismatch { expected, actual });
        }
        let body = &covered[HEADER_LEN..];

        Ok(match kind {
            PacketKind::Connect => Packet::Connect {
                session,
                offer: Offer::decode(body)?,
            },
            PacketKind::Accept => Packet::Accept {
                session,
                offer: Offer::decode(body)?,
            },
            PacketKind::Confirm | PacketKind::Data | PacketKind::Reset => {
                Packet::with_body(kind, session, Body::Plain(Frame::decode_all(body)?))
            }
        })
    }
}

/// Bytes available for frames in one packet.
pub fn frame_budget(mtu: u16, secure: bool) -> usize {
    let overhead = IP_UDP_OVERHEAD + HEADER_LEN + if secure { SEAL_OVERHEAD } else { CHECKSUM_LEN };
    usize::from(mtu).saturating_sub(overhead)
}

/// Largest payload one segment can carry.
pub fn max_payload(mtu: u16, secure: bool) -> usize {
    frame_budget(mtu, secure).saturating_sub(SEGMENT_HEADER_LEN)
}

/// Largest slice of a message one fragment can carry.
pub fn max_fragment(mtu: u16, secure: bool) -> usize {
    frame_budget(mtu, secure).saturating_sub(FRAGMENT_HEADER_LEN)
}

/// Largest message the reliable lane accepts once fragmented.
pub fn max_message(mtu: u16, secure: bool) -> usize {
    max_fragment(mtu, secure) * MAX_FRAGMENTS
}

fn aad(kind: PacketKind, sealed: bool, session: u32) -> [u8; HEADER_LEN] {
    let mut aad = [0u8; HEADER_LEN];
    aad[0] = kind as u8 | if sealed { SECURE_FLAG } else { 0 };
    aad[1..].copy_from_slice(&session.to_be_bytes());
    aad
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(TernStreamError::FrameTooShort {
            expected: needed,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::KeyExchange;
    use crate::ordinal::Ordinal;
    use crate::transport::{Delivery, Part};
    use terntrust::X25519;

    fn offer(mode: ConnectionMode, public_key: Option<Key>) -> Offer {
        Offer {
            mtu: 1280,
            channels: 3,
            window: 1 << 20,
            loss: Offer::encode_loss(0.1),
            mode,
            public_key,
        }
    }

    #[test]
    fn connect_layout() {
        let packet = Packet::Connect {
            session: 0x0102_0304,
            offer: offer(ConnectionMode::Insecure, None),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(
            &bytes[..14],
            &[0x01, 1, 2, 3, 4, 0x05, 0x00, 3, 0x00, 0x10, 0x00, 0x00, 26, 0x00]
        );
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn secure_offer_carries_key() {
        let key = Key::from_bytes([9u8; KEY_LEN]);
        let packet = Packet::Accept {
            session: 7,
            offer: offer(ConnectionMode::Secure, Some(key)),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_LEN + OFFER_LEN + KEY_LEN + CHECKSUM_LEN);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn corrupted_packet_fails_checksum() {
        let packet = Packet::Data {
            session: 1,
            body: Body::Plain(vec![Frame::Ping, Frame::Close]),
        };
        let mut bytes = packet.encode().to_vec();
        bytes[5] = 0x05;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TernStreamError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let bytes = [0x09, 0, 0, 0, 1, 0, 0, 0, 0];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TernStreamError::UnknownPacketType(0x09))
        ));
        assert!(Packet::decode(&[0x04, 0]).is_err());
    }

    #[test]
    fn plain_reset_is_header_and_checksum() {
        let bytes = Packet::reset(9).encode();
        assert_eq!(bytes.len(), HEADER_LEN + CHECKSUM_LEN);
        assert_eq!(bytes[0], PacketKind::Reset as u8);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::reset(9));
    }

    #[test]
    fn sealed_reset_authenticates() {
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, mut acceptor) = KeyExchange::accept(&X25519, None, &initiator_key, 3).unwrap();
        let mut initiator = exchange.complete(&X25519, &acceptor_key, 3).unwrap();

        let body = Body::seal(&mut initiator, PacketKind::Reset, 3, &[]).unwrap();
        let bytes = Packet::Reset { session: 3, body }.encode();
        assert_eq!(bytes[0], PacketKind::Reset as u8 | SECURE_FLAG);
        assert_eq!(bytes.len(), HEADER_LEN + SEAL_OVERHEAD);

        let Packet::Reset { session, body } = Packet::decode(&bytes).unwrap() else {
            panic!("expected reset");
        };
        assert!(body.is_sealed());
        // A sealed Reset cannot be passed off as Data.
        assert!(body.clone().open(Some(&mut acceptor), PacketKind::Data, session).is_err());
        assert!(body.open(Some(&mut acceptor), PacketKind::Reset, session).unwrap().is_empty());
    }

    #[test]
    fn sealed_data_opens_with_peer_session() {
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, mut acceptor) = KeyExchange::accept(&X25519, None, &initiator_key, 5).unwrap();
        let mut initiator = exchange.complete(&X25519, &acceptor_key, 5).unwrap();

        let frames = vec![Frame::Segment {
            channel: 0,
            delivery: Delivery::Reliable,
            ordinal: Ordinal::new(1),
            base: Ordinal::new(0),
            part: Part::Whole,
            payload: Bytes::from_static(b"secret"),
        }];
        let body = Body::seal(&mut initiator, PacketKind::Data, 5, &frames).unwrap();
        let bytes = Packet::Data { session: 5, body }.encode();
        assert_eq!(bytes[0], PacketKind::Data as u8 | SECURE_FLAG);
        assert!(!bytes.windows(6).any(|w| w == b"secret"));

        let Packet::Data { session, body } = Packet::decode(&bytes).unwrap() else {
            panic!("expected data packet");
        };
        assert_eq!(
            body.clone().open(Some(&mut acceptor), PacketKind::Data, session).unwrap(),
            frames
        );
        // Already seen.
        assert!(matches!(
            body.clone().open(Some(&mut acceptor), PacketKind::Data, session),
            Err(TernStreamError::Replayed(0))
        ));

        // Authenticated as Data, so it cannot pass as a Confirm.
        let body = Body::seal(&mut initiator, PacketKind::Data, 5, &frames).unwrap();
        assert!(body.open(Some(&mut acceptor), PacketKind::Confirm, session).is_err());
    }

    #[test]
    fn payload_limits() {
        assert_eq!(max_payload(1280, false), 1280 - 48 - 5 - 4 - 9);
        assert_eq!(max_payload(1280, true), 1280 - 48 - 5 - 24 - 9);
        assert_eq!(max_fragment(1280, false), max_payload(1280, false) - 2);
        assert_eq!(max_message(1280, false), (1280 - 48 - 5 - 4 - 11) * 256);
    }
}
