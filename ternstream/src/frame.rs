use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TernStreamError};
use crate::ordinal::Ordinal;
use crate::transport::{Delivery, Part};

/// Encoded size of a SEGMENT frame without its payload.
pub const SEGMENT_HEADER_LEN: usize = 9;
/// Encoded size of a FRAGMENT frame without its payload.
pub const FRAGMENT_HEADER_LEN: usize = SEGMENT_HEADER_LEN + 2;
/// Encoded size of an ACK frame.
pub const ACK_LEN: usize = 9;

/// Frame type identifiers carried inside DATA and CONFIRM packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Segment = 0x01,
    Ack = 0x02,
    Ping = 0x03,
    Close = 0x04,
    CloseAck = 0x05,
    Fragment = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = TernStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Segment),
            0x02 => Ok(FrameType::Ack),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Close),
            0x05 => Ok(FrameType::CloseAck),
            0x06 => Ok(FrameType::Fragment),
            other => Err(TernStreamError::UnknownFrameType(other)),
        }
    }
}

/// TernStream wire frame. Several frames share one datagram.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +-------+----------+--- variable ---+
/// | type  |  ... fields per type ...  |
/// | (1B)  |                            |
/// +-------+----------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// SEGMENT:  channel(1) + delivery(1) + ordinal(2) + base(2) + len(2) + payload(N)
    /// FRAGMENT: channel(1) + delivery(1) + ordinal(2) + base(2) + index(1) + last(1) + len(2) + payload(N)
    ///
    /// `base` is the sender's oldest retained ordinal on the lane; receivers
    /// of semireliable data skip their cursor forward to it. Fragments of
    /// one message take consecutive ordinals and are reliable only.
    Segment {
        channel: u8,
        delivery: Delivery,
        ordinal: Ordinal,
        base: Ordinal,
        part: Part,
        payload: Bytes,
    },
    /// ACK: channel(1) + delivery(1) + next(2) + bits(4)
    ///
    /// Everything before `next` is consumed; bit `i` of `bits` acknowledges
    /// ordinal `next + 1 + i`.
    Ack {
        channel: u8,
        delivery: Delivery,
        next: Ordinal,
        bits: u32,
    },
    /// PING: keep-alive, no body.
    Ping,
    /// CLOSE: the sender is disconnecting.
    Close,
    /// CLOSE_ACK: acknowledges a CLOSE.
    CloseAck,
}

impl Frame {
    /// Return the frame type discriminant.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Segment {
                part: Part::Whole, ..
            } => FrameType::Segment,
            Frame::Segment { .. } => FrameType::Fragment,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Ping => FrameType::Ping,
            Frame::Close => FrameType::Close,
            Frame::CloseAck => FrameType::CloseAck,
        }
    }

    /// Encode this frame into a byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated buffer.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_type() as u8);
        match self {
            Frame::Segment {
                channel,
                delivery,
                ordinal,
                base,
                part,
                payload,
            } => {
                buf.put_u8(*channel);
                buf.put_u8(*delivery as u8);
                buf.put_u16(ordinal.value());
                buf.put_u16(base.value());
                if let Part::Fragment { index, last } = part {
                    buf.put_u8(*index);
                    buf.put_u8(*last);
                }
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Frame::Ack {
                channel,
                delivery,
                next,
                bits,
            } => {
                buf.put_u8(*channel);
                buf.put_u8(*delivery as u8);
                buf.put_u16(next.value());
                buf.put_u32(*bits);
            }
            Frame::Ping | Frame::Close | Frame::CloseAck => {}
        }
    }

    /// The total number of bytes this frame will occupy when encoded.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Segment {
                part: Part::Whole,
                payload,
                ..
            } => SEGMENT_HEADER_LEN + payload.len(),
            Frame::Segment { payload, .. } => FRAGMENT_HEADER_LEN + payload.len(),
            Frame::Ack { .. } => ACK_LEN,
            Frame::Ping | Frame::Close | Frame::CloseAck => 1,
        }
    }

    /// Decode one frame from the front of `data`, returning it with the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(TernStreamError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        }

        let frame_type = FrameType::try_from(data[0])?;
        let body = &data[1..];

        match frame_type {
            FrameType::Segment | FrameType::Fragment => {
                let header = if frame_type == FrameType::Segment {
                    SEGMENT_HEADER_LEN
                } else {
                    FRAGMENT_HEADER_LEN
                };
                Self::ensure_len(body, header - 1)?;
                let channel = body[0];
                let delivery = Delivery::from_u8(body[1])?;
                let ordinal = Ordinal::new((&body[2..4]).get_u16());
                let base = Ordinal::new((&body[4..6]).get_u16());
                let mut fields = &body[6..header - 1];
                let part = match frame_type {
                    FrameType::Fragment => {
                        let (index, last) = (fields.get_u8(), fields.get_u8());
                        if index > last || delivery != Delivery::Reliable {
                            return Err(TernStreamError::InvalidFragment { index, last });
                        }
                        Part::Fragment { index, last }
                    }
                    _ => Part::Whole,
                };
                let len = fields.get_u16() as usize;
                let rest = &body[header - 1..];
                Self::ensure_len(rest, len)?;
                let payload = Bytes::copy_from_slice(&rest[..len]);
                Ok((
                    Frame::Segment {
                        channel,
                        delivery,
                        ordinal,
                        base,
                        part,
                        payload,
                    },
                    header + len,
                ))
            }
            FrameType::Ack => {
                Self::ensure_len(body, ACK_LEN - 1)?; // 1+1+2+4
                let channel = body[0];
                let delivery = Delivery::from_u8(body[1])?;
                let next = Ordinal::new((&body[2..4]).get_u16());
                let bits = (&body[4..8]).get_u32();
                Ok((
                    Frame::Ack {
                        channel,
                        delivery,
                        next,
                        bits,
                    },
                    ACK_LEN,
                ))
            }
            FrameType::Ping => Ok((Frame::Ping, 1)),
            FrameType::Close => Ok((Frame::Close, 1)),
            FrameType::CloseAck => Ok((Frame::CloseAck, 1)),
        }
    }

    /// Decode a run of frames filling `data` exactly.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let (frame, used) = Self::decode(data)?;
            frames.push(frame);
            data = &data[used..];
        }
        Ok(frames)
    }

    fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
        if data.len() < needed {
            Err(TernStreamError::FrameTooShort {
                expected: needed,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }
}
