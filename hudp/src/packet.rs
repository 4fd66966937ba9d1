//! Wire packet codec.
//!
//! Every datagram is one [`Packet`]: a fixed 13-byte header followed by the
//! payload. All multi-byte fields are big-endian.
//!
//! ```text
//! +-------+----------+----------+-----------+-------------+----------+---------+
//! | flags | sequence | ack_seq  | timestamp | payload_len | checksum | payload |
//! | (1B)  |   (2B)   |   (2B)   |   (4B)    |    (2B)     |   (2B)   |  (N)    |
//! +-------+----------+----------+-----------+-------------+----------+---------+
//! ```
//!
//! `flags` bit0 selects the unreliable channel, bit1 marks an ACK. Only
//! reliable data, unreliable data and reliable ACK are valid combinations.
//! On ACK packets `sequence` carries the receiver's cumulative position and
//! `ack_seq` the selectively acknowledged sequence.
//!
//! The checksum is the RFC 1071 Internet checksum over the header (with the
//! checksum field zeroed) and the payload.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HudpError, Result};
use crate::seq::Seq;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest datagram the codec will produce: one Ethernet-MTU UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Largest payload that fits in a single datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

const FLAG_UNRELIABLE: u8 = 0b0000_0001;
const FLAG_ACK: u8 = 0b0000_0010;

const OFF_CHECKSUM: usize = 11;

/// Logical channel a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Reliable => "reliable",
            Channel::Unreliable => "unreliable",
        }
    }
}

/// A decoded H-UDP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Application data on either channel.
    Data {
        channel: Channel,
        seq: Seq,
        /// Sender wall clock in milliseconds (wrapping), see [`wall_clock_ms`].
        timestamp: u32,
        payload: Bytes,
    },
    /// Acknowledgement of one reliable data packet.
    Ack {
        ack_seq: Seq,
        /// Last sequence the receiver has delivered or skipped in order.
        cumulative: Seq,
        /// Echo of the acknowledged data packet's timestamp.
        timestamp: u32,
    },
}

impl Packet {
    pub fn channel(&self) -> Channel {
        match self {
            Packet::Data { channel, .. } => *channel,
            Packet::Ack { .. } => Channel::Reliable,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Packet::Data {
                channel: Channel::Reliable,
                ..
            } => 0,
            Packet::Data {
                channel: Channel::Unreliable,
                ..
            } => FLAG_UNRELIABLE,
            Packet::Ack { .. } => FLAG_ACK,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Packet::Data { payload, .. } => payload,
            Packet::Ack { .. } => &[],
        }
    }

    /// The total number of bytes this packet occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload().len()
    }

    /// Encode this packet into a datagram.
    ///
    /// Fails with [`HudpError::PayloadTooLarge`] if the datagram would exceed
    /// [`MAX_DATAGRAM_SIZE`].
    pub fn encode(&self) -> Result<Bytes> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HudpError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let (sequence, ack_seq, timestamp) = match self {
            Packet::Data { seq, timestamp, .. } => (*seq, Seq::ZERO, *timestamp),
            Packet::Ack {
                ack_seq,
                cumulative,
                timestamp,
            } => (*cumulative, *ack_seq, *timestamp),
        };

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.flags());
        buf.put_u16(sequence.value());
        buf.put_u16(ack_seq.value());
        buf.put_u32(timestamp);
        buf.put_u16(payload.len() as u16);
        buf.put_u16(0);
        buf.put_slice(payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Decode a datagram. Never mutates anything; a failure means the
    /// datagram should be dropped.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(HudpError::PacketTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut header = &data[..HEADER_LEN];
        let flags = header.get_u8();
        let sequence = Seq(header.get_u16());
        let ack_seq = Seq(header.get_u16());
        let timestamp = header.get_u32();
        let payload_len = header.get_u16() as usize;
        let checksum = header.get_u16();

        let body = &data[HEADER_LEN..];
        if body.len() != payload_len {
            return Err(HudpError::LengthMismatch {
                declared: payload_len,
                actual: body.len(),
            });
        }

        let computed = checksum_with_zeroed_field(data);
        if computed != checksum {
            return Err(HudpError::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }

        match flags {
            0 => Ok(Packet::Data {
                channel: Channel::Reliable,
                seq: sequence,
                timestamp,
                payload: Bytes::copy_from_slice(body),
            }),
            FLAG_UNRELIABLE => Ok(Packet::Data {
                channel: Channel::Unreliable,
                seq: sequence,
                timestamp,
                payload: Bytes::copy_from_slice(body),
            }),
            FLAG_ACK => {
                if payload_len != 0 {
                    return Err(HudpError::LengthMismatch {
                        declared: payload_len,
                        actual: 0,
                    });
                }
                Ok(Packet::Ack {
                    ack_seq,
                    cumulative: sequence,
                    timestamp,
                })
            }
            other => Err(HudpError::InvalidFlags(other)),
        }
    }
}

/// Milliseconds since the Unix epoch, truncated to 32 bits.
pub fn wall_clock_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Checksum of `data` as if its checksum field were zero. The field sits at
/// an odd offset, so it is masked byte-wise rather than skipped.
fn checksum_with_zeroed_field(data: &[u8]) -> u16 {
    let field = OFF_CHECKSUM..OFF_CHECKSUM + 2;
    let byte = |i: usize| if field.contains(&i) { 0 } else { data[i] };
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < data.len() {
        sum = sum.wrapping_add(((byte(i) as u32) << 8) | byte(i + 1) as u32);
        i += 2;
    }
    if i < data.len() {
        sum = sum.wrapping_add((byte(i) as u32) << 8);
    }
    fold(sum)
}

/// RFC 1071 Internet checksum. The caller zeroes the checksum field.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    fold(sum)
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
