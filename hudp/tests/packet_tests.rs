//! Wire codec tests.

use bytes::Bytes;
use hudp::packet::{HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE};
use hudp::{Channel, HudpError, Packet, Seq};

fn reliable(seq: u16, payload: &'static [u8]) -> Packet {
    Packet::Data {
        channel: Channel::Reliable,
        seq: Seq(seq),
        timestamp: 123_456,
        payload: Bytes::from_static(payload),
    }
}

#[test]
fn every_single_bit_flip_is_detected() {
    let encoded = reliable(0xBEEF, b"checksummed payload").encode().unwrap();
    for byte in 0..encoded.len() {
        for bit in 0..8 {
            let mut raw = encoded.to_vec();
            raw[byte] ^= 1 << bit;
            let err = Packet::decode(&raw).unwrap_err();
            assert!(err.is_decode_error(), "byte {byte} bit {bit}: {err}");
        }
    }
}

#[test]
fn truncated_datagram_is_length_mismatch() {
    let encoded = reliable(1, b"abcdef").encode().unwrap();
    let err = Packet::decode(&encoded[..encoded.len() - 2]).unwrap_err();
    assert!(matches!(
        err,
        HudpError::LengthMismatch {
            declared: 6,
            actual: 4
        }
    ));
}

#[test]
fn trailing_garbage_is_length_mismatch() {
    let mut raw = reliable(1, b"abc").encode().unwrap().to_vec();
    raw.push(0);
    assert!(matches!(
        Packet::decode(&raw),
        Err(HudpError::LengthMismatch { .. })
    ));
}

#[test]
fn header_only_datagram_decodes() {
    let pkt = reliable(9, b"");
    let encoded = pkt.encode().unwrap();
    assert_eq!(encoded.len(), HEADER_LEN);
    assert_eq!(Packet::decode(&encoded).unwrap(), pkt);
}

#[test]
fn empty_input_rejected() {
    assert!(matches!(
        Packet::decode(&[]),
        Err(HudpError::PacketTooShort { actual: 0, .. })
    ));
}

#[test]
fn ack_wire_fields() {
    let ack = Packet::Ack {
        ack_seq: Seq(0x0102),
        cumulative: Seq(0x00FF),
        timestamp: 7,
    };
    let encoded = ack.encode().unwrap();
    assert_eq!(encoded.len(), HEADER_LEN);
    assert_eq!(encoded[0], 0b10);
    assert_eq!(&encoded[1..3], &[0x00, 0xFF]);
    assert_eq!(&encoded[3..5], &[0x01, 0x02]);
}

#[test]
fn datagram_size_limit() {
    assert_eq!(MAX_PAYLOAD_SIZE + HEADER_LEN, MAX_DATAGRAM_SIZE);
    let too_big = Packet::Data {
        channel: Channel::Unreliable,
        seq: Seq(0),
        timestamp: 0,
        payload: Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
    };
    let err = too_big.encode().unwrap_err();
    assert!(matches!(err, HudpError::PayloadTooLarge { size, max } if size == max + 1));
}
