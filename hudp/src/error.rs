use thiserror::Error;

/// All errors produced by the H-UDP transport.
#[derive(Debug, Error)]
pub enum HudpError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("payload length mismatch: header says {declared} bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: header 0x{expected:04x}, computed 0x{actual:04x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("invalid channel/flag bits: 0x{0:02x}")]
    InvalidFlags(u8),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("send window full: {outstanding} packets awaiting acknowledgement")]
    SendWindowFull { outstanding: usize },

    #[error("delivery of reliable packet {seq} failed after {attempts} retransmissions")]
    DeliveryFailed { seq: u16, attempts: u32 },

    #[error("peer address unknown: no peer configured and no datagram received yet")]
    PeerUnknown,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HudpError {
    /// Whether this error came out of the packet decoder. Such datagrams are
    /// dropped and counted, never surfaced to the application.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            HudpError::PacketTooShort { .. }
                | HudpError::LengthMismatch { .. }
                | HudpError::ChecksumMismatch { .. }
                | HudpError::InvalidFlags(_)
        )
    }

    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HudpError::Io(_) | HudpError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, HudpError>;
