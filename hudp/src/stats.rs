//! Per-connection counters.

use std::time::Duration;

/// Snapshot of one connection's counters and timing state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket, ACKs and retransmissions included.
    pub datagrams_sent: u64,
    /// Datagrams read from the socket that came from the peer.
    pub datagrams_received: u64,
    /// Datagrams that failed to decode or fell outside the receive window.
    pub datagrams_dropped: u64,
    /// Datagrams from a source other than the peer.
    pub datagrams_ignored: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// First transmissions on the reliable channel.
    pub reliable_sent: u64,
    pub unreliable_sent: u64,
    /// Timeout-driven retransmissions.
    pub retransmissions: u64,
    pub fast_retransmissions: u64,
    pub acks_sent: u64,
    /// ACKs that matched an outstanding packet.
    pub acks_received: u64,
    /// Reliable arrivals already delivered, skipped or buffered.
    pub duplicates: u64,

    pub delivered_reliable: u64,
    pub delivered_unreliable: u64,
    pub skipped: u64,
    pub delivery_failures: u64,

    pub srtt: Option<Duration>,
    pub rto: Duration,
    /// Reliable packets awaiting acknowledgement.
    pub outstanding: usize,
    /// Out-of-order reliable packets held by the receiver.
    pub buffered: usize,
}

impl ConnectionStats {
    /// Fraction of first transmissions that were retransmitted at least
    /// once, counting fast retransmits.
    pub fn retransmission_ratio(&self) -> f64 {
        if self.reliable_sent == 0 {
            return 0.0;
        }
        (self.retransmissions + self.fast_retransmissions) as f64 / self.reliable_sent as f64
    }
}
