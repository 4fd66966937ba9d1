//! Connection configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{HudpError, Result};
use crate::rtt::{DEFAULT_INITIAL_RTO, DEFAULT_RTO_MAX, DEFAULT_RTO_MIN};
use crate::seq::HALF_RANGE;

/// Default bounded wait before a missing reliable packet is skipped.
pub const DEFAULT_T_SKIP: Duration = Duration::from_millis(200);

/// Configuration for one H-UDP connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Local address the socket binds to.
    pub bind_addr: SocketAddr,
    /// Remote peer. When `None`, the first datagram's source is adopted.
    pub peer_addr: Option<SocketAddr>,
    /// Bounded wait for a missing reliable packet; `None` waits forever
    /// (strict in-order delivery).
    pub t_skip: Option<Duration>,
    /// Lower RTO clamp.
    pub rto_min: Duration,
    /// Upper RTO clamp.
    pub rto_max: Duration,
    /// RTO used until the first clean RTT sample.
    pub initial_rto: Duration,
    /// Retransmissions attempted before a packet is reported as failed.
    pub max_retransmits: u32,
    /// Duplicate cumulative ACKs that trigger a fast retransmit; 0 disables.
    pub fast_retransmit_threshold: u32,
    /// Maximum unacknowledged reliable packets.
    pub send_window: u16,
    /// Span of sequence numbers ahead of the cursor the receiver buffers.
    pub recv_window: u16,
    /// Timer evaluation period.
    pub tick_interval: Duration,
    /// Capacity of the default event queue.
    pub event_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer_addr: None,
            t_skip: Some(DEFAULT_T_SKIP),
            rto_min: DEFAULT_RTO_MIN,
            rto_max: DEFAULT_RTO_MAX,
            initial_rto: DEFAULT_INITIAL_RTO,
            max_retransmits: 10,
            fast_retransmit_threshold: 3,
            send_window: 64,
            recv_window: 128,
            tick_interval: Duration::from_millis(10),
            event_queue_capacity: 4096,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn t_skip(mut self, t_skip: Option<Duration>) -> Self {
        self.t_skip = t_skip;
        self
    }

    /// Set both RTO clamps.
    pub fn rto_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.rto_min = min;
        self.rto_max = max;
        self
    }

    pub fn initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    pub fn max_retransmits(mut self, n: u32) -> Self {
        self.max_retransmits = n;
        self
    }

    pub fn fast_retransmit_threshold(mut self, n: u32) -> Self {
        self.fast_retransmit_threshold = n;
        self
    }

    /// Set send and receive window sizes.
    pub fn windows(mut self, send: u16, recv: u16) -> Self {
        self.send_window = send;
        self.recv_window = recv;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Reject values the engines cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.rto_min.is_zero() {
            return Err(HudpError::Config("rto_min must be non-zero".into()));
        }
        if self.rto_min > self.rto_max {
            return Err(HudpError::Config(format!(
                "rto_min ({:?}) exceeds rto_max ({:?})",
                self.rto_min, self.rto_max
            )));
        }
        if self.send_window == 0 || self.send_window >= HALF_RANGE {
            return Err(HudpError::Config(format!(
                "send_window must be in 1..{HALF_RANGE}, got {}",
                self.send_window
            )));
        }
        if self.recv_window == 0 || self.recv_window >= HALF_RANGE {
            return Err(HudpError::Config(format!(
                "recv_window must be in 1..{HALF_RANGE}, got {}",
                self.recv_window
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(HudpError::Config("tick_interval must be non-zero".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(HudpError::Config(
                "event_queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ConnectionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.t_skip, Some(Duration::from_millis(200)));
        assert_eq!(cfg.fast_retransmit_threshold, 3);
    }

    #[test]
    fn inverted_rto_bounds_rejected() {
        let cfg = ConnectionConfig::new()
            .rto_bounds(Duration::from_secs(2), Duration::from_secs(1));
        assert!(matches!(cfg.validate(), Err(HudpError::Config(_))));
    }

    #[test]
    fn window_must_fit_half_sequence_space() {
        let cfg = ConnectionConfig::new().windows(HALF_RANGE, 64);
        assert!(cfg.validate().is_err());
        let cfg = ConnectionConfig::new().windows(64, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let cfg = ConnectionConfig::new()
            .peer_addr(peer)
            .t_skip(None)
            .max_retransmits(3)
            .fast_retransmit_threshold(0);
        assert_eq!(cfg.peer_addr, Some(peer));
        assert_eq!(cfg.t_skip, None);
        assert_eq!(cfg.max_retransmits, 3);
        assert_eq!(cfg.fast_retransmit_threshold, 0);
    }
}
