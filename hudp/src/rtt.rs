//! Retransmission timeout estimation (Jacobson/Karels, RFC 6298).
//!
//! RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - sample|
//! SRTT   = 7/8 * SRTT   + 1/8 * sample
//! RTO    = SRTT + 4 * RTTVAR, clamped to [min, max]
//!
//! Backoff doubles the applied RTO only; SRTT and RTTVAR are left alone so a
//! burst of timeouts cannot poison the smoothed estimate.

use std::time::Duration;

/// Default lower RTO clamp.
pub const DEFAULT_RTO_MIN: Duration = Duration::from_millis(50);
/// Default upper RTO clamp.
pub const DEFAULT_RTO_MAX: Duration = Duration::from_secs(4);
/// RTO used before the first clean sample.
pub const DEFAULT_INITIAL_RTO: Duration = Duration::from_millis(200);

/// RTT estimator implementing Jacobson/Karels smoothing.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    /// Smoothed RTT.
    srtt: Option<Duration>,
    /// RTT variance.
    rttvar: Option<Duration>,
    /// Currently applied retransmission timeout.
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl RtoEstimator {
    /// Create an estimator clamped to `[min, max]` that starts at `initial`.
    pub fn new(min: Duration, max: Duration, initial: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: None,
            rto: initial.clamp(min, max),
            min,
            max,
        }
    }

    /// Feed a clean RTT sample (from a never-retransmitted packet).
    pub fn update(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = Some((rttvar * 3 + diff) / 4);
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
            _ => {
                // First sample: SRTT = sample, RTTVAR = sample / 2
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }

        self.recompute_rto();
    }

    /// Exponential backoff after a retransmission timeout.
    pub fn on_timeout(&mut self) {
        self.rto = self.backed_off(self.rto);
    }

    /// Double `timeout`, capped at the upper clamp.
    pub fn backed_off(&self, timeout: Duration) -> Duration {
        timeout.saturating_mul(2).clamp(self.min, self.max)
    }

    fn recompute_rto(&mut self) {
        if let (Some(srtt), Some(rttvar)) = (self.srtt, self.rttvar) {
            self.rto = (srtt + rttvar * 4).clamp(self.min, self.max);
        }
    }

    /// Returns the current smoothed RTT, or `None` if no samples yet.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the current RTT variance, or `None` if no samples yet.
    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    /// Returns the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_RTO_MIN, DEFAULT_RTO_MAX, DEFAULT_INITIAL_RTO)
    }
}
