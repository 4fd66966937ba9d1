//! Selective-repeat sender.
//!
//! Every reliable packet gets an [`OutstandingRecord`] keyed by sequence
//! number. Deadlines live in a single min-heap scanned by
//! [`SenderEngine::poll_timeouts`]; there is no per-packet timer. Heap
//! entries are deleted lazily: an entry is honoured only if its record is
//! still present and still carries the same deadline, so a packet acked
//! between two ticks is never retransmitted.
//!
//! Only the expired packet is resent. Its own timeout doubles (capped at the
//! upper RTO clamp) and, per Karn's rule, an ACK for a packet that was ever
//! retransmitted yields no RTT sample.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ConnectionConfig;
use crate::error::{HudpError, Result};
use crate::packet::{Channel, Packet, MAX_PAYLOAD_SIZE};
use crate::rtt::RtoEstimator;
use crate::seq::Seq;

/// One unacknowledged reliable packet.
#[derive(Debug, Clone)]
pub struct OutstandingRecord {
    pub seq: Seq,
    pub payload: Bytes,
    /// Header timestamp of the first transmission, reused on retransmit.
    pub timestamp: u32,
    /// Time of the most recent transmission.
    pub send_time: Instant,
    pub retransmit_count: u32,
    /// Set once the packet has been sent more than once (Karn's rule).
    pub is_retransmission: bool,
    /// Timeout applied to this record; doubles on each expiry.
    pub timeout: Duration,
    pub deadline: Instant,
}

impl OutstandingRecord {
    fn to_packet(&self) -> Packet {
        Packet::Data {
            channel: Channel::Reliable,
            seq: self.seq,
            timestamp: self.timestamp,
            payload: self.payload.clone(),
        }
    }
}

/// A reliable packet abandoned after exhausting its retransmissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub seq: Seq,
    pub payload: Bytes,
    pub attempts: u32,
}

impl From<&DeliveryFailure> for HudpError {
    fn from(failure: &DeliveryFailure) -> Self {
        HudpError::DeliveryFailed {
            seq: failure.seq.value(),
            attempts: failure.attempts,
        }
    }
}

/// Result of processing one ACK.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// The ACK matched an outstanding record.
    pub acked: bool,
    /// Clean RTT sample fed to the estimator, if any.
    pub rtt_sample: Option<Duration>,
    /// Packet resent early because of duplicate cumulative ACKs.
    pub fast_retransmit: Option<Packet>,
}

/// Result of one timer scan.
#[derive(Debug, Default)]
pub struct TimeoutOutcome {
    pub retransmit: Vec<Packet>,
    pub failed: Vec<DeliveryFailure>,
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    seq: Seq,
}

// BinaryHeap is a max-heap; we want the *earliest* deadline first,
// so we reverse the ordering.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.value().cmp(&self.seq.value()))
    }
}

/// Sending side of the reliable channel.
pub struct SenderEngine {
    next_seq: Seq,
    records: HashMap<Seq, OutstandingRecord>,
    timers: BinaryHeap<TimerEntry>,
    estimator: RtoEstimator,
    send_window: usize,
    max_retransmits: u32,
    fast_retransmit_threshold: u32,
    last_cumulative: Option<Seq>,
    dup_acks: u32,
}

impl SenderEngine {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self::with_initial_seq(config, Seq::ZERO)
    }

    /// Create a sender whose first packet carries `initial`.
    pub fn with_initial_seq(config: &ConnectionConfig, initial: Seq) -> Self {
        Self {
            next_seq: initial,
            records: HashMap::new(),
            timers: BinaryHeap::new(),
            estimator: RtoEstimator::new(config.rto_min, config.rto_max, config.initial_rto),
            send_window: config.send_window as usize,
            max_retransmits: config.max_retransmits,
            fast_retransmit_threshold: config.fast_retransmit_threshold,
            last_cumulative: None,
            dup_acks: 0,
        }
    }

    /// Assign the next sequence number to `payload` and start tracking it.
    /// Returns the packet to transmit right away.
    pub fn send_reliable(&mut self, payload: Bytes, timestamp: u32, now: Instant) -> Result<Packet> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HudpError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        // A record still holding `next_seq` means the ring has lapped a
        // long-retrying packet; treat it like a full window.
        if self.records.len() >= self.send_window || self.records.contains_key(&self.next_seq) {
            return Err(HudpError::SendWindowFull {
                outstanding: self.records.len(),
            });
        }

        let seq = self.next_seq;
        self.next_seq = seq.next();

        let timeout = self.estimator.rto();
        let record = OutstandingRecord {
            seq,
            payload,
            timestamp,
            send_time: now,
            retransmit_count: 0,
            is_retransmission: false,
            timeout,
            deadline: now + timeout,
        };
        let packet = record.to_packet();
        self.timers.push(TimerEntry {
            deadline: record.deadline,
            seq,
        });
        self.records.insert(seq, record);
        Ok(packet)
    }

    /// Process an ACK for `ack_seq` carrying the receiver's `cumulative`
    /// position. Unknown or repeated ACKs are ignored.
    pub fn on_ack(&mut self, ack_seq: Seq, cumulative: Seq, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        if let Some(record) = self.records.remove(&ack_seq) {
            outcome.acked = true;
            if record.is_retransmission {
                tracing::trace!(
                    seq = ack_seq.value(),
                    retransmits = record.retransmit_count,
                    "ack for retransmitted packet; rtt sample discarded"
                );
            } else {
                let sample = now.saturating_duration_since(record.send_time);
                self.estimator.update(sample);
                outcome.rtt_sample = Some(sample);
            }
        }

        outcome.fast_retransmit = self.track_cumulative(cumulative, now);
        outcome
    }

    fn track_cumulative(&mut self, cumulative: Seq, now: Instant) -> Option<Packet> {
        if self.fast_retransmit_threshold == 0 {
            return None;
        }
        if self.last_cumulative != Some(cumulative) {
            self.last_cumulative = Some(cumulative);
            self.dup_acks = 0;
            return None;
        }

        self.dup_acks += 1;
        if self.dup_acks != self.fast_retransmit_threshold {
            return None;
        }

        let target = cumulative.next();
        let record = self.records.get_mut(&target)?;
        if record.retransmit_count >= self.max_retransmits {
            return None;
        }
        record.retransmit_count += 1;
        record.is_retransmission = true;
        record.send_time = now;
        record.deadline = now + record.timeout;
        self.timers.push(TimerEntry {
            deadline: record.deadline,
            seq: target,
        });

        tracing::debug!(
            seq = target.value(),
            dup_acks = self.dup_acks,
            "fast retransmit"
        );
        Some(record.to_packet())
    }

    /// Retransmit every packet whose deadline has passed and give up on
    /// those that already used all their retransmissions.
    pub fn poll_timeouts(&mut self, now: Instant) -> TimeoutOutcome {
        let mut outcome = TimeoutOutcome::default();

        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.timers.pop() else {
                break;
            };

            // Skip if already ACKed or re-armed since this entry was pushed.
            let Some(record) = self.records.get_mut(&entry.seq) else {
                continue;
            };
            if record.deadline != entry.deadline {
                continue;
            }

            if record.retransmit_count >= self.max_retransmits {
                let attempts = record.retransmit_count;
                if let Some(record) = self.records.remove(&entry.seq) {
                    tracing::warn!(
                        seq = entry.seq.value(),
                        attempts,
                        "reliable packet abandoned after max retransmissions"
                    );
                    outcome.failed.push(DeliveryFailure {
                        seq: record.seq,
                        payload: record.payload,
                        attempts,
                    });
                }
                continue;
            }

            record.retransmit_count += 1;
            record.is_retransmission = true;
            record.send_time = now;
            record.timeout = self.estimator.backed_off(record.timeout);
            record.deadline = now + record.timeout;
            self.timers.push(TimerEntry {
                deadline: record.deadline,
                seq: entry.seq,
            });

            tracing::debug!(
                seq = entry.seq.value(),
                attempt = record.retransmit_count,
                timeout_ms = record.timeout.as_millis() as u64,
                "retransmission timeout"
            );
            outcome.retransmit.push(record.to_packet());
        }

        if !outcome.retransmit.is_empty() {
            self.estimator.on_timeout();
        }
        outcome
    }

    /// Drop every outstanding record and pending timer.
    pub fn clear(&mut self) {
        self.records.clear();
        self.timers.clear();
        self.last_cumulative = None;
        self.dup_acks = 0;
    }

    /// Number of unacknowledged packets.
    pub fn outstanding(&self) -> usize {
        self.records.len()
    }

    pub fn has_outstanding(&self, seq: Seq) -> bool {
        self.records.contains_key(&seq)
    }

    pub fn record(&self, seq: Seq) -> Option<&OutstandingRecord> {
        self.records.get(&seq)
    }

    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }

    pub fn estimator(&self) -> &RtoEstimator {
        &self.estimator
    }

    /// Timeout applied to newly sent packets.
    pub fn rto(&self) -> Duration {
        self.estimator.rto()
    }
}
