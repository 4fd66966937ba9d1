//! Reliable-channel receiver with bounded-wait in-order delivery.
//!
//! Arrivals are acknowledged individually (selective repeat on the wire) but
//! exposed to the application strictly in sequence order. Out-of-order
//! packets wait in a reorder buffer. When the packet at the cursor stays
//! missing for `t_skip`, the cursor moves past it and whatever is now
//! contiguous is delivered in one batch. A skipped sequence is never
//! delivered, even if it shows up later.
//!
//! The skip timer is a single optional deadline evaluated by
//! [`ReceiverEngine::poll_skip`]; nothing runs in the background.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ConnectionConfig;
use crate::packet::Packet;
use crate::seq::{Seq, HALF_RANGE};

/// An out-of-order arrival waiting for the cursor.
#[derive(Debug, Clone)]
pub struct ReorderEntry {
    pub seq: Seq,
    pub payload: Bytes,
    pub timestamp: u32,
}

/// A payload released to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPayload {
    pub seq: Seq,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// One step of the in-order output stream, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered(DeliveredPayload),
    /// The cursor gave up on this sequence.
    Skipped(Seq),
}

/// How an arrival was classified relative to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Matched the cursor and was delivered.
    InOrder,
    /// Ahead of the cursor and newly buffered.
    Buffered,
    /// Ahead of the cursor and already buffered.
    Duplicate,
    /// Behind the cursor: already delivered or skipped.
    Late,
    /// Too far ahead to buffer; dropped without an ACK.
    OutOfWindow,
}

/// Result of processing one reliable data packet.
#[derive(Debug)]
pub struct DataOutcome {
    pub arrival: Arrival,
    /// ACK to send back; `None` only for [`Arrival::OutOfWindow`].
    pub ack: Option<Packet>,
    pub deliveries: Vec<Delivery>,
}

/// Receiving side of the reliable channel.
pub struct ReceiverEngine {
    next_expected: Seq,
    buffer: HashMap<Seq, ReorderEntry>,
    skip_deadline: Option<Instant>,
    t_skip: Option<Duration>,
    recv_window: u16,
}

impl ReceiverEngine {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self::with_initial_seq(config, Seq::ZERO)
    }

    /// Create a receiver whose cursor starts at `initial`.
    pub fn with_initial_seq(config: &ConnectionConfig, initial: Seq) -> Self {
        Self {
            next_expected: initial,
            buffer: HashMap::new(),
            skip_deadline: None,
            t_skip: config.t_skip,
            recv_window: config.recv_window.min(HALF_RANGE - 1),
        }
    }

    /// Process a reliable data packet.
    pub fn on_data(&mut self, seq: Seq, timestamp: u32, payload: Bytes, now: Instant) -> DataOutcome {
        let mut deliveries = Vec::new();
        let distance = self.next_expected.distance_to(seq);

        let arrival = if distance == 0 {
            deliveries.push(Delivery::Delivered(DeliveredPayload {
                seq,
                timestamp,
                payload,
            }));
            self.next_expected = seq.next();
            self.drain(&mut deliveries);
            self.rearm(now);
            Arrival::InOrder
        } else if distance < HALF_RANGE {
            if distance >= self.recv_window {
                // No ACK: the sender must keep retransmitting until the
                // window has moved far enough to buffer this packet.
                tracing::debug!(
                    seq = seq.value(),
                    expected = self.next_expected.value(),
                    "reliable packet beyond receive window dropped"
                );
                return DataOutcome {
                    arrival: Arrival::OutOfWindow,
                    ack: None,
                    deliveries,
                };
            }
            if self.buffer.contains_key(&seq) {
                Arrival::Duplicate
            } else {
                self.buffer.insert(
                    seq,
                    ReorderEntry {
                        seq,
                        payload,
                        timestamp,
                    },
                );
                if self.skip_deadline.is_none() {
                    self.skip_deadline = self.t_skip.map(|t| now + t);
                }
                Arrival::Buffered
            }
        } else {
            Arrival::Late
        };

        DataOutcome {
            arrival,
            ack: Some(Packet::Ack {
                ack_seq: seq,
                cumulative: self.cumulative(),
                timestamp,
            }),
            deliveries,
        }
    }

    /// Skip the missing packet at the cursor if its wait has elapsed.
    ///
    /// At most one hole is skipped per elapsed deadline; the next hole gets a
    /// fresh `t_skip` measured from `now`.
    pub fn poll_skip(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let Some(deadline) = self.skip_deadline else {
            return deliveries;
        };
        if now < deadline {
            return deliveries;
        }
        if self.buffer.is_empty() {
            self.skip_deadline = None;
            return deliveries;
        }

        let skipped = self.next_expected;
        tracing::debug!(
            seq = skipped.value(),
            buffered = self.buffer.len(),
            "skipping missing reliable packet"
        );
        deliveries.push(Delivery::Skipped(skipped));
        self.next_expected = skipped.next();
        self.drain(&mut deliveries);
        self.rearm(now);
        deliveries
    }

    fn drain(&mut self, deliveries: &mut Vec<Delivery>) {
        while let Some(entry) = self.buffer.remove(&self.next_expected) {
            deliveries.push(Delivery::Delivered(DeliveredPayload {
                seq: entry.seq,
                timestamp: entry.timestamp,
                payload: entry.payload,
            }));
            self.next_expected = self.next_expected.next();
        }
    }

    fn rearm(&mut self, now: Instant) {
        self.skip_deadline = if self.buffer.is_empty() {
            None
        } else {
            self.t_skip.map(|t| now + t)
        };
    }

    /// Drop all buffered entries and disarm the skip timer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.skip_deadline = None;
    }

    pub fn next_expected(&self) -> Seq {
        self.next_expected
    }

    /// Last sequence delivered or skipped in order.
    pub fn cumulative(&self) -> Seq {
        self.next_expected.prev()
    }

    /// Number of out-of-order entries held.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_entry(&self, seq: Seq) -> Option<&ReorderEntry> {
        self.buffer.get(&seq)
    }

    pub fn skip_deadline(&self) -> Option<Instant> {
        self.skip_deadline
    }
}
