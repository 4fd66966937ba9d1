//! Observable engine events.
//!
//! The multiplexer reports every send, ACK, retransmission, delivery, skip,
//! failure and drop to an [`EventSink`]. Sinks are called from the driver
//! task and must return immediately; [`EventQueue`] buffers events in a
//! bounded lock-free queue for a consumer elsewhere.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::packet::Channel;
use crate::seq::Seq;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Sent,
    Acked,
    Retransmitted,
    Delivered,
    Skipped,
    DeliveryFailed,
    /// A datagram failed to decode, arrived beyond the receive window, or
    /// came from a foreign source.
    Dropped,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Acked => "acked",
            EventKind::Retransmitted => "retransmitted",
            EventKind::Delivered => "delivered",
            EventKind::Skipped => "skipped",
            EventKind::DeliveryFailed => "delivery_failed",
            EventKind::Dropped => "dropped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Time since the multiplexer was created.
    pub elapsed: Duration,
    pub kind: EventKind,
    pub channel: Channel,
    /// `None` for datagrams dropped before a sequence could be read.
    pub seq: Option<Seq>,
    /// Clean RTT sample, only set on `Acked`.
    pub rtt: Option<Duration>,
}

impl EngineEvent {
    pub fn new(elapsed: Duration, kind: EventKind, channel: Channel, seq: Option<Seq>) -> Self {
        Self {
            elapsed,
            kind,
            channel,
            seq,
            rtt: None,
        }
    }

    pub fn with_rtt(mut self, rtt: Option<Duration>) -> Self {
        self.rtt = rtt;
        self
    }

    /// Column names matching [`EngineEvent::to_csv_row`].
    pub const CSV_HEADER: &'static str = "timestamp_ms,kind,channel,seq,rtt_ms";

    /// Render as a CSV row. Missing values are left empty.
    pub fn to_csv_row(&self) -> String {
        let seq = self.seq.map(|s| s.to_string()).unwrap_or_default();
        let rtt = self
            .rtt
            .map(|r| format!("{:.3}", r.as_secs_f64() * 1000.0))
            .unwrap_or_default();
        format!(
            "{:.3},{},{},{},{}",
            self.elapsed.as_secs_f64() * 1000.0,
            self.kind,
            self.channel.as_str(),
            seq,
            rtt
        )
    }
}

/// Receiver of engine events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: EngineEvent) {}
}

/// Bounded lock-free event buffer. When full, the oldest event is displaced
/// and counted as overflow.
pub struct EventQueue {
    queue: ArrayQueue<EngineEvent>,
    overflow: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn pop(&self) -> Option<EngineEvent> {
        self.queue.pop()
    }

    /// Remove and return every buffered event in arrival order.
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Events displaced because the queue was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

impl EventSink for EventQueue {
    fn record(&self, event: EngineEvent) {
        if self.queue.force_push(event).is_some() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("overflow", &self.overflow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, seq: u16) -> EngineEvent {
        EngineEvent::new(Duration::from_millis(seq as u64), kind, Channel::Reliable, Some(Seq(seq)))
    }

    #[test]
    fn queue_preserves_order() {
        let q = EventQueue::new(8);
        q.record(event(EventKind::Sent, 1));
        q.record(event(EventKind::Acked, 1));
        let kinds: Vec<_> = q.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Sent, EventKind::Acked]);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_displaces_oldest() {
        let q = EventQueue::new(2);
        for i in 0..5 {
            q.record(event(EventKind::Sent, i));
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.overflow(), 3);
        let seqs: Vec<_> = q.drain().into_iter().filter_map(|e| e.seq).collect();
        assert_eq!(seqs, vec![Seq(3), Seq(4)]);
    }

    #[test]
    fn csv_row_formats_optional_fields() {
        let acked = event(EventKind::Acked, 7).with_rtt(Some(Duration::from_micros(12_500)));
        assert_eq!(acked.to_csv_row(), "7.000,acked,reliable,7,12.500");

        let dropped = EngineEvent::new(
            Duration::from_millis(3),
            EventKind::Dropped,
            Channel::Unreliable,
            None,
        );
        assert_eq!(dropped.to_csv_row(), "3.000,dropped,unreliable,,");
    }
}
