//! Channel multiplexer.
//!
//! Binds the reliable sender and receiver and the unreliable channel to one
//! peer. The multiplexer is sans-IO: callers feed it datagrams and clock
//! readings and perform the transmissions and deliveries it returns.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::config::ConnectionConfig;
use crate::error::{HudpError, Result};
use crate::event::{EngineEvent, EventKind, EventSink};
use crate::packet::{self, Channel, Packet};
use crate::receiver::{Arrival, Delivery, ReceiverEngine};
use crate::sender::{DeliveryFailure, SenderEngine};
use crate::seq::Seq;
use crate::stats::ConnectionStats;

/// A payload delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Channel,
    pub seq: Seq,
    /// Sender wall clock at first transmission, in wrapping milliseconds.
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Work produced by one multiplexer call.
#[derive(Debug, Default)]
pub struct MuxOutput {
    /// Encoded datagrams to send to the peer, in order.
    pub transmit: Vec<Bytes>,
    /// Messages for the application, in delivery order.
    pub deliver: Vec<Message>,
    /// Reliable packets abandoned by the sender.
    pub failed: Vec<DeliveryFailure>,
}

impl MuxOutput {
    pub fn is_empty(&self) -> bool {
        self.transmit.is_empty() && self.deliver.is_empty() && self.failed.is_empty()
    }
}

/// Per-peer protocol state.
pub struct ChannelMultiplexer {
    sender: SenderEngine,
    receiver: ReceiverEngine,
    next_unreliable: Seq,
    stats: ConnectionStats,
    sink: Arc<dyn EventSink>,
    epoch: Instant,
    closed: bool,
}

impl ChannelMultiplexer {
    pub fn new(config: &ConnectionConfig, sink: Arc<dyn EventSink>, now: Instant) -> Self {
        Self::with_initial_seq(config, sink, Seq::ZERO, now)
    }

    /// Start both reliable directions at `initial`. Both peers must agree.
    pub fn with_initial_seq(
        config: &ConnectionConfig,
        sink: Arc<dyn EventSink>,
        initial: Seq,
        now: Instant,
    ) -> Self {
        Self {
            sender: SenderEngine::with_initial_seq(config, initial),
            receiver: ReceiverEngine::with_initial_seq(config, initial),
            next_unreliable: Seq::ZERO,
            stats: ConnectionStats::default(),
            sink,
            epoch: now,
            closed: false,
        }
    }

    /// Send `payload` on `channel`. Returns the assigned sequence number and
    /// the datagram to transmit.
    pub fn send(&mut self, payload: Bytes, channel: Channel, now: Instant) -> Result<(Seq, Bytes)> {
        if self.closed {
            return Err(HudpError::ConnectionClosed);
        }
        let timestamp = packet::wall_clock_ms();

        let (seq, datagram) = match channel {
            Channel::Reliable => {
                let seq = self.sender.next_seq();
                let packet = self.sender.send_reliable(payload, timestamp, now)?;
                let datagram = packet.encode()?;
                self.stats.reliable_sent += 1;
                (seq, datagram)
            }
            Channel::Unreliable => {
                let seq = self.next_unreliable;
                let datagram = Packet::Data {
                    channel,
                    seq,
                    timestamp,
                    payload,
                }
                .encode()?;
                self.next_unreliable = seq.next();
                self.stats.unreliable_sent += 1;
                (seq, datagram)
            }
        };

        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        self.emit(now, EventKind::Sent, channel, Some(seq));
        Ok((seq, datagram))
    }

    /// Process one inbound datagram. Malformed datagrams are dropped and
    /// counted; they never produce an error.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> MuxOutput {
        let mut out = MuxOutput::default();
        if self.closed {
            return out;
        }
        self.stats.datagrams_received += 1;
        self.stats.bytes_received += data.len() as u64;

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(len = data.len(), error = %e, "dropping malformed datagram");
                self.stats.datagrams_dropped += 1;
                let channel = match data.first() {
                    Some(flags) if flags & 1 == 1 => Channel::Unreliable,
                    _ => Channel::Reliable,
                };
                self.emit(now, EventKind::Dropped, channel, None);
                return out;
            }
        };

        match packet {
            Packet::Ack {
                ack_seq, cumulative, ..
            } => {
                let ack = self.sender.on_ack(ack_seq, cumulative, now);
                if ack.acked {
                    self.stats.acks_received += 1;
                    self.sink.record(
                        self.event(now, EventKind::Acked, Channel::Reliable, Some(ack_seq))
                            .with_rtt(ack.rtt_sample),
                    );
                }
                if let Some(packet) = ack.fast_retransmit {
                    self.stats.fast_retransmissions += 1;
                    self.emit(now, EventKind::Retransmitted, Channel::Reliable, Some(cumulative.next()));
                    self.transmit(&mut out, &packet);
                }
            }
            Packet::Data {
                channel: Channel::Reliable,
                seq,
                timestamp,
                payload,
            } => {
                let outcome = self.receiver.on_data(seq, timestamp, payload, now);
                match outcome.arrival {
                    Arrival::OutOfWindow => {
                        self.stats.datagrams_dropped += 1;
                        self.emit(now, EventKind::Dropped, Channel::Reliable, Some(seq));
                    }
                    Arrival::Duplicate | Arrival::Late => self.stats.duplicates += 1,
                    Arrival::InOrder | Arrival::Buffered => {}
                }
                if let Some(ack) = outcome.ack {
                    self.stats.acks_sent += 1;
                    self.transmit(&mut out, &ack);
                }
                self.apply_deliveries(&mut out, outcome.deliveries, now);
            }
            Packet::Data {
                channel: Channel::Unreliable,
                seq,
                timestamp,
                payload,
            } => {
                self.stats.delivered_unreliable += 1;
                self.emit(now, EventKind::Delivered, Channel::Unreliable, Some(seq));
                out.deliver.push(Message {
                    channel: Channel::Unreliable,
                    seq,
                    timestamp,
                    payload,
                });
            }
        }
        out
    }

    /// Run retransmission timeouts and the receiver's skip timer.
    pub fn poll_timers(&mut self, now: Instant) -> MuxOutput {
        let mut out = MuxOutput::default();
        if self.closed {
            return out;
        }

        let timeouts = self.sender.poll_timeouts(now);
        for packet in &timeouts.retransmit {
            if let Packet::Data { seq, .. } = packet {
                self.stats.retransmissions += 1;
                self.emit(now, EventKind::Retransmitted, Channel::Reliable, Some(*seq));
            }
            self.transmit(&mut out, packet);
        }
        for failure in timeouts.failed {
            self.stats.delivery_failures += 1;
            self.emit(now, EventKind::DeliveryFailed, Channel::Reliable, Some(failure.seq));
            out.failed.push(failure);
        }

        let skips = self.receiver.poll_skip(now);
        self.apply_deliveries(&mut out, skips, now);
        out
    }

    /// Release all outstanding and buffered state. Later calls fail or
    /// produce nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!(
            outstanding = self.sender.outstanding(),
            buffered = self.receiver.buffered(),
            "multiplexer closed"
        );
        self.sender.clear();
        self.receiver.clear();
        self.closed = true;
    }

    /// Counter snapshot including the current RTT state.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.srtt = self.sender.estimator().srtt();
        stats.rto = self.sender.rto();
        stats.outstanding = self.sender.outstanding();
        stats.buffered = self.receiver.buffered();
        stats
    }

    /// Count a datagram that arrived from somewhere other than the peer.
    pub fn record_ignored(&mut self, now: Instant) {
        self.stats.datagrams_ignored += 1;
        self.emit(now, EventKind::Dropped, Channel::Reliable, None);
    }

    pub fn sender(&self) -> &SenderEngine {
        &self.sender
    }

    pub fn receiver(&self) -> &ReceiverEngine {
        &self.receiver
    }

    fn apply_deliveries(&mut self, out: &mut MuxOutput, deliveries: Vec<Delivery>, now: Instant) {
        for delivery in deliveries {
            match delivery {
                Delivery::Delivered(d) => {
                    self.stats.delivered_reliable += 1;
                    self.emit(now, EventKind::Delivered, Channel::Reliable, Some(d.seq));
                    out.deliver.push(Message {
                        channel: Channel::Reliable,
                        seq: d.seq,
                        timestamp: d.timestamp,
                        payload: d.payload,
                    });
                }
                Delivery::Skipped(seq) => {
                    self.stats.skipped += 1;
                    self.emit(now, EventKind::Skipped, Channel::Reliable, Some(seq));
                }
            }
        }
    }

    fn transmit(&mut self, out: &mut MuxOutput, packet: &Packet) {
        match packet.encode() {
            Ok(datagram) => {
                self.stats.datagrams_sent += 1;
                self.stats.bytes_sent += datagram.len() as u64;
                out.transmit.push(datagram);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode outbound packet"),
        }
    }

    fn event(&self, now: Instant, kind: EventKind, channel: Channel, seq: Option<Seq>) -> EngineEvent {
        EngineEvent::new(now.saturating_duration_since(self.epoch), kind, channel, seq)
    }

    fn emit(&self, now: Instant, kind: EventKind, channel: Channel, seq: Option<Seq>) {
        self.sink.record(self.event(now, kind, channel, seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventQueue, NullSink};
    use std::time::Duration;

    fn mux(now: Instant) -> ChannelMultiplexer {
        ChannelMultiplexer::new(&ConnectionConfig::default(), Arc::new(NullSink), now)
    }

    #[test]
    fn unreliable_send_keeps_no_state() {
        let now = Instant::now();
        let mut a = mux(now);
        let (s0, _) = a.send(Bytes::from_static(b"u"), Channel::Unreliable, now).unwrap();
        let (s1, _) = a.send(Bytes::from_static(b"u"), Channel::Unreliable, now).unwrap();
        assert_eq!((s0, s1), (Seq(0), Seq(1)));
        assert_eq!(a.sender().outstanding(), 0);
        assert!(a.poll_timers(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn reliable_and_unreliable_counters_are_independent() {
        let now = Instant::now();
        let mut a = mux(now);
        a.send(Bytes::from_static(b"u"), Channel::Unreliable, now).unwrap();
        let (seq, _) = a.send(Bytes::from_static(b"r"), Channel::Reliable, now).unwrap();
        assert_eq!(seq, Seq(0));
        assert_eq!(a.sender().outstanding(), 1);
    }

    #[test]
    fn malformed_datagram_counted_and_dropped() {
        let now = Instant::now();
        let queue = Arc::new(EventQueue::new(16));
        let mut a = ChannelMultiplexer::new(&ConnectionConfig::default(), queue.clone(), now);
        let out = a.handle_datagram(&[0u8; 5], now);
        assert!(out.is_empty());
        assert_eq!(a.stats().datagrams_dropped, 1);
        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Dropped);
    }

    #[test]
    fn closed_mux_refuses_work() {
        let now = Instant::now();
        let mut a = mux(now);
        let mut b = mux(now);
        let (_, datagram) = a.send(Bytes::from_static(b"r"), Channel::Reliable, now).unwrap();
        a.close();
        assert_eq!(a.sender().outstanding(), 0);
        assert!(matches!(
            a.send(Bytes::from_static(b"r"), Channel::Reliable, now),
            Err(HudpError::ConnectionClosed)
        ));

        b.close();
        assert!(b.handle_datagram(&datagram, now).is_empty());
        assert!(a.poll_timers(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn stats_snapshot_includes_timing_state() {
        let now = Instant::now();
        let mut a = mux(now);
        a.send(Bytes::from_static(b"r"), Channel::Reliable, now).unwrap();
        let stats = a.stats();
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.rto, Duration::from_millis(200));
        assert_eq!(stats.srtt, None);
        assert_eq!(stats.reliable_sent, 1);
        assert_eq!(stats.datagrams_sent, 1);
    }
}
