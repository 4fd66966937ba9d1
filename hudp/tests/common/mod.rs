//! Shared helpers for integration tests: an in-memory impaired link for the
//! sans-IO engines and a lossy wrapper around a real UDP transport.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hudp::transport::{RecvFuture, SendFuture, Transport, UdpTransport};

/// One direction of a simulated network path with random loss,
/// duplication and delay (which reorders).
pub struct Link {
    in_flight: Vec<(Instant, Bytes)>,
    pub loss: f64,
    pub duplicate: f64,
    pub min_delay: Duration,
    pub jitter_ms: u64,
    pub dropped: u64,
}

impl Link {
    pub fn new(loss: f64, duplicate: f64, min_delay: Duration, jitter_ms: u64) -> Self {
        Self {
            in_flight: Vec::new(),
            loss,
            duplicate,
            min_delay,
            jitter_ms,
            dropped: 0,
        }
    }

    pub fn perfect(delay: Duration) -> Self {
        Self::new(0.0, 0.0, delay, 0)
    }

    pub fn push(&mut self, datagram: Bytes, now: Instant) {
        if rand::random::<f64>() < self.loss {
            self.dropped += 1;
            return;
        }
        let copies = if rand::random::<f64>() < self.duplicate { 2 } else { 1 };
        for _ in 0..copies {
            let jitter = if self.jitter_ms == 0 {
                0
            } else {
                rand::random::<u64>() % (self.jitter_ms + 1)
            };
            let at = now + self.min_delay + Duration::from_millis(jitter);
            self.in_flight.push((at, datagram.clone()));
        }
    }

    pub fn push_all(&mut self, datagrams: Vec<Bytes>, now: Instant) {
        for d in datagrams {
            self.push(d, now);
        }
    }

    /// Remove and return every datagram due at `now`, earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<Bytes> {
        let mut ready = Vec::new();
        let mut pending = Vec::with_capacity(self.in_flight.len());
        for (at, d) in self.in_flight.drain(..) {
            if at <= now {
                ready.push((at, d));
            } else {
                pending.push((at, d));
            }
        }
        self.in_flight = pending;
        ready.sort_by_key(|(at, _)| *at);
        ready.into_iter().map(|(_, d)| d).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// UDP transport that silently discards a fraction of outbound datagrams.
pub struct LossyTransport {
    inner: UdpTransport,
    loss: f64,
    pub discarded: AtomicU64,
}

impl LossyTransport {
    pub async fn bind(addr: SocketAddr, loss: f64) -> io::Result<Self> {
        Ok(Self {
            inner: UdpTransport::bind(addr).await?,
            loss,
            discarded: AtomicU64::new(0),
        })
    }
}

impl Transport for LossyTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        if rand::random::<f64>() < self.loss {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            let len = buf.len();
            return Box::pin(async move { Ok(len) });
        }
        self.inner.send_to(buf, target)
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Transport whose socket calls fail on demand. A healthy `recv_from`
/// never completes.
pub struct FaultyTransport {
    pub fail_send: bool,
    pub fail_recv: bool,
}

impl FaultyTransport {
    fn error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "socket failed")
    }
}

impl Transport for FaultyTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], _target: SocketAddr) -> SendFuture<'a> {
        let result = if self.fail_send { Err(Self::error()) } else { Ok(buf.len()) };
        Box::pin(async move { result })
    }

    fn recv_from<'a>(&'a self, _buf: &'a mut [u8]) -> RecvFuture<'a> {
        if self.fail_recv {
            let result: io::Result<(usize, SocketAddr)> = Err(Self::error());
            Box::pin(async move { result })
        } else {
            Box::pin(std::future::pending::<io::Result<(usize, SocketAddr)>>())
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 40_000)))
    }
}

pub fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
