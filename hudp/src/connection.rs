//! Async connection over a datagram transport.
//!
//! A [`Connection`] is a handle to a driver task that owns the
//! [`ChannelMultiplexer`]. The driver multiplexes three inputs:
//!
//! - a periodic tick that runs retransmission and skip timers,
//! - commands from the handle (send, close),
//! - datagrams forwarded by a separate socket read task.
//!
//! Engine state is touched only by the driver, so there are no locks on the
//! protocol path. Delivered messages and delivery failures flow back to the
//! handle through an unbounded channel.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConnectionConfig;
use crate::error::{HudpError, Result};
use crate::event::{EventQueue, EventSink};
use crate::mux::{ChannelMultiplexer, Message, MuxOutput};
use crate::packet::{Channel, Packet};
use crate::seq::Seq;
use crate::stats::ConnectionStats;
use crate::transport::{Transport, UdpTransport};

/// Read buffer size. Larger than any valid datagram so oversize input is
/// seen whole and rejected by the decoder.
const RECV_BUFFER_SIZE: usize = 2048;

const COMMAND_QUEUE_DEPTH: usize = 64;
const INPUT_QUEUE_DEPTH: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Bound, peer not yet known.
    Open,
    /// Peer known; traffic flows.
    Active,
    /// Closed locally or after a fatal socket error.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Active => write!(f, "Active"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// State the driver publishes for the handle.
#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    peer: Option<SocketAddr>,
    stats: ConnectionStats,
    closed_locally: bool,
}

enum Command {
    Send {
        payload: Bytes,
        channel: Channel,
        reply: oneshot::Sender<Result<Seq>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

type Inbound = Result<Message>;

/// Handle to one H-UDP connection.
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    shared: Arc<Mutex<Shared>>,
    local_addr: SocketAddr,
    events: Option<Arc<EventQueue>>,
}

impl Connection {
    /// Bind a UDP socket to `config.bind_addr` and start the driver.
    ///
    /// Engine events are collected in an [`EventQueue`] reachable through
    /// [`Connection::events`].
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_addr).await?;
        let events = Arc::new(EventQueue::new(config.event_queue_capacity));
        let mut conn = Self::with_transport(Arc::new(transport), config, events.clone())?;
        conn.events = Some(events);
        Ok(conn)
    }

    /// Start a connection over an arbitrary transport, reporting engine
    /// events to `sink`. Must be called within a tokio runtime.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;

        let state = if config.peer_addr.is_some() {
            ConnectionState::Active
        } else {
            ConnectionState::Open
        };
        let shared = Arc::new(Mutex::new(Shared {
            state,
            peer: config.peer_addr,
            stats: ConnectionStats::default(),
            closed_locally: false,
        }));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(transport.clone(), input_tx));
        let mux = ChannelMultiplexer::new(&config, sink, now());
        let driver = Driver {
            mux,
            transport,
            shared: shared.clone(),
            peer: config.peer_addr,
            inbound_tx,
            read_task,
        };
        tokio::spawn(driver.run(cmd_rx, input_rx, config.tick_interval));

        tracing::debug!(%local_addr, peer = ?config.peer_addr, "connection opened");
        Ok(Self {
            cmd_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            shared,
            local_addr,
            events: None,
        })
    }

    /// Send `payload` on `channel`, returning its sequence number.
    ///
    /// Fails with [`HudpError::PeerUnknown`] until a peer is configured or
    /// latched, and with [`HudpError::SendWindowFull`] when too many reliable
    /// packets are unacknowledged.
    pub async fn send(&self, payload: impl Into<Bytes>, channel: Channel) -> Result<Seq> {
        if self.shared.lock().state == ConnectionState::Closed {
            return Err(HudpError::ConnectionClosed);
        }
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Send {
            payload: payload.into(),
            channel,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return Err(HudpError::ConnectionClosed);
        }
        rx.await.unwrap_or(Err(HudpError::ConnectionClosed))
    }

    /// Wait for the next message.
    ///
    /// A reliable packet the peer gave up on surfaces here as
    /// [`HudpError::DeliveryFailed`]; the connection remains usable. A
    /// socket error is returned once, after which the connection is closed.
    pub async fn recv(&self) -> Result<Message> {
        let mut inbound = self.inbound.lock().await;
        if self.shared.lock().closed_locally {
            return Err(HudpError::ConnectionClosed);
        }
        match inbound.recv().await {
            Some(item) => item,
            None => Err(HudpError::ConnectionClosed),
        }
    }

    /// Like [`Connection::recv`] but gives up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Return a message if one is ready.
    pub fn try_recv(&self) -> Result<Option<Message>> {
        if self.shared.lock().closed_locally {
            return Err(HudpError::ConnectionClosed);
        }
        let Ok(mut inbound) = self.inbound.try_lock() else {
            return Ok(None);
        };
        match inbound.try_recv() {
            Ok(item) => item.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(HudpError::ConnectionClosed),
        }
    }

    /// Stop the driver and release all protocol state. Idempotent.
    pub async fn close(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.closed_locally {
                return;
            }
            shared.closed_locally = true;
        }
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.shared.lock().state = ConnectionState::Closed;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Latest counter snapshot published by the driver.
    pub fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().peer
    }

    /// Engine events, when the connection was created by
    /// [`Connection::open`].
    pub fn events(&self) -> Option<&EventQueue> {
        self.events.as_deref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer", &shared.peer)
            .field("state", &shared.state)
            .finish()
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Forward every datagram to the driver until the socket fails or the
/// driver goes away.
async fn read_loop(
    transport: Arc<dyn Transport>,
    input_tx: mpsc::Sender<io::Result<(Bytes, SocketAddr)>>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let received = transport.recv_from(&mut buf).await;
        let item = received.map(|(n, src)| (Bytes::copy_from_slice(&buf[..n]), src));
        let failed = item.is_err();
        if input_tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

struct Driver {
    mux: ChannelMultiplexer,
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
    peer: Option<SocketAddr>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    read_task: JoinHandle<()>,
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut input_rx: mpsc::Receiver<io::Result<(Bytes, SocketAddr)>>,
        tick_interval: Duration,
    ) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut close_reply = None;
        let mut send_reply = None;
        let mut fatal = None;
        loop {
            let step = tokio::select! {
                _ = interval.tick() => {
                    let out = self.mux.poll_timers(now());
                    self.dispatch(out).await
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { payload, channel, reply }) => {
                        let (result, step) = self.send(payload, channel).await;
                        self.publish_stats();
                        if step.is_ok() {
                            let _ = reply.send(result);
                        } else {
                            send_reply = Some((reply, result));
                        }
                        step
                    }
                    Some(Command::Close { reply }) => {
                        close_reply = Some(reply);
                        break;
                    }
                    None => break,
                },

                input = input_rx.recv() => match input {
                    Some(Ok((data, src))) => self.on_datagram(data, src).await,
                    Some(Err(e)) => Err(e),
                    None => break,
                },
            };

            if let Err(e) = step {
                tracing::error!(error = %e, "socket error, closing connection");
                fatal = Some(e);
                break;
            }
            self.publish_stats();
        }

        // The handle must see `Closed` before it can observe the error.
        self.shutdown();
        if let Some(e) = fatal {
            let _ = self.inbound_tx.send(Err(HudpError::Io(e)));
        }
        if let Some((reply, result)) = send_reply {
            let _ = reply.send(result);
        }
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
    }

    async fn send(&mut self, payload: Bytes, channel: Channel) -> (Result<Seq>, io::Result<()>) {
        let Some(peer) = self.peer else {
            return (Err(HudpError::PeerUnknown), Ok(()));
        };
        let (seq, datagram) = match self.mux.send(payload, channel, now()) {
            Ok(sent) => sent,
            Err(e) => return (Err(e), Ok(())),
        };
        match self.transport.send_to(&datagram, peer).await {
            Ok(_) => (Ok(seq), Ok(())),
            Err(e) => {
                // The caller gets a copy; the original goes to `recv`.
                let copy = io::Error::new(e.kind(), e.to_string());
                (Err(HudpError::Io(copy)), Err(e))
            }
        }
    }

    async fn on_datagram(&mut self, data: Bytes, src: SocketAddr) -> io::Result<()> {
        match self.peer {
            // Only a well-formed datagram may establish the peer.
            None if Packet::decode(&data).is_err() => {
                let out = self.mux.handle_datagram(&data, now());
                return self.dispatch(out).await;
            }
            None => {
                self.peer = Some(src);
                let mut shared = self.shared.lock();
                shared.peer = Some(src);
                shared.state = ConnectionState::Active;
                tracing::debug!(peer = %src, "peer latched from first datagram");
            }
            Some(peer) if peer != src => {
                tracing::trace!(%src, %peer, "ignoring datagram from foreign source");
                self.mux.record_ignored(now());
                return Ok(());
            }
            Some(_) => {}
        }

        let out = self.mux.handle_datagram(&data, now());
        self.dispatch(out).await
    }

    async fn dispatch(&mut self, out: MuxOutput) -> io::Result<()> {
        // A timer pass gives up on packets before it skips holes.
        for failure in &out.failed {
            let _ = self.inbound_tx.send(Err(HudpError::from(failure)));
        }
        for message in out.deliver {
            let _ = self.inbound_tx.send(Ok(message));
        }
        if out.transmit.is_empty() {
            return Ok(());
        }
        let Some(peer) = self.peer else {
            return Ok(());
        };
        for datagram in &out.transmit {
            self.transport.send_to(datagram, peer).await?;
        }
        Ok(())
    }

    fn publish_stats(&self) {
        self.shared.lock().stats = self.mux.stats();
    }

    fn shutdown(&mut self) {
        self.read_task.abort();
        self.mux.close();
        let mut shared = self.shared.lock();
        shared.state = ConnectionState::Closed;
        shared.stats = self.mux.stats();
        tracing::debug!(peer = ?self.peer, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "Open");
        assert_eq!(ConnectionState::Active.to_string(), "Active");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }

    #[tokio::test]
    async fn open_without_peer_is_open_state() {
        let config = ConnectionConfig::new().bind_addr("127.0.0.1:0".parse().unwrap());
        let conn = Connection::open(config).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.peer_addr().is_none());
        assert_ne!(conn.local_addr().port(), 0);
        assert!(matches!(
            conn.send(Bytes::from_static(b"x"), Channel::Reliable).await,
            Err(HudpError::PeerUnknown)
        ));
        conn.close().await;
    }

    #[tokio::test]
    async fn dispatch_queues_failures_ahead_of_deliveries() {
        let config = ConnectionConfig::default();
        let transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            mux: ChannelMultiplexer::new(&config, Arc::new(crate::event::NullSink), now()),
            transport,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Open,
                peer: None,
                stats: ConnectionStats::default(),
                closed_locally: false,
            })),
            peer: None,
            inbound_tx,
            read_task: tokio::spawn(async {}),
        };

        let out = MuxOutput {
            transmit: Vec::new(),
            deliver: vec![Message {
                channel: Channel::Reliable,
                seq: Seq(5),
                timestamp: 0,
                payload: Bytes::from_static(b"after skip"),
            }],
            failed: vec![crate::sender::DeliveryFailure {
                seq: Seq(3),
                payload: Bytes::from_static(b"lost"),
                attempts: 10,
            }],
        };
        driver.dispatch(out).await.unwrap();

        assert!(matches!(
            inbound_rx.try_recv().unwrap(),
            Err(HudpError::DeliveryFailed { seq: 3, attempts: 10 })
        ));
        assert_eq!(inbound_rx.try_recv().unwrap().unwrap().seq, Seq(5));
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let config = ConnectionConfig::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .windows(0, 128);
        assert!(matches!(
            Connection::open(config).await,
            Err(HudpError::Config(_))
        ));
    }
}
