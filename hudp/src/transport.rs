//! Datagram transport abstraction.
//!
//! [`Connection`](crate::connection::Connection) runs over any [`Transport`];
//! [`UdpTransport`] is the tokio `UdpSocket` implementation used by
//! [`Connection::open`](crate::connection::Connection::open).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::UdpSocket;

/// Boxed future returned by [`Transport::send_to`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// Boxed future returned by [`Transport::recv_from`].
pub type RecvFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a>>;

/// Async, unreliable datagram socket.
///
/// Object-safe so it can be shared as `Arc<dyn Transport>` between the
/// driver and the read task.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `target`.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a>;

    /// Receive one datagram into `buf`, returning its length and source.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// [`Transport`] backed by a tokio `UdpSocket`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        Box::pin(self.socket.send_to(buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
