//! H-UDP -- a hybrid reliable/unreliable transport over UDP.
//!
//! Two channels share one socket per peer:
//! - **Reliable**: selective-repeat retransmission with adaptive RTO and
//!   in-order delivery that waits at most `t_skip` for a missing packet
//! - **Unreliable**: fire-and-forget, delivered on arrival
//!
//! The protocol engines ([`SenderEngine`], [`ReceiverEngine`],
//! [`ChannelMultiplexer`]) are sans-IO and take the current time as an
//! argument. [`Connection`] drives them over a tokio UDP socket.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod mux;
pub mod packet;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod seq;
pub mod stats;
pub mod transport;

// Re-export key public types at crate root.
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{HudpError, Result};
pub use event::{EngineEvent, EventKind, EventQueue, EventSink, NullSink};
pub use mux::{ChannelMultiplexer, Message, MuxOutput};
pub use packet::{Channel, Packet};
pub use receiver::{Delivery, ReceiverEngine};
pub use rtt::RtoEstimator;
pub use sender::{DeliveryFailure, SenderEngine};
pub use seq::Seq;
pub use stats::ConnectionStats;
pub use transport::{Transport, UdpTransport};
