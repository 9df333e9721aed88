//! Client/server session layer for Nebula.
//!
//! Every session pairs a reliable stream transport (TCP) with an unreliable
//! datagram transport (UDP) and runs both on one non-blocking driver thread:
//!
//! - [`transport`]: multiplexer engine, dispatch order and deferred
//!   disconnection shared by both transports.
//! - [`stream`] and [`datagram`]: the two transports. [`secure`] adds an
//!   optional TLS layer to the stream leg.
//! - [`framing`], [`buffer`] and [`messages`]: the wire format.
//! - [`peer`] and [`registry`]: remote endpoints and the handshake that joins
//!   a client's two legs into one [`Peer`].
//! - [`session`]: the [`Server`] and [`Client`] entry points.

pub mod buffer;
pub mod datagram;
pub mod driver;
pub mod error;
pub mod framing;
pub mod listener;
pub mod messages;
pub mod peer;
pub mod registry;
pub mod secure;
pub mod session;
pub mod stream;
pub mod transport;

pub use datagram::discover_hosts;
pub use error::LinkError;
pub use framing::FrameConfig;
pub use listener::{
    ConnectionEvent, ConnectionListener, ConnectorFilter, ErrorListener, ListenerId, MessageListener, TransportFault,
};
pub use messages::{CustomMessage, Disconnect, DisconnectKind, Envelope, Message, MessageKind};
pub use peer::{Attribute, ClientId, Leg, Peer, PeerRole};
pub use secure::{TlsContext, TlsError};
pub use session::{Client, DISABLED_PORT, Server, SessionConfig};

#[cfg(test)]
mod tests;
