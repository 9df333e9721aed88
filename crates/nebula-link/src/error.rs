//! Errors returned synchronously to callers of the session API.
//!
//! Per-peer I/O failures never surface here; they are logged and resolved by
//! deferred disconnection inside the transports.

use crate::messages::MessageError;
use crate::peer::Leg;
use crate::secure::TlsError;

/// Configuration and state errors raised by servers, clients and peers.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The operation needs a connected peer or session.
    #[error("not connected")]
    NotConnected,

    /// The server has not been bound, or has already been stopped.
    #[error("server is not bound")]
    NotBound,

    /// The operation needs a peer that completed the handshake.
    #[error("peer has not joined the session")]
    NotJoined,

    /// `start` was called on a session whose driver is already running.
    #[error("session driver is already running")]
    AlreadyRunning,

    /// Both the stream and datagram ports were disabled.
    #[error("both stream and datagram transports are disabled")]
    BothTransportsDisabled,

    /// A port outside `-1..=65535` was supplied.
    #[error("invalid port {0} (expected -1 to disable, or 0..=65535)")]
    InvalidPort(i32),

    /// The peer has no leg of the requested kind and no fallback exists.
    #[error("peer has no {0:?} leg")]
    LegUnavailable(Leg),

    /// A host name could not be resolved to a socket address.
    #[error("could not resolve host {0}")]
    UnresolvedHost(String),

    /// A message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] MessageError),

    /// The secure transport could not be set up.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Socket or multiplexer setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
