//! Peer identity and the per-leg handles used to reach a remote endpoint.
//!
//! A [`Peer`] is one view of a remote endpoint. Servers see a `Connector` per
//! leg as soon as traffic arrives, then a `Joined` peer once the handshake
//! has correlated both legs. Clients hold a single `Remote` peer for the
//! server. Views of the same stream leg share one channel, so the reliable
//! outbound queue is the same whichever view a caller sends through.
//!
//! Joined peers also carry named attributes, for session data owned by the
//! application (an account, a character, a room).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use mio::Token;
use parking_lot::RwLock;
use tracing::debug;

use crate::datagram::DatagramShared;
use crate::error::LinkError;
use crate::messages::{Disconnect, Envelope, Message};
use crate::stream::{StreamChannel, StreamShared};

/// Player id of a peer that has not completed the handshake.
pub const UNASSIGNED_PLAYER: i64 = -1;

/// Value stored under a peer attribute name.
pub type Attribute = Arc<dyn Any + Send + Sync>;

/// Process-unique identity of a peer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ClientId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ClientId`].
    pub fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// The two transport legs of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Reliable, ordered stream (TCP).
    Stream,
    /// Unreliable datagrams (UDP).
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Server-side view of one leg before the handshake completes.
    Connector,
    /// Server-side view combining both legs after the handshake.
    Joined,
    /// Client-side view of the server.
    Remote,
}

// ---------------------------------------------------------------------------
// Legs
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StreamLeg {
    pub(crate) channel: Arc<StreamChannel>,
    pub(crate) transport: Arc<StreamShared>,
}

impl StreamLeg {
    pub(crate) fn new(channel: Arc<StreamChannel>, transport: Arc<StreamShared>) -> Self {
        Self { channel, transport }
    }

    pub fn token(&self) -> Token {
        self.channel.token()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }
}

#[derive(Clone)]
pub struct DatagramLeg {
    pub(crate) remote: SocketAddr,
    pub(crate) transport: Arc<DatagramShared>,
}

impl DatagramLeg {
    pub(crate) fn new(remote: SocketAddr, transport: Arc<DatagramShared>) -> Self {
        Self { remote, transport }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

pub struct Peer {
    client_id: ClientId,
    player_id: AtomicI64,
    label: String,
    role: PeerRole,
    stream: Option<StreamLeg>,
    datagram: Option<DatagramLeg>,
    connected: AtomicBool,
    attributes: Option<RwLock<HashMap<String, Attribute>>>,
}

impl Peer {
    pub(crate) fn new(
        ids: &IdGenerator,
        role: PeerRole,
        label: &str,
        stream: Option<StreamLeg>,
        datagram: Option<DatagramLeg>,
    ) -> Arc<Self> {
        let client_id = ids.next_id();
        Arc::new(Self {
            client_id,
            player_id: AtomicI64::new(UNASSIGNED_PLAYER),
            label: format!("{label}#{client_id}"),
            role,
            stream,
            datagram,
            connected: AtomicBool::new(true),
            attributes: (role == PeerRole::Joined).then(RwLock::default),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn player_id(&self) -> i64 {
        self.player_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_player_id(&self, id: i64) {
        self.player_id.store(id, Ordering::Release);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn stream_leg(&self) -> Option<&StreamLeg> {
        self.stream.as_ref()
    }

    pub fn datagram_leg(&self) -> Option<&DatagramLeg> {
        self.datagram.as_ref()
    }

    pub fn has_leg(&self, leg: Leg) -> bool {
        match leg {
            Leg::Stream => self.stream.is_some(),
            Leg::Datagram => self.datagram.is_some(),
        }
    }

    /// Address of the stream leg, else of the datagram leg.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream
            .as_ref()
            .map(StreamLeg::remote_addr)
            .or_else(|| self.datagram.as_ref().map(DatagramLeg::remote_addr))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && self.stream.as_ref().is_none_or(|leg| !leg.channel.is_closed())
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Store `value` under `name`, returning the previous value.
    ///
    /// Only joined peers carry attributes.
    pub fn set_attribute<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        value: T,
    ) -> Result<Option<Attribute>, LinkError> {
        let attributes = self.attributes.as_ref().ok_or(LinkError::NotJoined)?;
        Ok(attributes.write().insert(name.into(), Arc::new(value)))
    }

    /// The value under `name`, if present and of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = self.attributes.as_ref()?.read().get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Attribute> {
        self.attributes.as_ref()?.write().remove(name)
    }

    /// Attribute names in sorted order.
    pub fn attribute_names(&self) -> Vec<String> {
        let Some(attributes) = &self.attributes else {
            return Vec::new();
        };
        let mut names: Vec<String> = attributes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `other` reaches the remote endpoint through one of our legs.
    pub fn shares_leg(&self, other: &Peer) -> bool {
        let stream = match (&self.stream, &other.stream) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.channel, &b.channel),
            _ => false,
        };
        let datagram = match (&self.datagram, &other.datagram) {
            (Some(a), Some(b)) => a.remote == b.remote && Arc::ptr_eq(&a.transport, &b.transport),
            _ => false,
        };
        stream || datagram
    }

    /// Send a message.
    ///
    /// Reliable messages join the stream leg's outbound queue and are flushed
    /// by the loop thread; unreliable ones go out immediately as a datagram.
    /// When the requested leg is missing the other one carries the message.
    pub fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        match (envelope.reliable, &self.stream, &self.datagram) {
            (true, Some(leg), _) => {
                leg.channel.enqueue(envelope);
                leg.transport.core().request_write(leg.channel.token());
                Ok(())
            }
            (false, _, Some(leg)) => leg.transport.send_to(&envelope.message, leg.remote),
            (true, None, Some(leg)) => {
                debug!("[{}] No stream leg, sending reliable message as datagram", self.label);
                leg.transport.send_to(&envelope.message, leg.remote)
            }
            (false, Some(leg), None) => leg.transport.send_direct(&leg.channel, &envelope.message),
            (reliable, None, None) => Err(LinkError::LegUnavailable(if reliable {
                Leg::Stream
            } else {
                Leg::Datagram
            })),
        }
    }

    /// Send a kick notice and schedule removal.
    pub fn kick(self: &Arc<Self>, reason: impl Into<String>) -> Result<(), LinkError> {
        self.disconnect(Disconnect::kick(reason))
    }

    /// Send `notice` reliably and schedule removal from every leg.
    ///
    /// Only server-held views act on this; a `Remote` view leaves the
    /// decision to its owning client session. Calling it again, or after
    /// the peer is gone, does nothing.
    pub fn disconnect(self: &Arc<Self>, notice: Disconnect) -> Result<(), LinkError> {
        if self.role == PeerRole::Remote || !self.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.send(Envelope::reliable(Message::Disconnect(notice))) {
            debug!("[{}] Disconnect notice not sent: {e}", self.label);
        }
        self.enqueue_disconnect();
        Ok(())
    }

    /// Schedule removal from every leg at the end of the next tick.
    pub fn enqueue_disconnect(self: &Arc<Self>) {
        if let Some(leg) = &self.stream {
            leg.transport.core().enqueue_disconnect(self.clone());
        }
        if let Some(leg) = &self.datagram {
            leg.transport.core().enqueue_disconnect(self.clone());
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
    }
}

impl Eq for Peer {}

impl PartialEq<ClientId> for Peer {
    fn eq(&self, other: &ClientId) -> bool {
        self.client_id == *other
    }
}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.client_id.hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("client_id", &self.client_id)
            .field("player_id", &self.player_id())
            .field("label", &self.label)
            .field("role", &self.role)
            .field("stream", &self.stream.as_ref().map(StreamLeg::remote_addr))
            .field("datagram", &self.datagram.as_ref().map(DatagramLeg::remote_addr))
            .finish()
    }
}
