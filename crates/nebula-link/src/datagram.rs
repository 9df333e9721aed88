//! Unreliable datagram transport (UDP) and LAN host discovery.
//!
//! One socket serves every peer. A server-role transport learns peers from
//! the source address of the datagrams it receives; a client-role transport
//! talks to a single target. Datagrams carry exactly one message body with no
//! length prefix. Nothing is retried or reordered.
//!
//! UDP has no close event, so a server forgets connectors that stay silent
//! for longer than the connector idle period. Joined peers are only removed
//! by an explicit disconnect.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Token};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::error::LinkError;
use crate::listener::ConnectionEvent;
use crate::messages::{Envelope, Message, decode_message, encode_message};
use crate::peer::{DatagramLeg, Leg, Peer, PeerRole};
use crate::transport::{Engine, HandleKind, Transport, TransportCore, TransportOptions};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// How long an unjoined connector may stay silent before it is dropped.
pub const DEFAULT_CONNECTOR_IDLE: Duration = Duration::from_secs(10);

const SOCKET: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramRole {
    /// Accepts datagrams from anyone and answers discovery probes.
    Server,
    /// Exchanges datagrams with one target.
    Client { target: SocketAddr },
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The part of a datagram transport reachable from any thread.
pub struct DatagramShared {
    core: TransportCore,
    role: DatagramRole,
    socket: Mutex<UdpSocket>,
    capacity: usize,
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl DatagramShared {
    pub fn core(&self) -> &TransportCore {
        &self.core
    }

    pub fn role(&self) -> DatagramRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(addr).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Send `message` to one address.
    pub fn send_to(&self, message: &Message, addr: SocketAddr) -> Result<(), LinkError> {
        let bytes = encode_message(message)?;
        self.send_bytes(&bytes, addr)
    }

    /// Send `message` to the target (client role) or every known joined peer
    /// (server role).
    pub fn send(&self, message: &Message) -> Result<(), LinkError> {
        match self.role {
            DatagramRole::Client { target } => self.send_to(message, target),
            DatagramRole::Server => self.broadcast(message, &|_: &Peer| true),
        }
    }

    /// Send `message` to every joined peer accepted by `filter`.
    pub fn broadcast(&self, message: &Message, filter: &dyn Fn(&Peer) -> bool) -> Result<(), LinkError> {
        let bytes = encode_message(message)?;
        for peer in self.peers() {
            if peer.role() == PeerRole::Connector || !filter(&peer) {
                continue;
            }
            if let Some(leg) = peer.datagram_leg()
                && let Err(e) = self.send_bytes(&bytes, leg.remote_addr())
            {
                debug!("[{}] Broadcast to {} failed: {e}", self.core.label(), leg.remote_addr());
                self.core
                    .report_fault(Some(peer.clone()), format!("send to {} failed: {e}", leg.remote_addr()));
            }
        }
        Ok(())
    }

    /// Make `peer` the live instance for its remote address.
    pub fn adopt(&self, peer: &Arc<Peer>) {
        let Some(leg) = peer.datagram_leg() else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(&leg.transport), self) {
            return;
        }
        let mut peers = self.peers.write();
        match self.role {
            // A client's only peer is the server; it is adopted up front.
            DatagramRole::Client { .. } => {
                peers.insert(leg.remote_addr(), peer.clone());
            }
            DatagramRole::Server => {
                if let Some(live) = peers.get_mut(&leg.remote_addr()) {
                    *live = peer.clone();
                }
            }
        }
    }

    /// Schedule every live peer for removal.
    pub fn enqueue_all(&self) {
        for peer in self.peers() {
            self.core.enqueue_disconnect(peer);
        }
    }

    fn send_bytes(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::NotConnected);
        }
        if bytes.len() > self.capacity {
            warn!(
                "[{}] Dropping {}-byte datagram to {addr}: exceeds {} bytes",
                self.core.label(),
                bytes.len(),
                self.capacity
            );
            return Ok(());
        }
        let socket = self.socket.lock();
        match socket.send_to(bytes, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("[{}] Socket busy, dropping datagram to {addr}", self.core.label());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Loop-side half of a datagram transport.
pub struct DatagramTransport {
    shared: Arc<DatagramShared>,
    engine: Engine,
    recv_buf: Vec<u8>,
    /// Last datagram from each unjoined connector.
    last_seen: HashMap<SocketAddr, Instant>,
    connector_idle: Duration,
}

impl DatagramTransport {
    /// Bind a server-role socket on `addr`.
    pub fn bind(options: &TransportOptions, addr: SocketAddr, capacity: usize) -> Result<Self, LinkError> {
        Self::open(options, addr, DatagramRole::Server, capacity)
    }

    /// Bind an ephemeral client-role socket that talks to `target`.
    pub fn connect(options: &TransportOptions, target: SocketAddr, capacity: usize) -> Result<Self, LinkError> {
        let local: IpAddr = match target {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        Self::open(options, SocketAddr::new(local, 0), DatagramRole::Client { target }, capacity)
    }

    fn open(
        options: &TransportOptions,
        addr: SocketAddr,
        role: DatagramRole,
        capacity: usize,
    ) -> Result<Self, LinkError> {
        let (core, engine) = TransportCore::open(options, Leg::Datagram)?;
        let mut socket = UdpSocket::bind(addr).inspect_err(|e| {
            error!("[{}] Failed to bind {addr}: {e}", core.label());
        })?;
        engine
            .registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;
        match role {
            DatagramRole::Server => info!("[{}] Listening on {local_addr}", core.label()),
            DatagramRole::Client { target } => {
                debug!("[{}] Bound {local_addr} for {target}", core.label())
            }
        }

        let capacity = capacity.min(MAX_DATAGRAM);
        Ok(Self {
            shared: Arc::new(DatagramShared {
                core,
                role,
                socket: Mutex::new(socket),
                capacity,
                peers: RwLock::new(HashMap::new()),
                local_addr,
                closed: AtomicBool::new(false),
            }),
            engine,
            recv_buf: vec![0u8; capacity],
            last_seen: HashMap::new(),
            connector_idle: DEFAULT_CONNECTOR_IDLE,
        })
    }

    /// Drop unjoined connectors after `idle` without traffic.
    pub fn with_connector_idle(mut self, idle: Duration) -> Self {
        self.connector_idle = idle;
        self
    }

    pub fn shared(&self) -> Arc<DatagramShared> {
        self.shared.clone()
    }

    fn dispatch(&mut self, len: usize, from: SocketAddr) {
        let label = self.shared.core.label();
        let message = match decode_message(&self.recv_buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{label}] Dropping undecodable datagram from {from}: {e}");
                return;
            }
        };

        if message == Message::DiscoverHost {
            if self.shared.role == DatagramRole::Server {
                debug!("[{label}] Answering discovery probe from {from}");
                if let Err(e) = self.shared.send_to(&Message::DiscoverHost, from) {
                    debug!("[{label}] Discovery reply to {from} failed: {e}");
                }
            }
            return;
        }

        let peer = match self.shared.peer(&from) {
            Some(peer) => peer,
            None => match self.shared.role {
                // A late goodbye from a released peer.
                DatagramRole::Server if matches!(message, Message::Disconnect(_)) => {
                    debug!("[{label}] Ignoring disconnect from unknown sender {from}");
                    return;
                }
                DatagramRole::Server => match self.admit(from) {
                    Some(peer) => peer,
                    None => return,
                },
                DatagramRole::Client { .. } => {
                    debug!("[{label}] Ignoring datagram from unknown sender {from}");
                    return;
                }
            },
        };
        if peer.role() == PeerRole::Connector {
            self.last_seen.insert(from, Instant::now());
        }
        let envelope = Envelope::received(message, peer, Leg::Datagram);
        self.shared.core.listeners().fire_message(&envelope);
    }

    fn admit(&self, from: SocketAddr) -> Option<Arc<Peer>> {
        let core = &self.shared.core;
        if let Some(reason) = core.should_filter(&from) {
            info!("[{}] Rejected connector {from}: {reason}", core.label());
            return None;
        }
        let peer = Peer::new(
            core.ids(),
            PeerRole::Connector,
            core.name(),
            None,
            Some(DatagramLeg::new(from, self.shared.clone())),
        );
        self.shared.peers.write().insert(from, peer.clone());
        debug!("[{}] New connector {} from {from}", core.label(), peer.label());
        core.listeners()
            .fire_connection(&ConnectionEvent::Connected(peer.clone()));
        Some(peer)
    }
}

impl Transport for DatagramTransport {
    fn core(&self) -> &TransportCore {
        &self.shared.core
    }

    fn engine(&mut self) -> &mut Engine {
        &mut self.engine
    }

    fn handle_kind(&self, token: Token) -> HandleKind {
        if token == SOCKET {
            HandleKind::Channel
        } else {
            HandleKind::Unknown
        }
    }

    fn read(&mut self, _token: Token) {
        loop {
            let received = self.shared.socket.lock().recv_from(&mut self.recv_buf);
            match received {
                Ok((len, from)) => self.dispatch(len, from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // ICMP errors from earlier sends surface here on some platforms.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) => {}
                Err(e) => {
                    warn!("[{}] Receive failed: {e}", self.shared.core.label());
                    self.shared.core.report_fault(None, format!("receive failed: {e}"));
                    return;
                }
            }
        }
    }

    fn accept(&mut self, _token: Token) {}

    fn write(&mut self, _token: Token) {}

    fn connect(&mut self, _token: Token) {}

    fn release(&mut self, peer: &Arc<Peer>) -> Option<Arc<Peer>> {
        let leg = peer.datagram_leg()?;
        if !Arc::ptr_eq(&leg.transport, &self.shared) {
            return None;
        }
        let live = self.shared.peers.write().remove(&leg.remote_addr())?;
        self.last_seen.remove(&leg.remote_addr());
        peer.mark_disconnected();
        live.mark_disconnected();
        Some(live)
    }

    fn expire(&mut self) {
        if self.last_seen.is_empty() {
            return;
        }
        let now = Instant::now();
        let idle = self.connector_idle;
        let stale: Vec<SocketAddr> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= idle)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.last_seen.remove(&addr);
            // Joined since the last datagram: no longer ours to expire.
            if let Some(peer) = self.shared.peer(&addr)
                && peer.role() == PeerRole::Connector
            {
                debug!(
                    "[{}] Dropping idle connector {} from {addr}",
                    self.shared.core.label(),
                    peer.label()
                );
                self.shared.core.enqueue_disconnect(peer);
            }
        }
    }

    fn cleanup(&mut self) {
        self.last_seen.clear();
        self.shared.closed.store(true, Ordering::Release);
        let _ = self
            .engine
            .registry()
            .deregister(&mut *self.shared.socket.lock());
        let peers: Vec<_> = self.shared.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.mark_disconnected();
        }
        debug!("[{}] Closed", self.shared.core.label());
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Probe the local network for servers listening on datagram `port`.
///
/// Sends a discovery probe to the limited broadcast address and to loopback,
/// then collects the distinct addresses that answer before `timeout`.
pub fn discover_hosts(port: u16, timeout: Duration) -> io::Result<Vec<IpAddr>> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))?;
    let socket: std::net::UdpSocket = socket.into();

    let probe = encode_message(&Message::DiscoverHost).map_err(io::Error::other)?;
    for target in [Ipv4Addr::BROADCAST, Ipv4Addr::LOCALHOST] {
        if let Err(e) = socket.send_to(&probe, (target, port)) {
            debug!("Discovery probe to {target}:{port} failed: {e}");
        }
    }

    let deadline = Instant::now() + timeout;
    let mut hosts = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        socket.set_read_timeout(Some(deadline - now))?;
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let answered = matches!(decode_message(&buf[..len]), Ok(Message::DiscoverHost));
                if answered && !hosts.contains(&from.ip()) {
                    hosts.push(from.ip());
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Discovery receive failed: {e}");
                break;
            }
        }
    }
    info!("Discovered {} host(s) on port {port}", hosts.len());
    Ok(hosts)
}
