//! Server and client sessions.
//!
//! A session composes one stream transport and one datagram transport (either
//! may be disabled), wires the internal listeners that implement the
//! handshake and disconnect protocol, and runs both transports on a
//! [`driver`](crate::driver) thread. Application code only talks to the
//! session: it sends, broadcasts and registers listeners here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::datagram::{DEFAULT_CONNECTOR_IDLE, DatagramShared, DatagramTransport, MAX_DATAGRAM};
use crate::driver::{self, DriverHandle};
use crate::error::LinkError;
use crate::framing::{DEFAULT_BUFFER_CAPACITY, FrameConfig};
use crate::listener::{ConnectionEvent, FilterChain, ListenerRegistry, TransportFault};
use crate::messages::{ClientRegistration, Disconnect, Envelope, Message, RegistrationAck};
use crate::peer::{DatagramLeg, IdGenerator, Leg, Peer, PeerRole, UNASSIGNED_PLAYER};
use crate::registry::{HandshakeRegistry, RegistrationOutcome};
use crate::secure::TlsContext;
use crate::stream::{StreamShared, StreamTransport};
use crate::transport::{Transport, TransportCore, TransportOptions};

/// Port value that disables a transport.
pub const DISABLED_PORT: i32 = -1;

const SHUTDOWN_REASON: &str = "Server shutdown";

/// Settings shared by servers and clients.
#[derive(Clone)]
pub struct SessionConfig {
    /// Prefix for log lines and peer labels.
    pub label: String,
    /// Clients must present the same game name to join.
    pub game_name: String,
    /// Clients must present the same version to join.
    pub version: u32,
    /// Pause between loop iterations. Zero yields instead of sleeping.
    pub loop_delay: Duration,
    /// Per-channel stream buffer capacity in bytes.
    pub stream_capacity: usize,
    /// Largest datagram sent or received.
    pub datagram_capacity: usize,
    /// A server drops datagram connectors that stay silent this long
    /// without joining.
    pub connector_idle: Duration,
    /// Secures the stream leg when set.
    pub tls: Option<TlsContext>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: "Nebula".to_string(),
            game_name: "nebula".to_string(),
            version: 1,
            loop_delay: Duration::from_millis(1),
            stream_capacity: DEFAULT_BUFFER_CAPACITY,
            datagram_capacity: MAX_DATAGRAM,
            connector_idle: DEFAULT_CONNECTOR_IDLE,
            tls: None,
        }
    }
}

impl SessionConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn frame_config(&self) -> FrameConfig {
        FrameConfig::new(self.stream_capacity)
    }
}

/// `-1` disables a side; anything else must be a valid port.
fn parse_port(port: i32) -> Result<Option<u16>, LinkError> {
    if port == DISABLED_PORT {
        return Ok(None);
    }
    u16::try_from(port)
        .map(Some)
        .map_err(|_| LinkError::InvalidPort(port))
}

fn parse_ports(stream_port: i32, datagram_port: i32) -> Result<(Option<u16>, Option<u16>), LinkError> {
    let ports = (parse_port(stream_port)?, parse_port(datagram_port)?);
    if ports == (None, None) {
        return Err(LinkError::BothTransportsDisabled);
    }
    Ok(ports)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct ServerState {
    label: String,
    listeners: Arc<ListenerRegistry>,
    registry: HandshakeRegistry,
    stream: Option<Arc<StreamShared>>,
    datagram: Option<Arc<DatagramShared>>,
}

impl ServerState {
    fn on_message(&self, envelope: &Envelope) {
        let Some(source) = envelope.source.as_ref() else {
            return;
        };
        match &envelope.message {
            Message::Registration(registration) => {
                self.on_registration(registration, source, envelope.leg.unwrap_or(Leg::Stream));
            }
            Message::Disconnect(notice) => {
                info!(
                    "[{}] {} is leaving: {}",
                    self.label,
                    source.label(),
                    notice.reason.as_deref().unwrap_or("no reason")
                );
                source.enqueue_disconnect();
            }
            _ if source.role() == PeerRole::Joined => self.listeners.fire_message(envelope),
            _ => debug!(
                "[{}] Dropping {:?} from unregistered {}",
                self.label,
                envelope.kind(),
                source.label()
            ),
        }
    }

    fn on_registration(&self, registration: &ClientRegistration, source: &Arc<Peer>, leg: Leg) {
        match self.registry.register(registration, source, leg) {
            RegistrationOutcome::Joined(peer) => {
                if let Some(stream) = &self.stream {
                    stream.adopt(&peer);
                }
                if let Some(datagram) = &self.datagram {
                    datagram.adopt(&peer);
                }
                let ack = RegistrationAck {
                    player_id: peer.player_id(),
                    client_id: peer.client_id().0,
                };
                if let Err(e) = peer.send(Envelope::reliable(Message::RegistrationAck(ack))) {
                    warn!("[{}] Could not acknowledge {}: {e}", self.label, peer.label());
                }
            }
            RegistrationOutcome::Rejected(reason) => {
                if let Err(e) = source.kick(reason) {
                    debug!("[{}] Kick of {} failed: {e}", self.label, source.label());
                }
            }
            RegistrationOutcome::Pending | RegistrationOutcome::Duplicate | RegistrationOutcome::Discarded => {}
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::Disconnected(Some(peer)) = event
            && let Some(joined) = self.registry.on_leg_disconnected(peer)
        {
            // Remove whichever leg is still live.
            joined.enqueue_disconnect();
        }
    }

    fn broadcast(&self, envelope: &Envelope, filter: &dyn Fn(&Peer) -> bool) -> Result<(), LinkError> {
        match (envelope.reliable, &self.stream, &self.datagram) {
            (true, Some(stream), _) | (false, Some(stream), None) => stream.broadcast(&envelope.message, filter),
            (_, _, Some(datagram)) => datagram.broadcast(&envelope.message, filter),
            (_, None, None) => Err(LinkError::NotBound),
        }
    }

    fn cores(&self) -> impl Iterator<Item = &TransportCore> {
        let stream = self.stream.as_deref().map(StreamShared::core);
        let datagram = self.datagram.as_deref().map(DatagramShared::core);
        stream.into_iter().chain(datagram)
    }
}

fn wire_server(state: &Arc<ServerState>, core: &TransportCore) {
    let weak: Weak<ServerState> = Arc::downgrade(state);
    core.listeners().add_error_listener(move |fault: &TransportFault| {
        if let Some(state) = weak.upgrade() {
            state.listeners.fire_error(fault);
        }
    });
    let weak: Weak<ServerState> = Arc::downgrade(state);
    core.listeners().add_message_listener(move |envelope: &Envelope| {
        if let Some(state) = weak.upgrade() {
            state.on_message(envelope);
        }
    });
    let weak: Weak<ServerState> = Arc::downgrade(state);
    core.listeners()
        .add_connection_listener(move |event: &ConnectionEvent| {
            if let Some(state) = weak.upgrade() {
                state.on_connection_event(event);
            }
        });
}

/// Accepts clients on a stream port and a datagram port.
pub struct Server {
    config: SessionConfig,
    state: Arc<ServerState>,
    filters: Arc<FilterChain>,
    idle: Mutex<Vec<Box<dyn Transport>>>,
    driver: Mutex<Option<DriverHandle>>,
    keep_alive: Arc<AtomicBool>,
    bound: AtomicBool,
}

impl Server {
    /// Bind on every interface. `-1` disables a side, `0` picks a free port.
    pub fn bind(config: SessionConfig, stream_port: i32, datagram_port: i32) -> Result<Self, LinkError> {
        Self::bind_addr(config, Ipv4Addr::UNSPECIFIED.into(), stream_port, datagram_port)
    }

    /// Bind on `ip`. `-1` disables a side, `0` picks a free port.
    pub fn bind_addr(
        config: SessionConfig,
        ip: IpAddr,
        stream_port: i32,
        datagram_port: i32,
    ) -> Result<Self, LinkError> {
        let (stream_port, datagram_port) = parse_ports(stream_port, datagram_port)?;
        let options = TransportOptions::new(config.label.clone());
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();

        let stream = match stream_port {
            Some(port) => {
                let addr = SocketAddr::new(ip, port);
                let transport = match &config.tls {
                    Some(tls) => StreamTransport::bind_secure(&options, addr, config.frame_config(), tls.clone())?,
                    None => StreamTransport::bind(&options, addr, config.frame_config())?,
                };
                let shared = transport.shared();
                transports.push(Box::new(transport));
                Some(shared)
            }
            None => None,
        };
        let datagram = match datagram_port {
            Some(port) => {
                let transport =
                    DatagramTransport::bind(&options, SocketAddr::new(ip, port), config.datagram_capacity)?
                        .with_connector_idle(config.connector_idle);
                let shared = transport.shared();
                transports.push(Box::new(transport));
                Some(shared)
            }
            None => None,
        };

        let listeners = Arc::new(ListenerRegistry::new());
        let state = Arc::new(ServerState {
            label: config.label.clone(),
            registry: HandshakeRegistry::new(
                config.label.clone(),
                config.game_name.clone(),
                config.version,
                (stream.is_some(), datagram.is_some()),
                options.ids.clone(),
                listeners.clone(),
            ),
            listeners,
            stream,
            datagram,
        });
        for core in state.cores() {
            wire_server(&state, core);
        }

        Ok(Self {
            config,
            state,
            filters: options.filters,
            idle: Mutex::new(transports),
            driver: Mutex::new(None),
            keep_alive: Arc::new(AtomicBool::new(true)),
            bound: AtomicBool::new(true),
        })
    }

    /// Spawn the driver with the configured loop delay.
    pub fn start(&self) -> Result<(), LinkError> {
        self.start_with_delay(self.config.loop_delay)
    }

    pub fn start_with_delay(&self, delay: Duration) -> Result<(), LinkError> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Err(LinkError::AlreadyRunning);
        }
        if !self.is_bound() {
            return Err(LinkError::NotBound);
        }
        let transports = std::mem::take(&mut *self.idle.lock());
        *driver = Some(driver::spawn(&self.config.label, transports, delay, self.keep_alive.clone())?);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|driver| !driver.is_stopped())
    }

    /// Send to every joined peer.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.broadcast_filtered(|_| true, envelope)
    }

    /// Send to every joined peer except `except`.
    pub fn broadcast_except(&self, except: &Peer, envelope: Envelope) -> Result<(), LinkError> {
        let skipped = except.client_id();
        self.broadcast_filtered(|peer| peer.client_id() != skipped, envelope)
    }

    /// Send to every joined peer for which `filter` returns `true`.
    pub fn broadcast_filtered(&self, filter: impl Fn(&Peer) -> bool, envelope: Envelope) -> Result<(), LinkError> {
        if !self.is_bound() {
            return Err(LinkError::NotBound);
        }
        self.state.broadcast(&envelope, &filter)
    }

    /// Send `peer` a kick notice and remove it.
    pub fn kick(&self, peer: &Arc<Peer>, reason: impl Into<String>) -> Result<(), LinkError> {
        peer.kick(reason)
    }

    /// Joined peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.registry.peers()
    }

    pub fn peer_by_player(&self, player_id: i64) -> Option<Arc<Peer>> {
        self.state.registry.peer_by_player(player_id)
    }

    /// Session-level listeners: joined peers and their messages.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.state.listeners
    }

    /// Filters consulted for every new connector on either transport.
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.state.stream.as_ref().and_then(|stream| stream.local_addr())
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.state.datagram.as_ref().map(|datagram| datagram.local_addr())
    }

    /// Tell every joined peer the server is going away, then shut down.
    ///
    /// A missing notice becomes a `Shutdown` with the default reason.
    pub fn stop(&self, notice: Option<Disconnect>) -> Result<(), LinkError> {
        if !self.bound.swap(false, Ordering::AcqRel) {
            return Err(LinkError::NotBound);
        }
        let mut notice = notice.unwrap_or_else(Disconnect::shutdown);
        if notice.reason.is_none() {
            notice.reason = Some(SHUTDOWN_REASON.to_string());
        }
        info!(
            "[{}] Stopping: {}",
            self.config.label,
            notice.reason.as_deref().unwrap_or(SHUTDOWN_REASON)
        );

        if let Err(e) = self
            .state
            .broadcast(&Envelope::reliable(Message::Disconnect(notice)), &|_: &Peer| true)
        {
            warn!("[{}] Shutdown notice failed: {e}", self.config.label);
        }
        if let Some(stream) = &self.state.stream {
            stream.enqueue_all();
        }
        if let Some(datagram) = &self.state.datagram {
            datagram.enqueue_all();
        }
        for core in self.state.cores() {
            core.wake();
        }

        let driver = self.driver.lock().take();
        match driver {
            // The loop's final drain still needs the registry.
            Some(driver) if driver.is_loop_thread() => {
                driver.stop();
                return Ok(());
            }
            Some(driver) => driver.stop(),
            None => {
                let mut transports = std::mem::take(&mut *self.idle.lock());
                driver::shut_down(&self.config.label, &mut transports);
            }
        }
        self.state.registry.clear();
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Correlation id: millisecond timestamp in the high bits, random low bits.
fn correlation_id() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default();
    (millis << 16) | i64::from(rand::random::<u16>())
}

struct ClientState {
    label: String,
    registration: ClientRegistration,
    ids: Arc<IdGenerator>,
    listeners: ListenerRegistry,
    stream: Option<Arc<StreamShared>>,
    datagram: Option<Arc<DatagramShared>>,
    server_datagram: Option<SocketAddr>,
    remote: RwLock<Option<Arc<Peer>>>,
    player_id: AtomicI64,
    registered: AtomicBool,
    keep_alive: Arc<AtomicBool>,
}

impl ClientState {
    fn remote(&self) -> Option<Arc<Peer>> {
        self.remote.read().clone()
    }

    /// Combine the connected stream leg with the datagram leg and announce
    /// ourselves on both.
    fn establish(&self, stream_view: Option<&Arc<Peer>>) {
        let datagram_leg = match (&self.datagram, self.server_datagram) {
            (Some(shared), Some(target)) => Some(DatagramLeg::new(target, shared.clone())),
            _ => None,
        };
        let remote = Peer::new(
            &self.ids,
            PeerRole::Remote,
            &self.label,
            stream_view.and_then(|view| view.stream_leg().cloned()),
            datagram_leg,
        );
        if let Some(stream) = &self.stream {
            stream.adopt(&remote);
        }
        if let Some(datagram) = &self.datagram {
            datagram.adopt(&remote);
        }
        *self.remote.write() = Some(remote.clone());
        self.listeners
            .fire_connection(&ConnectionEvent::Connected(remote.clone()));

        let registration = Message::Registration(self.registration.clone());
        if remote.has_leg(Leg::Datagram)
            && let Err(e) = remote.send(Envelope::unreliable(registration.clone()))
        {
            warn!("[{}] Datagram registration failed: {e}", self.label);
        }
        if remote.has_leg(Leg::Stream)
            && let Err(e) = remote.send(Envelope::reliable(registration))
        {
            warn!("[{}] Stream registration failed: {e}", self.label);
        }
        debug!("[{}] Registered as {}", self.label, self.registration.id);
    }

    fn on_message(&self, envelope: &Envelope) {
        match &envelope.message {
            Message::RegistrationAck(ack) => {
                self.player_id.store(ack.player_id, Ordering::Release);
                self.registered.store(true, Ordering::Release);
                if let Some(remote) = self.remote() {
                    remote.set_player_id(ack.player_id);
                }
                info!("[{}] Joined as player {}", self.label, ack.player_id);
            }
            Message::Disconnect(notice) => {
                info!(
                    "[{}] Server closed the session: {}",
                    self.label,
                    notice.reason.as_deref().unwrap_or("no reason")
                );
                self.listeners.fire_message(envelope);
                if let Some(remote) = self.remote() {
                    remote.enqueue_disconnect();
                }
            }
            _ => self.listeners.fire_message(envelope),
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(view) if view.role() == PeerRole::Remote => {
                if self.remote.read().is_none() {
                    self.establish(Some(view));
                }
            }
            ConnectionEvent::Connected(_) => {}
            ConnectionEvent::Disconnected(None) => {
                self.keep_alive.store(false, Ordering::Release);
                self.listeners
                    .fire_connection(&ConnectionEvent::Disconnected(None));
            }
            ConnectionEvent::Disconnected(Some(_)) => self.on_server_lost(),
        }
    }

    fn on_server_lost(&self) {
        let Some(remote) = self.remote.write().take() else {
            return;
        };
        remote.mark_disconnected();
        remote.enqueue_disconnect();
        self.registered.store(false, Ordering::Release);
        self.keep_alive.store(false, Ordering::Release);
        info!("[{}] Disconnected from server", self.label);
        self.listeners
            .fire_connection(&ConnectionEvent::Disconnected(Some(remote)));
    }
}

fn wire_client(state: &Arc<ClientState>, core: &TransportCore) {
    let weak: Weak<ClientState> = Arc::downgrade(state);
    core.listeners().add_error_listener(move |fault: &TransportFault| {
        if let Some(state) = weak.upgrade() {
            state.listeners.fire_error(fault);
        }
    });
    let weak: Weak<ClientState> = Arc::downgrade(state);
    core.listeners().add_message_listener(move |envelope: &Envelope| {
        if let Some(state) = weak.upgrade() {
            state.on_message(envelope);
        }
    });
    let weak: Weak<ClientState> = Arc::downgrade(state);
    core.listeners()
        .add_connection_listener(move |event: &ConnectionEvent| {
            if let Some(state) = weak.upgrade() {
                state.on_connection_event(event);
            }
        });
}

/// A connection to one server.
pub struct Client {
    config: SessionConfig,
    state: Arc<ClientState>,
    idle: Mutex<Vec<Box<dyn Transport>>>,
    driver: Mutex<Option<DriverHandle>>,
    closing: AtomicBool,
}

impl Client {
    /// Open both legs towards `host`. `-1` disables a side.
    ///
    /// Nothing is exchanged until [`Client::start`]; register listeners
    /// first.
    pub fn connect(
        config: SessionConfig,
        host: &str,
        stream_port: i32,
        datagram_port: i32,
    ) -> Result<Self, LinkError> {
        let (stream_port, datagram_port) = parse_ports(stream_port, datagram_port)?;
        let ip = (host, 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| LinkError::UnresolvedHost(host.to_string()))?;
        let options = TransportOptions::new(config.label.clone());
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();

        let stream = match stream_port {
            Some(port) => {
                let addr = SocketAddr::new(ip, port);
                let transport = match &config.tls {
                    Some(tls) => {
                        StreamTransport::connect_secure(&options, addr, config.frame_config(), tls.clone())?
                    }
                    None => StreamTransport::connect(&options, addr, config.frame_config())?,
                };
                let shared = transport.shared();
                transports.push(Box::new(transport));
                Some(shared)
            }
            None => None,
        };
        let server_datagram = datagram_port.map(|port| SocketAddr::new(ip, port));
        let datagram = match server_datagram {
            Some(target) => {
                let transport = DatagramTransport::connect(&options, target, config.datagram_capacity)?;
                let shared = transport.shared();
                transports.push(Box::new(transport));
                Some(shared)
            }
            None => None,
        };

        let state = Arc::new(ClientState {
            label: config.label.clone(),
            registration: ClientRegistration {
                id: correlation_id(),
                game_name: config.game_name.clone(),
                version: config.version,
            },
            ids: options.ids.clone(),
            listeners: ListenerRegistry::new(),
            stream,
            datagram,
            server_datagram,
            remote: RwLock::new(None),
            player_id: AtomicI64::new(UNASSIGNED_PLAYER),
            registered: AtomicBool::new(false),
            keep_alive: Arc::new(AtomicBool::new(true)),
        });
        if let Some(stream) = &state.stream {
            wire_client(&state, stream.core());
        }
        if let Some(datagram) = &state.datagram {
            wire_client(&state, datagram.core());
        }

        Ok(Self {
            config,
            state,
            idle: Mutex::new(transports),
            driver: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    /// Spawn the driver with the configured loop delay.
    pub fn start(&self) -> Result<(), LinkError> {
        self.start_with_delay(self.config.loop_delay)
    }

    pub fn start_with_delay(&self, delay: Duration) -> Result<(), LinkError> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Err(LinkError::AlreadyRunning);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(LinkError::NotConnected);
        }
        // Without a stream leg there is no connect event to wait for.
        if self.state.stream.is_none() {
            self.state.establish(None);
        }
        let transports = std::mem::take(&mut *self.idle.lock());
        *driver = Some(driver::spawn(
            &self.config.label,
            transports,
            delay,
            self.state.keep_alive.clone(),
        )?);
        Ok(())
    }

    /// The server, once connected.
    pub fn remote(&self) -> Option<Arc<Peer>> {
        self.state.remote()
    }

    pub fn is_connected(&self) -> bool {
        self.remote().is_some_and(|remote| remote.is_connected())
    }

    /// Whether the server acknowledged the handshake.
    pub fn is_registered(&self) -> bool {
        self.state.registered.load(Ordering::Acquire)
    }

    /// Player id assigned by the server, `-1` before the handshake.
    pub fn player_id(&self) -> i64 {
        self.state.player_id.load(Ordering::Acquire)
    }

    /// Id this client registers with.
    pub fn correlation_id(&self) -> i64 {
        self.state.registration.id
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.state.listeners
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.remote().ok_or(LinkError::NotConnected)?.send(envelope)
    }

    /// Leave with a `UserRequested` notice.
    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnect_with(Disconnect::user_requested())
    }

    /// Send `notice` on both legs, close them and stop the driver.
    pub fn disconnect_with(&self, notice: Disconnect) -> Result<(), LinkError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(remote) = self.remote() {
            let message = Message::Disconnect(notice);
            if remote.has_leg(Leg::Datagram)
                && let Err(e) = remote.send(Envelope::unreliable(message.clone()))
            {
                debug!("[{}] Datagram disconnect notice failed: {e}", self.config.label);
            }
            if remote.has_leg(Leg::Stream)
                && let Err(e) = remote.send(Envelope::reliable(message))
            {
                debug!("[{}] Stream disconnect notice failed: {e}", self.config.label);
            }
            remote.enqueue_disconnect();
        }

        let driver = self.driver.lock().take();
        match driver {
            Some(driver) => {
                self.state.keep_alive.store(false, Ordering::Release);
                driver.stop();
            }
            None => {
                let mut transports = std::mem::take(&mut *self.idle.lock());
                driver::shut_down(&self.config.label, &mut transports);
            }
        }
        Ok(())
    }

    /// Probe the local network for servers on datagram `port`.
    pub fn discover_hosts(port: u16, timeout: Duration) -> std::io::Result<Vec<IpAddr>> {
        crate::datagram::discover_hosts(port, timeout)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.stop();
        }
    }
}
