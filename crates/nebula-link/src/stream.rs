//! Reliable stream transport (TCP), optionally secured with TLS.
//!
//! Each connection is a [`StreamChannel`]: a non-blocking socket, a frame
//! decoder, a staging buffer for bytes that did not fit one write, and the
//! ordered queue of reliable messages awaiting a writable event. All socket
//! I/O for a channel happens under its `io` lock, because direct sends come
//! from caller threads while queue flushes run on the loop thread. Lock order
//! is always `io`, then `queue`.
//!
//! Outgoing bytes take one of two paths:
//!
//! 1. **direct**: [`StreamShared::send_direct`] and
//!    [`StreamShared::broadcast`] frame the message and write it right away,
//!    staging whatever the socket did not take;
//! 2. **queued**: [`Peer::send`](crate::Peer::send) appends to the channel's
//!    queue and the loop flushes it. Queued frames are packed into a
//!    per-tick scratch buffer and written in one call; a per-frame cursor
//!    then decides which frames went out, which one was cut (its tail is
//!    staged) and which go back to the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::buffer::ByteBuffer;
use crate::error::LinkError;
use crate::framing::{FrameConfig, FrameDecoder, encode_frame, put_frame};
use crate::listener::ConnectionEvent;
use crate::messages::{Envelope, Message, decode_message, encode_message};
use crate::peer::{Leg, Peer, PeerRole, StreamLeg};
use crate::secure::{SecureChannel, SecureRead, TlsContext, TlsError};
use crate::transport::{Engine, HandleKind, Transport, TransportCore, TransportOptions};

/// Token of the listening socket.
const LISTENER: Token = Token(0);

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct ChannelIo {
    socket: TcpStream,
    staged: ByteBuffer,
    decoder: FrameDecoder,
    interest: Interest,
    tls: Option<SecureChannel>,
}

impl ChannelIo {
    fn has_pending_output(&self) -> bool {
        self.staged.position() > 0 || self.tls.as_ref().is_some_and(SecureChannel::wants_write)
    }

    fn set_interest(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.socket, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Write staged bytes. Returns `true` once the stage is empty.
    fn flush_staged(&mut self) -> io::Result<bool> {
        if self.staged.position() == 0 {
            return Ok(true);
        }
        self.staged.flip();
        let result = write_some(&mut self.socket, self.staged.chunk());
        if let Ok(written) = result {
            self.staged.advance(written);
        }
        let done = !self.staged.has_remaining();
        self.staged.compact();
        result.map(|_| done)
    }
}

/// Write as much of `bytes` as the socket takes without blocking.
fn write_some<W: Write>(socket: &mut W, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        match socket.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

enum ReadOutcome {
    Open,
    Closed,
    Failed(String),
}

enum DirectSend {
    Done,
    /// Bytes were staged; the loop must finish the write.
    Pending,
    /// The stage overflowed and was cleared.
    Overflow(usize),
    Closed,
    Failed(io::Error),
}

struct FlushReport {
    sent: Vec<Envelope>,
    error: Option<io::Error>,
}

pub struct StreamChannel {
    token: Token,
    remote: SocketAddr,
    io: Mutex<ChannelIo>,
    queue: Mutex<VecDeque<Envelope>>,
    closed: AtomicBool,
}

impl StreamChannel {
    fn new(
        token: Token,
        remote: SocketAddr,
        socket: TcpStream,
        frame: &FrameConfig,
        interest: Interest,
        tls: Option<SecureChannel>,
    ) -> Self {
        Self {
            token,
            remote,
            io: Mutex::new(ChannelIo {
                socket,
                staged: ByteBuffer::with_capacity(frame.buffer_capacity),
                decoder: FrameDecoder::new(frame),
                interest,
                tls,
            }),
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_secure(&self) -> bool {
        self.io.lock().tls.is_some()
    }

    /// Number of reliable messages waiting for a writable event.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Bytes written into the stage but not yet to the socket.
    pub fn staged(&self) -> usize {
        self.io.lock().staged.position()
    }

    pub(crate) fn enqueue(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }

    fn has_pending_output(&self) -> bool {
        self.io.lock().has_pending_output()
    }

    /// Read until the socket would block, collecting complete frame bodies.
    fn read_frames(&self, bodies: &mut Vec<Vec<u8>>) -> ReadOutcome {
        let mut guard = self.io.lock();
        let io = &mut *guard;

        if let Some(tls) = io.tls.as_mut() {
            let result = tls.read_into(&mut io.socket, &mut io.decoder, |decoder| {
                bodies.extend(decoder.decode().map_err(|e| TlsError::Io(io::Error::other(e)))?);
                Ok(())
            });
            return match result {
                Ok(SecureRead::Pending) => ReadOutcome::Open,
                Ok(SecureRead::Closed) => ReadOutcome::Closed,
                Err(e) => ReadOutcome::Failed(e.to_string()),
            };
        }

        loop {
            match io.socket.read(io.decoder.spare_capacity()) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    io.decoder.commit(n);
                    match io.decoder.decode() {
                        Ok(frames) => bodies.extend(frames),
                        Err(e) => return ReadOutcome::Failed(format!("protocol violation: {e}")),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return ReadOutcome::Failed(e.to_string()),
            }
        }
    }

    /// Write one framed message now, staging what the socket does not take.
    fn send_now(&self, frame: &[u8]) -> DirectSend {
        if self.is_closed() {
            return DirectSend::Closed;
        }
        let mut guard = self.io.lock();
        let io = &mut *guard;

        if let Some(tls) = io.tls.as_mut() {
            if let Err(e) = tls.write_plaintext(frame) {
                return DirectSend::Failed(e);
            }
            if tls.is_handshaking() {
                return DirectSend::Pending;
            }
            return match tls.flush(&mut io.socket) {
                Ok(true) => DirectSend::Done,
                Ok(false) => DirectSend::Pending,
                Err(e) => DirectSend::Failed(e),
            };
        }

        if io.staged.position() > 0 {
            return match io.staged.put_slice(frame) {
                Ok(()) => DirectSend::Pending,
                Err(_) => {
                    let lost = io.staged.position() + frame.len();
                    io.staged.clear();
                    DirectSend::Overflow(lost)
                }
            };
        }

        match write_some(&mut io.socket, frame) {
            Ok(n) if n == frame.len() => DirectSend::Done,
            Ok(n) => match io.staged.put_slice(&frame[n..]) {
                Ok(()) => DirectSend::Pending,
                Err(_) => DirectSend::Overflow(frame.len() - n),
            },
            Err(e) => DirectSend::Failed(e),
        }
    }

    /// Flush staged bytes and the reliable queue, then pick the interest
    /// set for what is left.
    fn flush(&self, registry: &Registry, scratch: &mut ByteBuffer, max_body: usize, label: &str) -> FlushReport {
        let mut guard = self.io.lock();
        let io = &mut *guard;
        let mut sent = Vec::new();

        let result = if io.tls.is_some() {
            self.flush_secure(io, max_body, label, &mut sent)
        } else {
            self.flush_plain(io, scratch, max_body, label, &mut sent)
        };

        let error = match result {
            Ok(()) => {
                let pending = io.has_pending_output() || !self.queue.lock().is_empty();
                let interest = if pending {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                io.set_interest(registry, self.token, interest).err()
            }
            Err(e) => Some(e),
        };
        FlushReport { sent, error }
    }

    fn flush_plain(
        &self,
        io: &mut ChannelIo,
        scratch: &mut ByteBuffer,
        max_body: usize,
        label: &str,
        sent: &mut Vec<Envelope>,
    ) -> io::Result<()> {
        loop {
            if !io.flush_staged()? {
                return Ok(());
            }

            // Pack as many queued frames as fit, remembering where each ends.
            scratch.clear();
            let mut batch = Vec::new();
            {
                let mut queue = self.queue.lock();
                while let Some(envelope) = queue.pop_front() {
                    let body = match encode_message(&envelope.message) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!("[{label}] Dropping queued message for {}: {e}", self.remote);
                            continue;
                        }
                    };
                    let start = scratch.position();
                    match put_frame(scratch, &body, max_body) {
                        Ok(true) => batch.push((envelope, start, scratch.position())),
                        Ok(false) => {
                            queue.push_front(envelope);
                            break;
                        }
                        Err(e) => warn!("[{label}] Dropping queued message for {}: {e}", self.remote),
                    }
                }
            }
            if batch.is_empty() {
                return Ok(());
            }

            scratch.flip();
            let total = scratch.remaining();
            let written = write_some(&mut io.socket, scratch.chunk());
            let written = match written {
                Ok(n) => n,
                Err(e) => {
                    self.requeue(batch.into_iter().map(|(envelope, _, _)| envelope).collect());
                    return Err(e);
                }
            };

            let mut unsent = Vec::new();
            for (envelope, start, end) in batch {
                if end <= written {
                    sent.push(envelope);
                } else if start < written {
                    // Cut mid-frame: the tail must follow before anything else.
                    if let Err(e) = io.staged.put_slice(&scratch.chunk()[written..end]) {
                        io.staged.clear();
                        return Err(io::Error::other(format!("frame tail does not fit the stage: {e}")));
                    }
                    sent.push(envelope);
                } else {
                    unsent.push(envelope);
                }
            }
            self.requeue(unsent);

            if written < total {
                return Ok(());
            }
        }
    }

    fn flush_secure(
        &self,
        io: &mut ChannelIo,
        max_body: usize,
        label: &str,
        sent: &mut Vec<Envelope>,
    ) -> io::Result<()> {
        let Some(tls) = io.tls.as_mut() else {
            return Ok(());
        };
        if tls.is_handshaking() {
            tls.drive(&mut io.socket).map_err(io::Error::other)?;
        }

        // Frames handed over during the handshake are buffered by the session.
        let queued: Vec<Envelope> = self.queue.lock().drain(..).collect();
        for envelope in queued {
            let frame = encode_message(&envelope.message)
                .map_err(|e| e.to_string())
                .and_then(|body| encode_frame(&body, max_body).map_err(|e| e.to_string()));
            match frame {
                Ok(frame) => {
                    tls.write_plaintext(&frame)?;
                    sent.push(envelope);
                }
                Err(e) => warn!("[{label}] Dropping queued message for {}: {e}", self.remote),
            }
        }
        tls.flush(&mut io.socket)?;
        Ok(())
    }

    fn requeue(&self, unsent: Vec<Envelope>) {
        if unsent.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for envelope in unsent.into_iter().rev() {
            queue.push_front(envelope);
        }
    }

    /// Close the socket once. Sends TLS close_notify when secured.
    fn close(&self, registry: &Registry) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.io.lock();
        let io = &mut *guard;
        if let Some(tls) = io.tls.as_mut() {
            tls.close(&mut io.socket);
        }
        let _ = registry.deregister(&mut io.socket);
        let _ = io.socket.shutdown(Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The part of a stream transport reachable from any thread.
pub struct StreamShared {
    core: TransportCore,
    frame: FrameConfig,
    peers: RwLock<HashMap<Token, Arc<Peer>>>,
    local_addr: Option<SocketAddr>,
}

impl StreamShared {
    pub fn core(&self) -> &TransportCore {
        &self.core
    }

    pub fn frame_config(&self) -> FrameConfig {
        self.frame
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer(&self, token: Token) -> Option<Arc<Peer>> {
        self.peers.read().get(&token).cloned()
    }

    /// Snapshot of the live peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Frame and write `message` on `channel` immediately.
    pub fn send_direct(&self, channel: &StreamChannel, message: &Message) -> Result<(), LinkError> {
        if let Some(frame) = self.frame_message(message)? {
            self.deliver(channel, &frame);
        }
        Ok(())
    }

    /// Write `message` to every joined peer accepted by `filter`.
    pub fn broadcast(&self, message: &Message, filter: &dyn Fn(&Peer) -> bool) -> Result<(), LinkError> {
        let Some(frame) = self.frame_message(message)? else {
            return Ok(());
        };
        for peer in self.peers() {
            if peer.role() == PeerRole::Connector || !filter(&peer) {
                continue;
            }
            if let Some(leg) = peer.stream_leg() {
                self.deliver(&leg.channel, &frame);
            }
        }
        Ok(())
    }

    /// Make `peer` the live instance for its stream channel.
    pub fn adopt(&self, peer: &Arc<Peer>) {
        let Some(leg) = peer.stream_leg() else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(&leg.transport), self) {
            return;
        }
        if let Some(live) = self.peers.write().get_mut(&leg.token()) {
            *live = peer.clone();
        }
    }

    /// Schedule every live peer for removal.
    pub fn enqueue_all(&self) {
        for peer in self.peers() {
            self.core.enqueue_disconnect(peer);
        }
    }

    fn frame_message(&self, message: &Message) -> Result<Option<Vec<u8>>, LinkError> {
        let body = encode_message(message)?;
        match encode_frame(&body, self.frame.max_body_len()) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                warn!("[{}] Dropping {:?} message: {e}", self.core.label(), message.kind());
                Ok(None)
            }
        }
    }

    fn deliver(&self, channel: &StreamChannel, frame: &[u8]) {
        match channel.send_now(frame) {
            DirectSend::Done | DirectSend::Closed => {}
            DirectSend::Pending => self.core.request_write(channel.token()),
            DirectSend::Overflow(lost) => {
                let reason = format!("send buffer overflow, discarded {lost} bytes");
                warn!("[{}] {reason} for {}", self.core.label(), channel.remote_addr());
                self.fail_channel(channel, reason);
            }
            DirectSend::Failed(e) => {
                warn!("[{}] Write to {} failed: {e}", self.core.label(), channel.remote_addr());
                self.fail_channel(channel, format!("write failed: {e}"));
            }
        }
    }

    fn fail_channel(&self, channel: &StreamChannel, reason: String) {
        let peer = self.peer(channel.token());
        if let Some(peer) = &peer {
            self.core.enqueue_disconnect(peer.clone());
        }
        self.core.report_fault(peer, reason);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

struct Connecting {
    socket: TcpStream,
    remote: SocketAddr,
}

/// Loop-side half of a stream transport.
pub struct StreamTransport {
    shared: Arc<StreamShared>,
    engine: Engine,
    listener: Option<TcpListener>,
    connecting: HashMap<Token, Connecting>,
    scratch: ByteBuffer,
    tls: Option<TlsContext>,
    next_token: usize,
}

impl StreamTransport {
    /// Listen for connectors on `addr`.
    pub fn bind(options: &TransportOptions, addr: SocketAddr, frame: FrameConfig) -> Result<Self, LinkError> {
        Self::bind_with(options, addr, frame, None)
    }

    /// Listen for connectors on `addr` and secure every accepted channel.
    pub fn bind_secure(
        options: &TransportOptions,
        addr: SocketAddr,
        frame: FrameConfig,
        tls: TlsContext,
    ) -> Result<Self, LinkError> {
        if !tls.is_server() {
            return Err(TlsError::RoleMismatch.into());
        }
        Self::bind_with(options, addr, frame, Some(tls))
    }

    fn bind_with(
        options: &TransportOptions,
        addr: SocketAddr,
        frame: FrameConfig,
        tls: Option<TlsContext>,
    ) -> Result<Self, LinkError> {
        let (core, engine) = TransportCore::open(options, Leg::Stream)?;
        let mut listener = TcpListener::bind(addr).inspect_err(|e| {
            error!("[{}] Failed to listen on {addr}: {e}", core.label());
        })?;
        engine
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;
        info!("[{}] Listening on {local_addr}", core.label());

        let mut transport = Self::assemble(core, engine, frame, Some(local_addr), tls);
        transport.listener = Some(listener);
        Ok(transport)
    }

    /// Start a non-blocking connection to `addr`.
    pub fn connect(options: &TransportOptions, addr: SocketAddr, frame: FrameConfig) -> Result<Self, LinkError> {
        Self::connect_with(options, addr, frame, None)
    }

    /// Start a non-blocking connection to `addr`, secured once established.
    pub fn connect_secure(
        options: &TransportOptions,
        addr: SocketAddr,
        frame: FrameConfig,
        tls: TlsContext,
    ) -> Result<Self, LinkError> {
        if tls.is_server() {
            return Err(TlsError::RoleMismatch.into());
        }
        Self::connect_with(options, addr, frame, Some(tls))
    }

    fn connect_with(
        options: &TransportOptions,
        addr: SocketAddr,
        frame: FrameConfig,
        tls: Option<TlsContext>,
    ) -> Result<Self, LinkError> {
        let (core, engine) = TransportCore::open(options, Leg::Stream)?;
        let mut socket = TcpStream::connect(addr)?;
        let local_addr = socket.local_addr().ok();

        let mut transport = Self::assemble(core, engine, frame, local_addr, tls);
        let token = transport.allocate_token();
        transport
            .engine
            .registry()
            .register(&mut socket, token, Interest::WRITABLE)?;
        transport.connecting.insert(token, Connecting { socket, remote: addr });
        debug!("[{}] Connecting to {addr}", transport.shared.core.label());
        Ok(transport)
    }

    fn assemble(
        core: TransportCore,
        engine: Engine,
        frame: FrameConfig,
        local_addr: Option<SocketAddr>,
        tls: Option<TlsContext>,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                core,
                frame,
                peers: RwLock::new(HashMap::new()),
                local_addr,
            }),
            engine,
            listener: None,
            connecting: HashMap::new(),
            scratch: ByteBuffer::with_capacity(frame.buffer_capacity),
            tls,
            next_token: LISTENER.0 + 1,
        }
    }

    pub fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn new_tls_channel(&self) -> Result<Option<SecureChannel>, TlsError> {
        self.tls.as_ref().map(TlsContext::new_channel).transpose()
    }

    fn admit(&mut self, mut socket: TcpStream, addr: SocketAddr) {
        let label = self.shared.core.label().to_string();
        if let Some(reason) = self.shared.core.should_filter(&addr) {
            info!("[{label}] Rejected connector {addr}: {reason}");
            return;
        }
        if let Err(e) = socket.set_nodelay(true) {
            debug!("[{label}] Could not set TCP_NODELAY for {addr}: {e}");
        }
        let tls = match self.new_tls_channel() {
            Ok(tls) => tls,
            Err(e) => {
                warn!("[{label}] Could not start TLS for {addr}: {e}");
                return;
            }
        };
        let token = self.allocate_token();
        if let Err(e) = self
            .engine
            .registry()
            .register(&mut socket, token, Interest::READABLE)
        {
            warn!("[{label}] Could not register {addr}: {e}");
            return;
        }

        let channel = Arc::new(StreamChannel::new(
            token,
            addr,
            socket,
            &self.shared.frame,
            Interest::READABLE,
            tls,
        ));
        let peer = Peer::new(
            self.shared.core.ids(),
            PeerRole::Connector,
            self.shared.core.name(),
            Some(StreamLeg::new(channel, self.shared.clone())),
            None,
        );
        self.shared.peers.write().insert(token, peer.clone());
        debug!("[{label}] Accepted {} from {addr}", peer.label());
        self.shared
            .core
            .listeners()
            .fire_connection(&ConnectionEvent::Connected(peer));
    }

    fn fail_connect(&mut self, mut pending: Connecting, reason: io::Error) {
        warn!(
            "[{}] Connect to {} failed: {reason}",
            self.shared.core.label(),
            pending.remote
        );
        let _ = self.engine.registry().deregister(&mut pending.socket);
        self.shared
            .core
            .report_fault(None, format!("connect to {} failed: {reason}", pending.remote));
        self.shared
            .core
            .listeners()
            .fire_connection(&ConnectionEvent::Disconnected(None));
    }
}

impl Transport for StreamTransport {
    fn core(&self) -> &TransportCore {
        &self.shared.core
    }

    fn engine(&mut self) -> &mut Engine {
        &mut self.engine
    }

    fn handle_kind(&self, token: Token) -> HandleKind {
        if token == LISTENER && self.listener.is_some() {
            HandleKind::Acceptor
        } else if self.connecting.contains_key(&token) {
            HandleKind::Connecting
        } else if self.shared.peers.read().contains_key(&token) {
            HandleKind::Channel
        } else {
            HandleKind::Unknown
        }
    }

    fn read(&mut self, token: Token) {
        let Some(peer) = self.shared.peer(token) else {
            return;
        };
        let Some(channel) = peer.stream_leg().map(|leg| leg.channel.clone()) else {
            return;
        };

        let mut bodies = Vec::new();
        let outcome = channel.read_frames(&mut bodies);

        let label = self.shared.core.label();
        for body in bodies {
            match decode_message(&body) {
                Ok(message) => {
                    // A listener may have adopted a joined view meanwhile.
                    let source = self.shared.peer(token).unwrap_or_else(|| peer.clone());
                    let envelope = Envelope::received(message, source, Leg::Stream);
                    self.shared.core.listeners().fire_message(&envelope);
                }
                Err(e) => warn!("[{label}] Dropping undecodable frame from {}: {e}", channel.remote_addr()),
            }
        }

        match outcome {
            ReadOutcome::Open => {
                if channel.is_secure() && channel.has_pending_output() {
                    self.shared.core.request_write(token);
                }
            }
            ReadOutcome::Closed => {
                debug!("[{label}] {} closed the connection", channel.remote_addr());
                self.shared.core.enqueue_disconnect(peer);
            }
            ReadOutcome::Failed(reason) => {
                warn!("[{label}] Read from {} failed: {reason}", channel.remote_addr());
                self.shared.core.enqueue_disconnect(peer.clone());
                self.shared
                    .core
                    .report_fault(Some(peer), format!("read failed: {reason}"));
            }
        }
    }

    fn accept(&mut self, _token: Token) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((socket, addr)) => self.admit(socket, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("[{}] Accept failed: {e}", self.shared.core.label());
                    return;
                }
            }
        }
    }

    fn write(&mut self, token: Token) {
        let Some(peer) = self.shared.peer(token) else {
            return;
        };
        let Some(channel) = peer.stream_leg().map(|leg| leg.channel.clone()) else {
            return;
        };
        let report = channel.flush(
            self.engine.registry(),
            &mut self.scratch,
            self.shared.frame.max_body_len(),
            self.shared.core.label(),
        );
        for envelope in &report.sent {
            self.shared.core.listeners().fire_message_sent(envelope);
        }
        if let Some(e) = report.error {
            warn!(
                "[{}] Write to {} failed: {e}",
                self.shared.core.label(),
                channel.remote_addr()
            );
            self.shared.core.enqueue_disconnect(peer.clone());
            self.shared
                .core
                .report_fault(Some(peer), format!("write failed: {e}"));
        }
    }

    fn connect(&mut self, token: Token) {
        let Some(mut pending) = self.connecting.remove(&token) else {
            return;
        };
        match pending.socket.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return self.fail_connect(pending, e),
        }
        match pending.socket.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                self.connecting.insert(token, pending);
                return;
            }
            Err(e) => return self.fail_connect(pending, e),
        }

        let label = self.shared.core.label().to_string();
        if let Err(e) = pending.socket.set_nodelay(true) {
            debug!("[{label}] Could not set TCP_NODELAY: {e}");
        }
        let tls = match self.new_tls_channel() {
            Ok(tls) => tls,
            Err(e) => return self.fail_connect(pending, io::Error::other(e)),
        };
        let interest = Interest::READABLE | Interest::WRITABLE;
        if let Err(e) = self
            .engine
            .registry()
            .reregister(&mut pending.socket, token, interest)
        {
            return self.fail_connect(pending, e);
        }

        let Connecting { socket, remote } = pending;
        let channel = Arc::new(StreamChannel::new(
            token,
            remote,
            socket,
            &self.shared.frame,
            interest,
            tls,
        ));
        let peer = Peer::new(
            self.shared.core.ids(),
            PeerRole::Remote,
            self.shared.core.name(),
            Some(StreamLeg::new(channel, self.shared.clone())),
            None,
        );
        self.shared.peers.write().insert(token, peer.clone());
        info!("[{label}] Connected to {remote}");
        self.shared
            .core
            .listeners()
            .fire_connection(&ConnectionEvent::Connected(peer));
    }

    fn release(&mut self, peer: &Arc<Peer>) -> Option<Arc<Peer>> {
        let leg = peer.stream_leg()?;
        if !Arc::ptr_eq(&leg.transport, &self.shared) {
            return None;
        }
        let live = self.shared.peers.write().remove(&leg.token())?;
        let channel = leg.channel.clone();

        // Best effort: a kick notice queued just before removal still goes out.
        let _ = channel.flush(
            self.engine.registry(),
            &mut self.scratch,
            self.shared.frame.max_body_len(),
            self.shared.core.label(),
        );
        channel.close(self.engine.registry());
        peer.mark_disconnected();
        live.mark_disconnected();
        Some(live)
    }

    fn cleanup(&mut self) {
        let registry = self.engine.registry();
        if let Some(mut listener) = self.listener.take() {
            let _ = registry.deregister(&mut listener);
        }
        for (_, mut pending) in self.connecting.drain() {
            let _ = registry.deregister(&mut pending.socket);
        }
        let peers: Vec<_> = self.shared.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            if let Some(leg) = peer.stream_leg() {
                leg.channel.close(registry);
            }
            peer.mark_disconnected();
        }
        debug!("[{}] Closed", self.shared.core.label());
    }
}
