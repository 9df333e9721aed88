//! Shared transport engine: multiplexer polling, fixed dispatch order and
//! deferred disconnection.
//!
//! A transport is split in two halves:
//!
//! - [`TransportCore`] is shared with caller threads (through the transport's
//!   `Arc`'d state and every [`Peer`] leg). It owns the listener registry,
//!   the filter chain, the waker and the sending ends of the disconnection
//!   and write-request queues.
//! - [`Engine`] stays on the loop thread. It owns the `mio` poll, its event
//!   buffer and the receiving ends of both queues.
//!
//! Each [`Transport::tick`] polls with a zero timeout, dispatches every ready
//! handle in the order read, accept, write, connect, expires idle handles,
//! and only then drains the disconnection queue.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, warn};

use crate::listener::{ConnectionEvent, FilterChain, ListenerRegistry, TransportFault};
use crate::peer::{IdGenerator, Leg, Peer};

/// Token reserved for the multiplexer's waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

/// Settings shared by every transport of one session.
#[derive(Clone)]
pub struct TransportOptions {
    pub label: String,
    pub ids: Arc<IdGenerator>,
    pub filters: Arc<FilterChain>,
}

impl TransportOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ids: Arc::new(IdGenerator::new()),
            filters: Arc::new(FilterChain::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportCore
// ---------------------------------------------------------------------------

pub struct TransportCore {
    name: String,
    label: String,
    leg: Leg,
    ids: Arc<IdGenerator>,
    listeners: ListenerRegistry,
    filters: Arc<FilterChain>,
    disconnects: Sender<Arc<Peer>>,
    writes: Sender<Token>,
    waker: Waker,
}

impl TransportCore {
    /// Open a multiplexer and build both halves of a transport.
    pub fn open(options: &TransportOptions, leg: Leg) -> io::Result<(TransportCore, Engine)> {
        let tag = match leg {
            Leg::Stream => "TCP",
            Leg::Datagram => "UDP",
        };
        let label = format!("{}][{tag}", options.label);
        let poll = Poll::new().inspect_err(|e| {
            error!("[{label}] Failed to open multiplexer: {e}");
        })?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (disconnect_tx, disconnect_rx) = unbounded();
        let (write_tx, write_rx) = unbounded();

        let core = TransportCore {
            name: options.label.clone(),
            label,
            leg,
            ids: options.ids.clone(),
            listeners: ListenerRegistry::new(),
            filters: options.filters.clone(),
            disconnects: disconnect_tx,
            writes: write_tx,
            waker,
        };
        let engine = Engine {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            disconnects: disconnect_rx,
            writes: write_rx,
        };
        Ok((core, engine))
    }

    /// Session name, used to label peers.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log prefix, e.g. `Server][TCP`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Run the filter chain for an incoming connector.
    pub fn should_filter(&self, addr: &SocketAddr) -> Option<String> {
        self.filters.check(addr)
    }

    /// Schedule `peer` for removal at the end of the next tick.
    pub fn enqueue_disconnect(&self, peer: Arc<Peer>) {
        if self.disconnects.send(peer).is_err() {
            debug!("[{}] Disconnect requested after shutdown", self.label);
        }
    }

    /// Tell error listeners about a failed read, write or connect.
    pub fn report_fault(&self, peer: Option<Arc<Peer>>, reason: impl Into<String>) {
        self.listeners.fire_error(&TransportFault {
            leg: self.leg,
            peer,
            reason: reason.into(),
        });
    }

    /// Ask the loop thread to flush the channel behind `token`.
    pub fn request_write(&self, token: Token) {
        if self.writes.send(token).is_ok() {
            self.wake();
        }
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!("[{}] Wake failed: {e}", self.label);
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Readiness of one handle for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub struct Engine {
    poll: Poll,
    events: Events,
    disconnects: Receiver<Arc<Peer>>,
    writes: Receiver<Token>,
}

impl Engine {
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Poll without blocking and merge pending write requests.
    pub fn poll_ready(&mut self) -> io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut ready: Vec<Ready> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed() || event.is_error(),
            })
            .collect();

        for token in self.writes.try_iter() {
            match ready.iter_mut().find(|r| r.token == token) {
                Some(r) => r.writable = true,
                None => ready.push(Ready {
                    token,
                    readable: false,
                    writable: true,
                }),
            }
        }
        Ok(ready)
    }

    pub fn next_disconnect(&self) -> Option<Arc<Peer>> {
        self.disconnects.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// What a ready token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A listening socket.
    Acceptor,
    /// An outgoing connection still in progress.
    Connecting,
    /// An established channel.
    Channel,
    Unknown,
}

/// A multiplexed transport driven by the session loop.
pub trait Transport: Send {
    fn core(&self) -> &TransportCore;

    fn engine(&mut self) -> &mut Engine;

    fn handle_kind(&self, token: Token) -> HandleKind;

    fn read(&mut self, token: Token);

    fn accept(&mut self, token: Token);

    fn write(&mut self, token: Token);

    fn connect(&mut self, token: Token);

    /// Remove the live instance matching `peer` and close its handle.
    ///
    /// Returns the instance that was live, which may be a different view of
    /// the same leg. `None` if nothing matched.
    fn release(&mut self, peer: &Arc<Peer>) -> Option<Arc<Peer>>;

    /// Schedule handles that have been idle too long for removal.
    fn expire(&mut self) {}

    /// Close every remaining handle.
    fn cleanup(&mut self);

    /// Run one loop iteration.
    fn tick(&mut self) {
        let ready = match self.engine().poll_ready() {
            Ok(ready) => ready,
            Err(e) => {
                warn!("[{}] Poll failed, skipping tick: {e}", self.core().label());
                return;
            }
        };

        for r in ready {
            let kind = self.handle_kind(r.token);
            if r.readable && kind == HandleKind::Channel {
                self.read(r.token);
            }
            if r.readable && kind == HandleKind::Acceptor {
                self.accept(r.token);
            }
            // A read may have closed the channel; re-check before writing.
            if r.writable && self.handle_kind(r.token) == HandleKind::Channel {
                self.write(r.token);
            }
            if r.writable && kind == HandleKind::Connecting {
                self.connect(r.token);
            }
        }

        self.expire();
        self.drain_disconnections();
    }

    /// Apply queued disconnections in FIFO order. Returns how many removed a
    /// live instance.
    fn drain_disconnections(&mut self) -> usize {
        let mut removed = 0;
        while let Some(peer) = self.engine().next_disconnect() {
            if let Some(live) = self.release(&peer) {
                removed += 1;
                debug!("[{}] Disconnected {}", self.core().label(), live.label());
                self.core()
                    .listeners()
                    .fire_connection(&ConnectionEvent::Disconnected(Some(live)));
            }
        }
        removed
    }
}
