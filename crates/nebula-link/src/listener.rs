//! Listener registries, transport fault reports and connector filters.
//!
//! Message listeners are either global or keyed by [`MessageKind`]. On
//! receipt every global listener runs first, then the listeners registered
//! for the message's kind, each group in registration order. Registries
//! clone the listener handles out of their locks before invoking them, so a
//! listener may register or remove listeners from inside a callback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::messages::{Envelope, MessageKind};
use crate::peer::{Leg, Peer};

/// Handle returned on registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Connection lifecycle notification.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(Arc<Peer>),
    /// `None` when an outgoing connect attempt was refused.
    Disconnected(Option<Arc<Peer>>),
}

impl ConnectionEvent {
    pub fn peer(&self) -> Option<&Arc<Peer>> {
        match self {
            ConnectionEvent::Connected(peer) => Some(peer),
            ConnectionEvent::Disconnected(peer) => peer.as_ref(),
        }
    }
}

/// A read, write or connect failure on one leg.
///
/// The affected channel is already scheduled for disconnection when this is
/// reported.
#[derive(Debug, Clone)]
pub struct TransportFault {
    pub leg: Leg,
    /// `None` for socket-wide failures and refused connects.
    pub peer: Option<Arc<Peer>>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ConnectionListener: Send + Sync {
    fn on_connection_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_connection_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}

pub trait MessageListener: Send + Sync {
    fn message_received(&self, envelope: &Envelope);

    /// Called after a queued reliable message was handed to the socket.
    fn message_sent(&self, _envelope: &Envelope) {}
}

impl<F> MessageListener for F
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn message_received(&self, envelope: &Envelope) {
        self(envelope)
    }
}

pub trait ErrorListener: Send + Sync {
    fn on_error(&self, fault: &TransportFault);
}

impl<F> ErrorListener for F
where
    F: Fn(&TransportFault) + Send + Sync,
{
    fn on_error(&self, fault: &TransportFault) {
        self(fault)
    }
}

/// Decides whether an incoming connector may proceed.
///
/// Returning `Some(reason)` rejects the connector.
pub trait ConnectorFilter: Send + Sync {
    fn filter(&self, addr: &SocketAddr) -> Option<String>;
}

impl<F> ConnectorFilter for F
where
    F: Fn(&SocketAddr) -> Option<String> + Send + Sync,
{
    fn filter(&self, addr: &SocketAddr) -> Option<String> {
        self(addr)
    }
}

// ---------------------------------------------------------------------------
// ListenerRegistry
// ---------------------------------------------------------------------------

type Entries<T> = Vec<(ListenerId, Arc<T>)>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    connection: RwLock<Entries<dyn ConnectionListener>>,
    global: RwLock<Entries<dyn MessageListener>>,
    by_kind: RwLock<HashMap<MessageKind, Entries<dyn MessageListener>>>,
    errors: RwLock<Entries<dyn ErrorListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connection_listener<L: ConnectionListener + 'static>(&self, listener: L) -> ListenerId {
        let id = self.next_id();
        self.connection.write().push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for every message kind.
    pub fn add_message_listener<L: MessageListener + 'static>(&self, listener: L) -> ListenerId {
        let id = self.next_id();
        self.global.write().push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for one message kind.
    pub fn add_message_listener_for<L: MessageListener + 'static>(
        &self,
        kind: MessageKind,
        listener: L,
    ) -> ListenerId {
        let id = self.next_id();
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn add_error_listener<L: ErrorListener + 'static>(&self, listener: L) -> ListenerId {
        let id = self.next_id();
        self.errors.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener of any type. Returns `false` if the id was unknown.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = retain_except(&mut self.connection.write(), id);
        removed |= retain_except(&mut self.global.write(), id);
        removed |= retain_except(&mut self.errors.write(), id);
        let mut by_kind = self.by_kind.write();
        for entries in by_kind.values_mut() {
            removed |= retain_except(entries, id);
        }
        by_kind.retain(|_, entries| !entries.is_empty());
        removed
    }

    pub fn fire_connection(&self, event: &ConnectionEvent) {
        let listeners: Vec<_> = self.connection.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_connection_event(event);
        }
    }

    /// Deliver a received message: global listeners, then per-kind listeners.
    pub fn fire_message(&self, envelope: &Envelope) {
        for listener in self.message_listeners(envelope.kind()) {
            listener.message_received(envelope);
        }
    }

    pub fn fire_message_sent(&self, envelope: &Envelope) {
        for listener in self.message_listeners(envelope.kind()) {
            listener.message_sent(envelope);
        }
    }

    pub fn fire_error(&self, fault: &TransportFault) {
        let listeners: Vec<_> = self.errors.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_error(fault);
        }
    }

    fn message_listeners(&self, kind: MessageKind) -> Vec<Arc<dyn MessageListener>> {
        let mut listeners: Vec<_> = self.global.read().iter().map(|(_, l)| l.clone()).collect();
        if let Some(entries) = self.by_kind.read().get(&kind) {
            listeners.extend(entries.iter().map(|(_, l)| l.clone()));
        }
        listeners
    }
}

fn retain_except<T: ?Sized>(entries: &mut Entries<T>, id: ListenerId) -> bool {
    let before = entries.len();
    entries.retain(|(entry, _)| *entry != id);
    entries.len() != before
}

// ---------------------------------------------------------------------------
// FilterChain
// ---------------------------------------------------------------------------

/// Ordered list of connector filters; the first rejection wins.
#[derive(Default)]
pub struct FilterChain {
    next_id: AtomicU64,
    filters: RwLock<Entries<dyn ConnectorFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F: ConnectorFilter + 'static>(&self, filter: F) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.filters.write().push((id, Arc::new(filter)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        retain_except(&mut self.filters.write(), id)
    }

    /// Run the chain; returns the first rejection reason.
    pub fn check(&self, addr: &SocketAddr) -> Option<String> {
        let filters: Vec<_> = self.filters.read().iter().map(|(_, f)| f.clone()).collect();
        filters.iter().find_map(|filter| filter.filter(addr))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::messages::{Message, Ping};

    fn ping() -> Envelope {
        Envelope::reliable(Message::Ping(Ping {
            seq: 1,
            timestamp_ms: 0,
        }))
    }

    #[test]
    fn test_global_listeners_run_before_kind_listeners() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        registry.add_message_listener_for(MessageKind::Ping, move |_: &Envelope| {
            o.lock().unwrap().push("kind")
        });
        let o = order.clone();
        registry.add_message_listener(move |_: &Envelope| o.lock().unwrap().push("global"));

        registry.fire_message(&ping());
        assert_eq!(*order.lock().unwrap(), vec!["global", "kind"]);
    }

    #[test]
    fn test_kind_listener_ignores_other_kinds() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        registry.add_message_listener_for(MessageKind::Pong, move |_: &Envelope| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        registry.fire_message(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let id = registry.add_message_listener_for(MessageKind::Ping, move |_: &Envelope| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.fire_message(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let r = registry.clone();
        registry.add_message_listener(move |_: &Envelope| {
            r.add_message_listener(|_: &Envelope| {});
        });

        registry.fire_message(&ping());
        registry.fire_message(&ping());
    }

    #[test]
    fn test_connection_event_fires_in_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let s = seen.clone();
            registry.add_connection_listener(move |event: &ConnectionEvent| {
                assert!(event.peer().is_none());
                s.lock().unwrap().push(n);
            });
        }

        registry.fire_connection(&ConnectionEvent::Disconnected(None));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_error_listener_receives_fault() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = registry.add_error_listener(move |fault: &TransportFault| {
            s.lock().unwrap().push((fault.leg, fault.reason.clone()));
        });

        let fault = TransportFault {
            leg: Leg::Stream,
            peer: None,
            reason: "connection reset".to_string(),
        };
        registry.fire_error(&fault);
        assert!(registry.remove(id));
        registry.fire_error(&fault);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Leg::Stream, "connection reset".to_string())]
        );
    }

    #[test]
    fn test_first_rejecting_filter_wins() {
        let chain = FilterChain::new();
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        chain.add(|_: &SocketAddr| None);
        chain.add(|a: &SocketAddr| Some(format!("banned {}", a.ip())));
        chain.add(|_: &SocketAddr| Some("second".to_string()));

        assert_eq!(chain.check(&addr).as_deref(), Some("banned 10.0.0.1"));
    }

    #[test]
    fn test_empty_chain_accepts() {
        let chain = FilterChain::new();
        let id = chain.add(|_: &SocketAddr| Some("no".to_string()));
        assert!(chain.remove(id));
        assert_eq!(chain.check(&"127.0.0.1:1".parse().unwrap()), None);
    }
}
