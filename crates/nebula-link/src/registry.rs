//! Server-side handshake correlation.
//!
//! A client announces itself with the same [`ClientRegistration`] on each of
//! its legs. The first copy waits in a pending table keyed by the
//! registration id; its twin arriving on the other leg produces a single
//! `Joined` peer that owns both legs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::listener::{ConnectionEvent, ListenerRegistry};
use crate::messages::ClientRegistration;
use crate::peer::{ClientId, IdGenerator, Leg, Peer, PeerRole};

/// Result of feeding one registration to the registry.
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    /// Waiting for the same registration on the other leg.
    Pending,
    /// Both legs are correlated; the new peer is live.
    Joined(Arc<Peer>),
    /// The id already belongs to a joined peer.
    Duplicate,
    /// Game name or version does not match this server.
    Rejected(String),
    /// Protocol violation; the pending entry was dropped.
    Discarded,
}

struct PendingRegistration {
    connector: Arc<Peer>,
    leg: Leg,
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<i64, PendingRegistration>,
    joined: HashMap<i64, Arc<Peer>>,
    /// Joined peers and both of their connectors, by client id.
    owners: HashMap<ClientId, i64>,
}

pub struct HandshakeRegistry {
    label: String,
    game_name: String,
    version: u32,
    stream_enabled: bool,
    datagram_enabled: bool,
    ids: Arc<IdGenerator>,
    listeners: Arc<ListenerRegistry>,
    state: Mutex<RegistryState>,
}

impl HandshakeRegistry {
    pub fn new(
        label: impl Into<String>,
        game_name: impl Into<String>,
        version: u32,
        legs: (bool, bool),
        ids: Arc<IdGenerator>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            label: label.into(),
            game_name: game_name.into(),
            version,
            stream_enabled: legs.0,
            datagram_enabled: legs.1,
            ids,
            listeners,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn leg_enabled(&self, leg: Leg) -> bool {
        match leg {
            Leg::Stream => self.stream_enabled,
            Leg::Datagram => self.datagram_enabled,
        }
    }

    fn validate(&self, registration: &ClientRegistration) -> Result<(), String> {
        if registration.game_name != self.game_name {
            return Err(format!(
                "Game name mismatch: server runs \"{}\", client runs \"{}\"",
                self.game_name, registration.game_name
            ));
        }
        if registration.version != self.version {
            return Err(format!(
                "Version mismatch: server is {}, client is {}",
                self.version, registration.version
            ));
        }
        Ok(())
    }

    /// Feed a registration that `connector` sent over `leg`.
    ///
    /// Fires `Connected` on the session listeners when a peer joins.
    pub fn register(
        &self,
        registration: &ClientRegistration,
        connector: &Arc<Peer>,
        leg: Leg,
    ) -> RegistrationOutcome {
        if let Err(reason) = self.validate(registration) {
            info!("[{}] Rejected {}: {reason}", self.label, connector.label());
            return RegistrationOutcome::Rejected(reason);
        }

        let id = registration.id;
        let joined = {
            let mut state = self.state.lock();
            if state.joined.contains_key(&id) {
                debug!("[{}] Ignoring repeated registration {id}", self.label);
                return RegistrationOutcome::Duplicate;
            }

            let both_legs = self.stream_enabled && self.datagram_enabled;
            let (stream_side, datagram_side) = if !both_legs {
                if !self.leg_enabled(leg) {
                    warn!("[{}] Registration {id} arrived on disabled {leg:?} leg", self.label);
                    return RegistrationOutcome::Discarded;
                }
                match leg {
                    Leg::Stream => (Some(connector.clone()), None),
                    Leg::Datagram => (None, Some(connector.clone())),
                }
            } else {
                let Some(first) = state.pending.remove(&id) else {
                    debug!("[{}] Registration {id} pending on {leg:?}", self.label);
                    state.pending.insert(
                        id,
                        PendingRegistration {
                            connector: connector.clone(),
                            leg,
                        },
                    );
                    return RegistrationOutcome::Pending;
                };
                if first.leg == leg {
                    warn!(
                        "[{}] Protocol violation: registration {id} arrived twice on {leg:?}, discarding",
                        self.label
                    );
                    return RegistrationOutcome::Discarded;
                }
                match leg {
                    Leg::Stream => (Some(connector.clone()), Some(first.connector)),
                    Leg::Datagram => (Some(first.connector), Some(connector.clone())),
                }
            };

            let peer = Peer::new(
                &self.ids,
                PeerRole::Joined,
                &self.label,
                stream_side.as_ref().and_then(|c| c.stream_leg().cloned()),
                datagram_side.as_ref().and_then(|c| c.datagram_leg().cloned()),
            );
            peer.set_player_id(id);
            for side in stream_side.iter().chain(datagram_side.iter()) {
                side.set_player_id(id);
                state.owners.insert(side.client_id(), id);
            }
            state.owners.insert(peer.client_id(), id);
            state.joined.insert(id, peer.clone());
            peer
        };

        info!("[{}] {} joined as player {id}", self.label, joined.label());
        self.listeners
            .fire_connection(&ConnectionEvent::Connected(joined.clone()));
        RegistrationOutcome::Joined(joined)
    }

    /// Forget everything tied to a peer one of whose legs went away.
    ///
    /// Returns the joined peer that was removed, after firing its single
    /// `Disconnected` on the session listeners.
    pub fn on_leg_disconnected(&self, peer: &Arc<Peer>) -> Option<Arc<Peer>> {
        let removed = {
            let mut state = self.state.lock();
            state
                .pending
                .retain(|_, pending| pending.connector.client_id() != peer.client_id());

            let id = state.owners.remove(&peer.client_id())?;
            let joined = state.joined.remove(&id)?;
            state.owners.retain(|_, owner| *owner != id);
            joined
        };

        removed.mark_disconnected();
        info!("[{}] Player {} left", self.label, removed.player_id());
        self.listeners
            .fire_connection(&ConnectionEvent::Disconnected(Some(removed.clone())));
        Some(removed)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.lock().joined.values().cloned().collect()
    }

    pub fn peer_by_player(&self, player_id: i64) -> Option<Arc<Peer>> {
        self.state.lock().joined.get(&player_id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drop all state without firing events.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.joined.clear();
        state.owners.clear();
    }
}
