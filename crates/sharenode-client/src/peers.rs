//! Peer registry
//!
//! Tracks connected [`SecurePeer`]s by transport peer id. A peer removes
//! itself from the registry when it disconnects; every removal is announced
//! as [`PeerEvent::Removed`], which the node uses to cancel that peer's
//! transfers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sharenode_core::PeerId;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use crate::peer::SecurePeer;

/// Capacity of registry notification channels
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Added(PeerId),
    Removed(PeerId),
}

type PeerMap = DashMap<PeerId, Arc<SecurePeer>>;

/// The peer registry, shared between the node and its handlers
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<PeerMap>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Register a peer. Returns false and changes nothing if the id is taken.
    ///
    /// A peer that is already disconnected is announced and removed again, and
    /// false is returned.
    pub fn add(&self, peer: Arc<SecurePeer>) -> bool {
        let id = peer.id();
        match self.peers.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!(peer = %id, "peer already registered");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
            }
        }
        tracing::debug!(peer = %id, endpoint = %peer.endpoint(), "peer registered");
        let _ = self.events.send(PeerEvent::Added(id));

        let peers = Arc::downgrade(&self.peers);
        let events = self.events.clone();
        peer.on_disconnect(Box::new(move |id| {
            remove_from(&peers, &events, id);
        }));

        // A disconnect before the hook was installed had nothing to run
        if peer.is_disconnected() {
            self.remove(id);
            return false;
        }
        true
    }

    /// Unregister a peer. Removing an unknown id is a no-op.
    pub fn remove(&self, id: PeerId) -> Option<Arc<SecurePeer>> {
        remove_from(&Arc::downgrade(&self.peers), &self.events, id)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<SecurePeer>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Every registered peer, handshake complete or not
    pub fn all(&self) -> Vec<Arc<SecurePeer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Peers whose secure session is up, oldest connection first
    pub fn list_established(&self) -> Vec<Arc<SecurePeer>> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_enabled())
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by_key(|peer| (peer.connected_at(), peer.id()));
        peers
    }

    pub fn is_connected_to_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().endpoint() == endpoint)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

fn remove_from(
    peers: &Weak<PeerMap>,
    events: &broadcast::Sender<PeerEvent>,
    id: PeerId,
) -> Option<Arc<SecurePeer>> {
    let peers = peers.upgrade()?;
    let (_, peer) = peers.remove(&id)?;
    peer.clear_disconnect_hook();

    tracing::debug!(peer = %id, "peer unregistered");
    let _ = events.send(PeerEvent::Removed(id));
    Some(peer)
}
