//! Transport abstraction over a multiplexed datagram connection layer
//!
//! The node only needs three things from the transport: per-peer, per-channel
//! ordered delivery of byte payloads, connect/disconnect/receive lifecycle
//! events, and a way to send a payload to a peer on a channel. Connection
//! establishment, retransmission and liveness belong to the transport.

use crate::{PeerId, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Delivery guarantee requested for an outbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    ReliableOrdered,
    Unreliable,
}

/// Why a peer went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection
    RemoteClosed,
    /// We closed the connection
    LocalClose,
    /// No traffic within the transport's liveness window
    Timeout,
    /// The remote side refused our connection key
    ConnectionRejected,
    /// Nobody is listening at the endpoint
    Unreachable,
}

/// An inbound connection attempt, accepted or refused with [`Transport::accept_if_key`]
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub id: u64,
    pub endpoint: SocketAddr,
    pub key: String,
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Lifecycle and data events drained from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionRequest(ConnectionRequest),
    PeerConnected {
        peer: PeerId,
        endpoint: SocketAddr,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    Received {
        peer: PeerId,
        channel: u8,
        data: Vec<u8>,
    },
}

/// Transport trait for the datagram connection layer
///
/// All methods are non-blocking: sends are queued, events are drained by
/// polling. This allows for:
/// - A real UDP transport in production
/// - The in-memory [`mock::MockNetwork`] for tests and demos
pub trait Transport: Send + Sync {
    /// Our own network endpoint
    fn local_endpoint(&self) -> SocketAddr;

    /// Start connecting to a remote endpoint, presenting `key`.
    ///
    /// Returns the id the peer will carry in later events.
    fn connect(&self, endpoint: SocketAddr, key: &str) -> Result<PeerId>;

    /// Accept an inbound request if it presents `key`, refuse it otherwise
    fn accept_if_key(&self, request: &ConnectionRequest, key: &str) -> bool;

    /// Queue a payload for a connected peer on a channel
    fn send(&self, peer: PeerId, data: Vec<u8>, channel: u8, delivery: Delivery) -> Result<()>;

    /// Close a connection. Both sides observe `PeerDisconnected`.
    fn disconnect(&self, peer: PeerId);

    /// Drain pending events in arrival order
    fn poll_events(&self) -> Vec<TransportEvent>;
}

/// A shareable transport handle
pub type TransportHandle = Arc<dyn Transport>;

pub mod mock {
    //! In-memory transport for testing and development
    //!
    //! A [`MockNetwork`] connects any number of [`MockTransport`]s by endpoint.
    //! Delivery is lossless and ordered unless a drop rule is installed with
    //! [`MockTransport::drop_next`].

    use super::*;
    use crate::{lock, Error, CHANNEL_COUNT};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct NodeState {
        queue: VecDeque<TransportEvent>,
        /// local peer id -> (remote endpoint, remote side's id for us)
        links: HashMap<PeerId, (SocketAddr, PeerId)>,
        next_peer: u32,
        /// channel -> number of upcoming sends to drop
        drops: HashMap<u8, usize>,
        sent: Vec<(PeerId, u8, usize)>,
    }

    impl NodeState {
        fn allocate_peer(&mut self) -> PeerId {
            self.next_peer += 1;
            PeerId(self.next_peer)
        }
    }

    struct PendingConnect {
        from: SocketAddr,
        from_peer: PeerId,
        to: SocketAddr,
    }

    #[derive(Default)]
    struct NetworkState {
        nodes: HashMap<SocketAddr, NodeState>,
        pending: HashMap<u64, PendingConnect>,
        next_request: u64,
    }

    /// A set of in-memory transports addressable by endpoint
    #[derive(Clone, Default)]
    pub struct MockNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    impl MockNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a transport listening at `endpoint`
        pub fn transport(&self, endpoint: SocketAddr) -> Arc<MockTransport> {
            lock(&self.state).nodes.entry(endpoint).or_default();
            Arc::new(MockTransport {
                network: self.clone(),
                endpoint,
            })
        }
    }

    /// One endpoint on a [`MockNetwork`]
    pub struct MockTransport {
        network: MockNetwork,
        endpoint: SocketAddr,
    }

    impl MockTransport {
        /// Silently drop the next `count` payloads sent on `channel`
        pub fn drop_next(&self, channel: u8, count: usize) {
            let mut state = lock(&self.network.state);
            if let Some(node) = state.nodes.get_mut(&self.endpoint) {
                node.drops.insert(channel, count);
            }
        }

        /// Every payload handed to `send`, as (peer, channel, length)
        pub fn sent(&self) -> Vec<(PeerId, u8, usize)> {
            lock(&self.network.state)
                .nodes
                .get(&self.endpoint)
                .map(|node| node.sent.clone())
                .unwrap_or_default()
        }

        /// Whether a link to `peer` is currently open
        pub fn is_linked(&self, peer: PeerId) -> bool {
            lock(&self.network.state)
                .nodes
                .get(&self.endpoint)
                .is_some_and(|node| node.links.contains_key(&peer))
        }
    }

    impl Transport for MockTransport {
        fn local_endpoint(&self) -> SocketAddr {
            self.endpoint
        }

        fn connect(&self, endpoint: SocketAddr, key: &str) -> Result<PeerId> {
            let mut state = lock(&self.network.state);
            let state = &mut *state;

            let local = state
                .nodes
                .get_mut(&self.endpoint)
                .ok_or_else(|| Error::ConnectionFailed("transport not registered".to_string()))?;
            let from_peer = local.allocate_peer();

            let Some(remote) = state.nodes.get_mut(&endpoint) else {
                if let Some(local) = state.nodes.get_mut(&self.endpoint) {
                    local.queue.push_back(TransportEvent::PeerDisconnected {
                        peer: from_peer,
                        reason: DisconnectReason::Unreachable,
                    });
                }
                return Ok(from_peer);
            };

            state.next_request += 1;
            let id = state.next_request;
            remote
                .queue
                .push_back(TransportEvent::ConnectionRequest(ConnectionRequest {
                    id,
                    endpoint: self.endpoint,
                    key: key.to_string(),
                }));
            state.pending.insert(
                id,
                PendingConnect {
                    from: self.endpoint,
                    from_peer,
                    to: endpoint,
                },
            );
            Ok(from_peer)
        }

        fn accept_if_key(&self, request: &ConnectionRequest, key: &str) -> bool {
            let mut state = lock(&self.network.state);
            let state = &mut *state;

            let Some(pending) = state.pending.remove(&request.id) else {
                return false;
            };
            if pending.to != self.endpoint {
                return false;
            }

            if request.key != key {
                if let Some(initiator) = state.nodes.get_mut(&pending.from) {
                    initiator.queue.push_back(TransportEvent::PeerDisconnected {
                        peer: pending.from_peer,
                        reason: DisconnectReason::ConnectionRejected,
                    });
                }
                return false;
            }

            let Some(local) = state.nodes.get_mut(&self.endpoint) else {
                return false;
            };
            let local_peer = local.allocate_peer();
            local.links.insert(local_peer, (pending.from, pending.from_peer));
            local.queue.push_back(TransportEvent::PeerConnected {
                peer: local_peer,
                endpoint: pending.from,
            });

            if let Some(initiator) = state.nodes.get_mut(&pending.from) {
                initiator
                    .links
                    .insert(pending.from_peer, (self.endpoint, local_peer));
                initiator.queue.push_back(TransportEvent::PeerConnected {
                    peer: pending.from_peer,
                    endpoint: self.endpoint,
                });
            }
            true
        }

        fn send(&self, peer: PeerId, data: Vec<u8>, channel: u8, _delivery: Delivery) -> Result<()> {
            if channel >= CHANNEL_COUNT {
                return Err(Error::SendFailed(format!("no such channel {}", channel)));
            }

            let mut state = lock(&self.network.state);
            let local = state
                .nodes
                .get_mut(&self.endpoint)
                .ok_or_else(|| Error::SendFailed("transport not registered".to_string()))?;
            let (remote_endpoint, remote_peer) = *local
                .links
                .get(&peer)
                .ok_or_else(|| Error::SendFailed(format!("peer {} not connected", peer)))?;

            local.sent.push((peer, channel, data.len()));
            if let Some(count) = local.drops.get_mut(&channel) {
                if *count > 0 {
                    *count -= 1;
                    tracing::debug!(peer = %peer, channel, "mock network dropped payload");
                    return Ok(());
                }
            }

            if let Some(remote) = state.nodes.get_mut(&remote_endpoint) {
                remote.queue.push_back(TransportEvent::Received {
                    peer: remote_peer,
                    channel,
                    data,
                });
            }
            Ok(())
        }

        fn disconnect(&self, peer: PeerId) {
            let mut state = lock(&self.network.state);
            let Some(local) = state.nodes.get_mut(&self.endpoint) else {
                return;
            };
            let Some((remote_endpoint, remote_peer)) = local.links.remove(&peer) else {
                return;
            };
            local.queue.push_back(TransportEvent::PeerDisconnected {
                peer,
                reason: DisconnectReason::LocalClose,
            });

            if let Some(remote) = state.nodes.get_mut(&remote_endpoint) {
                remote.links.remove(&remote_peer);
                remote.queue.push_back(TransportEvent::PeerDisconnected {
                    peer: remote_peer,
                    reason: DisconnectReason::RemoteClosed,
                });
            }
        }

        fn poll_events(&self) -> Vec<TransportEvent> {
            lock(&self.network.state)
                .nodes
                .get_mut(&self.endpoint)
                .map(|node| node.queue.drain(..).collect())
                .unwrap_or_default()
        }
    }

}
