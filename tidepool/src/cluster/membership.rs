//! Gossip membership: who we know, who we are talking to, and the ring.
//!
//! Peers move through [`PeerState`]s as the contact loop works on them:
//!
//! ```text
//! try_add_peer ──▶ Unknown (queued) ──▶ Connecting ──▶ Handshaking ──▶ Joined
//!                        ▲                   │               │           │
//!                        └──── backoff ◀─── Failed ◀─────────┴───────────┘
//! ```
//!
//! The ring is copy-on-write: readers clone an `Arc<HashRing>` and never
//! hold the lock while routing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tidepool_core::{NetworkAddress, NodeId};
use tokio::sync::{Notify, watch};

use super::ring::HashRing;

/// Where a peer stands in the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Never heard of, or queued and not yet contacted.
    Unknown,
    /// Dialing.
    Connecting,
    /// Connected, exchanging handshakes.
    Handshaking,
    /// Member of the cluster.
    Joined,
    /// Last contact failed or the connection was lost.
    Failed,
}

impl PeerState {
    fn in_flight(self) -> bool {
        matches!(
            self,
            PeerState::Unknown | PeerState::Connecting | PeerState::Handshaking | PeerState::Joined
        )
    }
}

#[derive(Debug)]
struct Peer {
    state: PeerState,
    node: Option<NodeId>,
    failures: u32,
}

/// Membership view of one node.
#[derive(Debug)]
pub(crate) struct Membership {
    local: NodeId,
    ring: RwLock<Arc<HashRing>>,
    peers: Mutex<HashMap<NetworkAddress, Peer>>,
    candidates: Mutex<VecDeque<NetworkAddress>>,
    capacity: usize,
    candidate_ready: Notify,
    joined: watch::Sender<usize>,
}

impl Membership {
    pub(crate) fn new(local: NodeId, replicas: usize, capacity: usize) -> Self {
        let (joined, _) = watch::channel(0);
        Self {
            local,
            ring: RwLock::new(Arc::new(HashRing::new(replicas).with_node(local.address))),
            peers: Mutex::new(HashMap::new()),
            candidates: Mutex::new(VecDeque::new()),
            capacity,
            candidate_ready: Notify::new(),
            joined,
        }
    }

    /// Queue `address` for contact. Returns whether it was queued.
    pub(crate) fn offer(&self, address: NetworkAddress) -> bool {
        if address == self.local.address {
            return false;
        }
        let mut peers = self.peers.lock();
        if peers.get(&address).is_some_and(|peer| peer.state.in_flight()) {
            return false;
        }
        let mut candidates = self.candidates.lock();
        if candidates.len() >= self.capacity {
            tracing::warn!(peer = %address, capacity = self.capacity, "candidate queue full, peer dropped");
            return false;
        }
        candidates.push_back(address);
        peers
            .entry(address)
            .or_insert(Peer {
                state: PeerState::Unknown,
                node: None,
                failures: 0,
            })
            .state = PeerState::Unknown;
        drop(candidates);
        drop(peers);
        self.candidate_ready.notify_one();
        tracing::debug!(peer = %address, "peer queued");
        true
    }

    /// Next queued peer; waits while the queue is empty.
    pub(crate) async fn next_candidate(&self) -> NetworkAddress {
        loop {
            let ready = self.candidate_ready.notified();
            if let Some(address) = self.candidates.lock().pop_front() {
                return address;
            }
            ready.await;
        }
    }

    pub(crate) fn set_state(&self, address: NetworkAddress, state: PeerState) {
        if let Some(peer) = self.peers.lock().get_mut(&address) {
            peer.state = state;
        }
    }

    /// Record `node` as a member and put it on the ring. Returns `false` if
    /// it already was one.
    pub(crate) fn mark_joined(&self, node: NodeId) -> bool {
        let mut peers = self.peers.lock();
        let peer = peers.entry(node.address).or_insert(Peer {
            state: PeerState::Unknown,
            node: None,
            failures: 0,
        });
        let fresh = peer.state != PeerState::Joined || peer.node != Some(node);
        peer.state = PeerState::Joined;
        peer.node = Some(node);
        peer.failures = 0;
        let count = joined_count(&peers);
        if fresh {
            let mut ring = self.ring.write();
            *ring = Arc::new(ring.with_node(node.address));
        }
        drop(peers);

        if fresh {
            tracing::info!(%node, members = count, "node joined");
        }
        self.joined.send_replace(count);
        fresh
    }

    /// Take `address` off the ring and mark it failed. Returns the member
    /// that was removed, if any, and the consecutive failure count.
    pub(crate) fn mark_failed(&self, address: NetworkAddress) -> (Option<NodeId>, u32) {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&address) else {
            return (None, 0);
        };
        let removed = if peer.state == PeerState::Joined {
            peer.node.take()
        } else {
            None
        };
        peer.state = PeerState::Failed;
        peer.failures = peer.failures.saturating_add(1);
        let failures = peer.failures;
        let count = joined_count(&peers);
        if removed.is_some() {
            let mut ring = self.ring.write();
            *ring = Arc::new(ring.without_node(&address));
        }
        drop(peers);

        if let Some(node) = removed {
            tracing::info!(%node, members = count, "node left");
        }
        self.joined.send_replace(count);
        (removed, failures)
    }

    /// Forget `address` entirely, for deliberate disconnects.
    pub(crate) fn forget(&self, address: NetworkAddress) -> Option<NodeId> {
        let mut peers = self.peers.lock();
        let removed = peers.remove(&address)?;
        self.candidates.lock().retain(|candidate| *candidate != address);
        let count = joined_count(&peers);
        if removed.state == PeerState::Joined {
            let mut ring = self.ring.write();
            *ring = Arc::new(ring.without_node(&address));
        }
        drop(peers);

        if removed.state == PeerState::Joined {
            tracing::info!(peer = %address, members = count, "node disconnected");
        }
        self.joined.send_replace(count);
        removed.node
    }

    /// Joined members, this node excluded.
    pub(crate) fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self
            .peers
            .lock()
            .values()
            .filter(|peer| peer.state == PeerState::Joined)
            .filter_map(|peer| peer.node)
            .collect();
        members.sort();
        members
    }

    /// Joined members plus this node, as advertised in handshakes.
    pub(crate) fn known_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.members();
        nodes.push(self.local);
        nodes
    }

    pub(crate) fn member(&self, address: NetworkAddress) -> Option<NodeId> {
        self.peers
            .lock()
            .get(&address)
            .filter(|peer| peer.state == PeerState::Joined)
            .and_then(|peer| peer.node)
    }

    pub(crate) fn peer_state(&self, address: NetworkAddress) -> PeerState {
        self.peers
            .lock()
            .get(&address)
            .map_or(PeerState::Unknown, |peer| peer.state)
    }

    pub(crate) fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Remote owner of `key_hash`; `None` when the ring is empty or the key
    /// is ours.
    pub(crate) fn node_for_key(&self, key_hash: u64) -> Option<NetworkAddress> {
        self.ring()
            .node_for_key(key_hash)
            .filter(|owner| *owner != self.local.address)
    }

    pub(crate) fn owner_of(&self, key_hash: u64) -> Option<NodeId> {
        self.member(self.node_for_key(key_hash)?)
    }

    /// Member count, updated on every join and leave.
    pub(crate) fn subscribe(&self) -> watch::Receiver<usize> {
        self.joined.subscribe()
    }

    /// Drop every peer and queued candidate; the ring keeps only this node.
    pub(crate) fn clear(&self) {
        let mut peers = self.peers.lock();
        peers.clear();
        self.candidates.lock().clear();
        let mut ring = self.ring.write();
        *ring = Arc::new(HashRing::new(ring.replicas()).with_node(self.local.address));
        drop(ring);
        drop(peers);
        self.joined.send_replace(0);
    }
}

fn joined_count(peers: &HashMap<NetworkAddress, Peer>) -> usize {
    peers
        .values()
        .filter(|peer| peer.state == PeerState::Joined)
        .count()
}
