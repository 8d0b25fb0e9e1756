//! Direct and one-hop indirect routes to other nodes.

use std::collections::{BTreeSet, HashMap};

use tidepool_core::NodeId;
use tidepool_transport::ConnectionHandle;

/// How to reach a node: the connection to write to and the node at its
/// other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Node at the other end of `handle`; the destination itself for
    /// direct routes, a relay otherwise.
    pub next_hop: NodeId,
    /// Connection to write to.
    pub handle: ConnectionHandle,
}

impl Route {
    /// Whether the route goes through a relay to reach `destination`.
    pub fn is_indirect(&self, destination: NodeId) -> bool {
        self.next_hop != destination
    }
}

/// Routing table of one node.
///
/// Direct routes map connections to the nodes at their far end, one
/// connection per node. Indirect routes record which directly connected
/// nodes advertised a destination; they are used only when no direct route
/// exists and never chain more than one relay.
#[derive(Debug, Default)]
pub struct RoutingTable {
    direct_by_handle: HashMap<ConnectionHandle, NodeId>,
    direct_by_node: HashMap<NodeId, ConnectionHandle>,
    indirect: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl RoutingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct route if any, else the first relay with a direct route.
    pub fn lookup(&self, node: NodeId) -> Option<Route> {
        if let Some(handle) = self.direct_by_node.get(&node) {
            return Some(Route {
                next_hop: node,
                handle: *handle,
            });
        }
        self.indirect.get(&node)?.iter().find_map(|hop| {
            self.direct_by_node.get(hop).map(|handle| Route {
                next_hop: *hop,
                handle: *handle,
            })
        })
    }

    /// Connection directly attached to `node`.
    pub fn lookup_direct(&self, node: NodeId) -> Option<ConnectionHandle> {
        self.direct_by_node.get(&node).copied()
    }

    /// Node at the far end of `handle`.
    pub fn lookup_handle(&self, handle: ConnectionHandle) -> Option<NodeId> {
        self.direct_by_handle.get(&handle).copied()
    }

    /// Relays known for `node`, in order of preference.
    pub fn lookup_indirect(&self, node: NodeId) -> Vec<NodeId> {
        self.indirect
            .get(&node)
            .map(|hops| hops.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record that `handle` leads to `node`. Returns the connection it
    /// replaces, if `node` already had one.
    pub fn add_direct(&mut self, handle: ConnectionHandle, node: NodeId) -> Option<ConnectionHandle> {
        if let Some(previous_node) = self.direct_by_handle.insert(handle, node)
            && previous_node != node
        {
            self.direct_by_node.remove(&previous_node);
        }
        let replaced = self.direct_by_node.insert(node, handle);
        match replaced {
            Some(old) if old != handle => {
                self.direct_by_handle.remove(&old);
                Some(old)
            }
            _ => None,
        }
    }

    /// Forget the direct route over `handle`, and every indirect route
    /// through the node it led to. Returns that node.
    pub fn erase_direct(&mut self, handle: ConnectionHandle) -> Option<NodeId> {
        let node = self.direct_by_handle.remove(&handle)?;
        self.direct_by_node.remove(&node);
        self.remove_hop(node);
        Some(node)
    }

    /// Record that `hop` can reach `destination`. Returns `false` when the
    /// route was known or `destination` is directly reachable.
    pub fn add_indirect(&mut self, hop: NodeId, destination: NodeId) -> bool {
        if hop == destination || self.direct_by_node.contains_key(&destination) {
            return false;
        }
        self.indirect.entry(destination).or_default().insert(hop)
    }

    /// Forget every indirect route to `destination`.
    pub fn erase_indirect(&mut self, destination: NodeId) {
        self.indirect.remove(&destination);
    }

    /// Forget every route to and through `node`.
    pub fn erase(&mut self, node: NodeId) {
        if let Some(handle) = self.direct_by_node.remove(&node) {
            self.direct_by_handle.remove(&handle);
        }
        self.indirect.remove(&node);
        self.remove_hop(node);
    }

    /// Directly connected nodes.
    pub fn direct_nodes(&self) -> Vec<NodeId> {
        self.direct_by_node.keys().copied().collect()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.direct_by_handle.clear();
        self.direct_by_node.clear();
        self.indirect.clear();
    }

    fn remove_hop(&mut self, hop: NodeId) {
        self.indirect.retain(|_, hops| {
            hops.remove(&hop);
            !hops.is_empty()
        });
    }
}
