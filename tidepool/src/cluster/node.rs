//! One member of a cluster.
//!
//! A [`ClusterNode`] owns the RPC server, the connections to its peers, the
//! membership view and the routing table, and plugs itself into the local
//! [`ActorSystem`] as the router for everything remote.
//!
//! ```text
//!  try_add_peer ─▶ candidate queue ─▶ contact loop ─▶ connect ─▶ handshake ─▶ register
//!                        ▲                                                     │
//!                        └──────── known_nodes / reconnect backoff ◀───────────┘
//!
//!  inbound frame ─▶ NodeHandler ─▶ HANDSHAKE | DISPATCH* | ACTOR_* | WHEREIS | FORWARD
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidepool_core::{ActorId, JsonCodec, MessageCodec, NetworkAddress, NetworkProvider, NodeId};
use tidepool_transport::{
    ChannelMetrics, ConnectionHandle, ReplyError, RpcChannel, RpcHandler, RpcServer, TransportError,
};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::ClusterConfig;
use super::dispatch;
use super::error::ClusterError;
use super::handshake;
use super::membership::{Membership, PeerState};
use super::protocol::{
    ACTOR_ASK, ACTOR_MESSAGE, DISPATCH, DISPATCH_ASK, FORWARD, ForwardEnvelope, HANDSHAKE,
    HandshakeRequest, WHEREIS,
};
use super::proxy::ActorProxy;
use super::ring::HashRing;
use super::routing::{Route, RoutingTable};
use crate::actor::{ActorRef, ExitReason};
use crate::error::{RequestError, SendError};
use crate::registry::ProxyRegistry;
use crate::system::{ActorSystem, RemoteRouter, ReplyCallback};

/// Handle to a running cluster member. Cheap to clone.
///
/// Start it with [`ClusterNode::start`] and stop it with
/// [`shutdown`](Self::shutdown), or let [`with_cluster`](super::with_cluster)
/// do both. The node keeps its actor system's router slot until shutdown.
pub struct ClusterNode<N: NetworkProvider> {
    inner: Arc<ClusterInner<N>>,
}

impl<N: NetworkProvider> Clone for ClusterNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: NetworkProvider> std::fmt::Debug for ClusterNode<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node", &self.inner.node_id)
            .field("members", &self.inner.membership.members().len())
            .field("stopped", &self.inner.is_stopped())
            .finish()
    }
}

struct ClusterInner<N: NetworkProvider> {
    node_id: NodeId,
    config: ClusterConfig,
    network: N,
    system: ActorSystem,
    membership: Membership,
    routes: Mutex<RoutingTable>,
    channels: Mutex<HashMap<ConnectionHandle, RpcChannel>>,
    proxies: Arc<ProxyRegistry>,
    server: Mutex<Option<RpcServer>>,
    handler: Arc<NodeHandler<N>>,
    runtime: Handle,
    stopped: watch::Sender<bool>,
    self_ref: Weak<ClusterInner<N>>,
}

impl<N: NetworkProvider> ClusterNode<N> {
    /// Bind the RPC server on `config.local_address`, start the contact
    /// loop and register as `system`'s router. Must run inside a Tokio
    /// runtime, which then carries all cluster I/O.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Bind`] when the address cannot be bound.
    pub async fn start(network: N, system: ActorSystem, config: ClusterConfig) -> Result<Self, ClusterError> {
        let handler = Arc::new(NodeHandler {
            inner: OnceLock::new(),
        });
        let server = RpcServer::bind(
            &network,
            &config.local_address,
            handler.clone(),
            config.channel.clone(),
        )
        .await
        .map_err(|source| ClusterError::Bind {
            address: config.local_address,
            source,
        })?;

        let node_id = NodeId::new(server.local_addr(), rand::random());
        let (stopped, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| ClusterInner {
            node_id,
            membership: Membership::new(
                node_id,
                config.ring_replicas,
                config.candidate_queue_capacity,
            ),
            config,
            network,
            system: system.clone(),
            routes: Mutex::new(RoutingTable::new()),
            channels: Mutex::new(HashMap::new()),
            proxies: Arc::new(ProxyRegistry::new()),
            server: Mutex::new(Some(server)),
            handler: handler.clone(),
            runtime: Handle::current(),
            stopped,
            self_ref: self_ref.clone(),
        });
        let _ = handler.inner.set(Arc::downgrade(&inner));
        let router: Arc<dyn RemoteRouter> = inner.clone();
        system.set_router(Some(router));
        tokio::spawn(contact_loop(Arc::downgrade(&inner)));

        info!(node = %node_id, shards = system.shard_count(), "cluster node started");
        Ok(Self { inner })
    }

    /// This node's identity.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Address the RPC server listens on.
    pub fn local_address(&self) -> NetworkAddress {
        self.inner.node_id.address
    }

    /// The local actor system.
    pub fn system(&self) -> &ActorSystem {
        &self.inner.system
    }

    /// The configuration the node was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Offer `address` for contact. Returns `false` when it is this node,
    /// already joined or in flight, or when the candidate queue is full.
    pub fn try_add_peer(&self, address: NetworkAddress) -> bool {
        !self.inner.is_stopped() && self.inner.membership.offer(address)
    }

    /// Joined members, this node excluded, sorted.
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.membership.members()
    }

    /// Remote owner of `key_hash` on the ring; `None` when the ring is
    /// empty or the key belongs to this node.
    pub fn node_for_key(&self, key_hash: u64) -> Option<NetworkAddress> {
        self.inner.membership.node_for_key(key_hash)
    }

    /// Where `address` stands in the join protocol.
    pub fn peer_state(&self, address: NetworkAddress) -> PeerState {
        self.inner.membership.peer_state(address)
    }

    /// Current ring snapshot.
    pub fn ring(&self) -> Arc<HashRing> {
        self.inner.membership.ring()
    }

    /// Member count, updated on every join and leave.
    pub fn joined(&self) -> watch::Receiver<usize> {
        self.inner.membership.subscribe()
    }

    /// Wait until at least `count` members joined.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Stopped`] when the node shuts down first.
    pub async fn wait_for_members(&self, count: usize) -> Result<(), ClusterError> {
        let mut joined = self.inner.membership.subscribe();
        let mut stopped = self.inner.stopped.subscribe();
        tokio::select! {
            result = joined.wait_for(|members| *members >= count) => {
                result.map(drop).map_err(|_| ClusterError::Stopped)
            }
            _ = stopped.wait_for(|stopped| *stopped) => Err(ClusterError::Stopped),
        }
    }

    /// Route currently used for `node`.
    pub fn route(&self, node: NodeId) -> Option<Route> {
        self.inner.routes.lock().lookup(node)
    }

    /// Traffic counters of the connection routing to `node`.
    pub fn channel_metrics(&self, node: NodeId) -> Option<ChannelMetrics> {
        let route = self.route(node)?;
        let channel = self.inner.channels.lock().get(&route.handle).cloned()?;
        Some(channel.metrics())
    }

    /// Proxies for actors on other nodes.
    pub fn proxies(&self) -> &ProxyRegistry {
        &self.inner.proxies
    }

    /// Reference to the published actor `id` on `node`.
    ///
    /// For this node, the local published actor if any. For other nodes, a
    /// proxy shared with every other reference to the same actor; sends fail
    /// with [`SendError::NoRoute`] while the node is unreachable.
    pub fn remote_actor(&self, node: NodeId, id: ActorId) -> Option<ActorRef> {
        if node == self.inner.node_id {
            return self.inner.system.registry().get(id);
        }
        Some(self.inner.proxy(node, id))
    }

    /// Look up the actor `node` published under `name`.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Reply`] when `node` is unreachable or fails to answer.
    pub async fn whereis(&self, node: NodeId, name: &str) -> Result<Option<ActorRef>, ClusterError> {
        if node == self.inner.node_id {
            return Ok(self.inner.system.whereis(name));
        }
        let payload = JsonCodec.encode(&name).map_err(ReplyError::from)?;
        let (channel, method, payload) = self
            .inner
            .outbound(node, WHEREIS, payload)
            .map_err(|err| ReplyError::from(RequestError::from(err)))?;
        let reply = channel.call(method, payload).await?;
        let id: Option<ActorId> = JsonCodec.decode(&reply).map_err(ReplyError::from)?;
        Ok(id.map(|id| self.inner.proxy(node, id)))
    }

    /// Drop the connection to `address` and forget the peer. Its proxies
    /// are killed with [`ExitReason::RemoteLinkUnreachable`]. The peer may
    /// dial back. Returns whether `address` was a member.
    pub fn disconnect(&self, address: NetworkAddress) -> bool {
        let Some(node) = self.inner.membership.forget(address) else {
            return false;
        };
        let handle = {
            let mut routes = self.inner.routes.lock();
            let handle = routes.lookup_direct(node);
            routes.erase(node);
            handle
        };
        let channel = handle.and_then(|handle| self.inner.channels.lock().remove(&handle));
        self.inner.proxies.erase(node, ExitReason::RemoteLinkUnreachable);
        if let Some(channel) = channel {
            channel.close();
        }
        info!(%node, "peer disconnected");
        true
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the contact loop and the server, close every connection, kill
    /// every proxy and release the actor system's router slot. Idempotent;
    /// the actor system keeps running.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stopped.send_replace(true) {
            return;
        }
        inner.system.set_router(None);
        let server = inner.server.lock().take();
        if let Some(server) = server {
            server.shutdown();
        }
        inner.routes.lock().clear();
        let channels: Vec<RpcChannel> = inner.channels.lock().drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            channel.close();
        }
        inner.membership.clear();
        inner.proxies.clear(ExitReason::RemoteLinkUnreachable);
        info!(node = %inner.node_id, "cluster node stopped");
    }
}

impl<N: NetworkProvider> ClusterInner<N> {
    fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    fn proxy(&self, node: NodeId, id: ActorId) -> ActorRef {
        let router: Weak<dyn RemoteRouter> = self.self_ref.clone();
        self.proxies.get_or_put(node, id, || {
            Arc::new(ActorProxy::new(
                node,
                id,
                router,
                Arc::downgrade(&self.proxies),
                self.config.messages.clone(),
            ))
        })
    }

    /// Dial `address`, shake hands and register the peer.
    async fn contact(self: Arc<Self>, address: NetworkAddress) {
        if self.is_stopped() {
            return;
        }
        self.membership.set_state(address, PeerState::Connecting);
        let channel = match RpcChannel::connect(
            &self.network,
            &address,
            self.handler.clone(),
            self.config.channel.clone(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(err) => {
                debug!(peer = %address, error = %err, "connect failed");
                self.contact_failed(address);
                return;
            }
        };

        self.membership.set_state(address, PeerState::Handshaking);
        let request = HandshakeRequest {
            known_nodes: self.membership.members(),
            origin: self.node_id,
        };
        let response = handshake::initiate(
            &channel,
            address,
            &request,
            self.system.shard_count(),
            self.config.strict_shard_count,
            self.config.handshake_timeout,
        )
        .await;
        match response {
            Ok(response) => {
                self.register(response.responder, channel);
                self.learn(response.responder, &response.known_nodes);
            }
            Err(err) => {
                warn!(peer = %address, error = %err, "handshake failed");
                channel.close();
                self.contact_failed(address);
            }
        }
    }

    /// Answer an inbound handshake and register its origin.
    fn accept_handshake(&self, channel: RpcChannel, payload: &[u8]) -> Result<Vec<u8>, ReplyError> {
        let request = handshake::accept(payload).map_err(|err| ReplyError::Remote {
            message: err.to_string(),
        })?;
        if request.origin.address == self.node_id.address {
            return Err(ReplyError::Remote {
                message: "handshake from this node's own address".to_string(),
            });
        }
        let known = self.membership.known_nodes();
        self.register(request.origin, channel);
        self.learn(request.origin, &request.known_nodes);
        handshake::respond(request.origin, known, self.system.shard_count(), self.node_id).map_err(|err| {
            ReplyError::Serialization {
                message: err.to_string(),
            }
        })
    }

    /// Record the direct route to `node` over `channel` and put it on the
    /// ring. An existing open connection to the same node is kept.
    fn register(&self, node: NodeId, channel: RpcChannel) {
        let handle = channel.handle();
        {
            let mut routes = self.routes.lock();
            let mut channels = self.channels.lock();
            let existing = routes
                .lookup_direct(node)
                .filter(|existing| channels.get(existing).is_some_and(|open| !open.is_closed()));
            channels.insert(handle, channel.clone());
            if existing.is_none() {
                routes.add_direct(handle, node);
            }
        }
        self.membership.mark_joined(node);
        debug!(%node, connection = %handle, "peer registered");
        // The close callback may have run before the route existed.
        if channel.is_closed() {
            self.connection_lost(handle);
        }
    }

    /// Offer nodes advertised by `via` and remember `via` as a relay to them.
    fn learn(&self, via: NodeId, known: &[NodeId]) {
        for node in known {
            if node.address == self.node_id.address || *node == via {
                continue;
            }
            self.routes.lock().add_indirect(via, *node);
            self.membership.offer(node.address);
        }
    }

    /// Tear down everything that depended on `handle`.
    fn connection_lost(&self, handle: ConnectionHandle) {
        let (node, channel) = {
            let mut routes = self.routes.lock();
            let node = routes.erase_direct(handle);
            if let Some(node) = node {
                routes.erase(node);
            }
            (node, self.channels.lock().remove(&handle))
        };
        drop(channel);
        let Some(node) = node else {
            return;
        };
        self.proxies.erase(node, ExitReason::RemoteLinkUnreachable);
        if self.membership.member(node.address) != Some(node) {
            return;
        }
        let (_, failures) = self.membership.mark_failed(node.address);
        self.schedule_reconnect(node.address, failures);
    }

    fn contact_failed(&self, address: NetworkAddress) {
        let (_, failures) = self.membership.mark_failed(address);
        self.schedule_reconnect(address, failures);
    }

    fn schedule_reconnect(&self, address: NetworkAddress, failures: u32) {
        if self.is_stopped() {
            return;
        }
        if failures > self.config.reconnect.max_attempts {
            warn!(peer = %address, failures, "giving up on peer");
            return;
        }
        let delay = self.config.reconnect.delay(failures);
        debug!(peer = %address, failures, ?delay, "reconnect scheduled");
        let node = self.self_ref.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = node.upgrade()
                && !inner.is_stopped()
            {
                inner.membership.offer(address);
            }
        });
    }

    /// Channel and frame to write for `method` on its way to `node`;
    /// indirect routes wrap the frame for the relay.
    fn outbound(&self, node: NodeId, method: u32, payload: Vec<u8>) -> Result<(RpcChannel, u32, Vec<u8>), SendError> {
        let route = self.routes.lock().lookup(node).ok_or(SendError::NoRoute { node })?;
        let channel = self
            .channels
            .lock()
            .get(&route.handle)
            .cloned()
            .ok_or(SendError::NoRoute { node })?;
        if !route.is_indirect(node) {
            return Ok((channel, method, payload));
        }
        let envelope = ForwardEnvelope {
            destination: node,
            method,
            payload,
        };
        Ok((channel, FORWARD, JsonCodec.encode(&envelope)?))
    }

    /// Direct connection for a frame relayed through this node.
    fn relay_target(&self, payload: &[u8]) -> Result<(ForwardEnvelope, RpcChannel), ReplyError> {
        let envelope: ForwardEnvelope = JsonCodec.decode(payload)?;
        let handle = self.routes.lock().lookup_direct(envelope.destination);
        let channel = handle.and_then(|handle| self.channels.lock().get(&handle).cloned());
        match channel {
            Some(channel) => Ok((envelope, channel)),
            None => Err(ReplyError::NoRoute {
                destination: envelope.destination.to_string(),
            }),
        }
    }

    async fn relay_call(&self, payload: &[u8]) -> Result<Vec<u8>, ReplyError> {
        let (envelope, channel) = self.relay_target(payload)?;
        channel.call(envelope.method, envelope.payload).await
    }

    fn relay_send(&self, payload: &[u8]) {
        match self.relay_target(payload) {
            Ok((envelope, channel)) => {
                if let Err(err) = channel.send(envelope.method, envelope.payload) {
                    warn!(destination = %envelope.destination, error = %err, "relayed frame dropped");
                }
            }
            Err(err) => warn!(error = %err, "relayed frame dropped"),
        }
    }
}

impl<N: NetworkProvider> RemoteRouter for ClusterInner<N> {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn owner_of(&self, key_hash: u64) -> Option<NodeId> {
        self.membership.owner_of(key_hash)
    }

    fn send(&self, node: NodeId, method: u32, payload: Vec<u8>) -> Result<(), SendError> {
        let (channel, method, payload) = self.outbound(node, method, payload)?;
        channel.send(method, payload).map_err(|err| {
            debug!(%node, error = %err, "frame not sent");
            SendError::NoRoute { node }
        })
    }

    fn call(&self, node: NodeId, method: u32, payload: Vec<u8>, on_reply: ReplyCallback) -> Result<(), SendError> {
        let (channel, method, payload) = match self.outbound(node, method, payload) {
            Ok(outbound) => outbound,
            Err(err) => {
                on_reply(Err(ReplyError::from(RequestError::from(err.clone()))));
                return Err(err);
            }
        };
        self.runtime.spawn(async move {
            on_reply(channel.call(method, payload).await);
        });
        Ok(())
    }
}

/// Inbound side of every connection of one node.
struct NodeHandler<N: NetworkProvider> {
    inner: OnceLock<Weak<ClusterInner<N>>>,
}

impl<N: NetworkProvider> NodeHandler<N> {
    fn node(&self) -> Option<Arc<ClusterInner<N>>> {
        self.inner.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl<N: NetworkProvider> RpcHandler for NodeHandler<N> {
    async fn handle_request(&self, channel: RpcChannel, method: u32, payload: Vec<u8>) -> Result<Vec<u8>, ReplyError> {
        let inner = self.node().ok_or(ReplyError::ConnectionFailed)?;
        match method {
            HANDSHAKE => inner.accept_handshake(channel, &payload),
            DISPATCH_ASK => dispatch::dispatch_ask(&inner.system, &payload).await,
            ACTOR_ASK => dispatch::actor_ask(&inner.system, &inner.config.messages, &payload).await,
            WHEREIS => dispatch::whereis(&inner.system, &payload),
            FORWARD => inner.relay_call(&payload).await,
            other => Err(ReplyError::HandlerNotFound { method: other }),
        }
    }

    async fn handle_oneway(&self, channel: RpcChannel, method: u32, payload: Vec<u8>) {
        let Some(inner) = self.node() else {
            return;
        };
        let delivered = match method {
            DISPATCH => dispatch::dispatch(&inner.system, &payload).map(drop),
            ACTOR_MESSAGE => dispatch::actor_message(&inner.system, &inner.config.messages, &payload),
            FORWARD => {
                inner.relay_send(&payload);
                Ok(())
            }
            other => {
                warn!(peer = channel.peer(), method = other, "unknown one-way method");
                Ok(())
            }
        };
        if let Err(err) = delivered {
            warn!(peer = channel.peer(), method, error = %err, "inbound frame dropped");
        }
    }

    fn on_closed(&self, channel: &RpcChannel, reason: &TransportError) {
        if let Some(inner) = self.node() {
            debug!(peer = channel.peer(), connection = %channel.handle(), %reason, "connection closed");
            inner.connection_lost(channel.handle());
        }
    }
}

/// Pop candidates and contact each on its own task until the node stops.
async fn contact_loop<N: NetworkProvider>(node: Weak<ClusterInner<N>>) {
    loop {
        let Some(inner) = node.upgrade() else {
            return;
        };
        let mut stopped = inner.stopped.subscribe();
        let candidate = tokio::select! {
            candidate = inner.membership.next_candidate() => candidate,
            _ = stopped.wait_for(|stopped| *stopped) => return,
        };
        tokio::spawn(inner.contact(candidate));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tidepool_core::MemoryNetworkProvider;

    use super::*;
    use crate::actor::{Actor, Behavior, Context};
    use crate::cluster::{MessageRegistry, ReconnectConfig, RemoteMessage};
    use crate::scheduler::SchedulerConfig;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Put(u32);

    impl RemoteMessage for Put {
        const TAG: &'static str = "put";
        type Response = ();
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Get;

    impl RemoteMessage for Get {
        const TAG: &'static str = "get";
        type Response = Vec<u32>;
    }

    struct Store {
        values: Vec<u32>,
    }

    impl Actor for Store {
        fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
            Behavior::new()
                .on(|this: &mut Store, _ctx, Put(value): Put| this.values.push(value))
                .on(|this: &mut Store, _ctx, _: Get| this.values.clone())
        }
    }

    async fn start(network: &MemoryNetworkProvider, port: u16) -> ClusterNode<MemoryNetworkProvider> {
        let mut messages = MessageRegistry::new();
        messages.register::<Put>().register::<Get>();
        let config = ClusterConfig::builder()
            .local_address(NetworkAddress::localhost(port))
            .reconnect(ReconnectConfig {
                max_attempts: 0,
                ..ReconnectConfig::default()
            })
            .messages(messages)
            .build()
            .expect("valid config");
        let scheduler = SchedulerConfig::builder()
            .worker_count(2)
            .build()
            .expect("valid config");
        let system = ActorSystem::new(scheduler).expect("system starts");
        ClusterNode::start(network.clone(), system, config)
            .await
            .expect("node starts")
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn members(node: &ClusterNode<MemoryNetworkProvider>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), node.wait_for_members(count))
            .await
            .expect("members in time")
            .expect("node running");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_then_route_loss() {
        let network = MemoryNetworkProvider::new();
        let c = start(&network, 7700).await;
        let b = start(&network, 7701).await;
        let a = start(&network, 7702).await;
        b.try_add_peer(c.local_address());
        members(&c, 1).await;
        a.try_add_peer(c.local_address());
        members(&a, 2).await;
        members(&b, 2).await;
        members(&c, 2).await;

        let store = b.system().spawn(Store { values: Vec::new() });
        b.system().register_named("store", &store);

        // Cut A's direct link to B; A keeps reaching B through C.
        assert!(a.disconnect(b.local_address()));
        eventually("B to drop A", || b.route(a.node_id()).is_none()).await;
        assert!(a.inner.routes.lock().add_indirect(c.node_id(), b.node_id()));
        let route = a.route(b.node_id()).expect("indirect route");
        assert_eq!(route.next_hop, c.node_id());

        let remote = a
            .whereis(b.node_id(), "store")
            .await
            .expect("relayed lookup")
            .expect("published");
        assert_eq!(remote.id(), store.id());
        remote.tell(Put(1)).expect("relayed tell");
        let values: Vec<u32> = tokio::time::timeout(Duration::from_secs(5), remote.ask(Get))
            .await
            .expect("in time")
            .expect("relayed ask");
        assert_eq!(values, vec![1]);

        // B crashes; the relay answers calls with NoRoute instead of hanging.
        b.shutdown();
        eventually("C to drop B", || c.route(b.node_id()).is_none()).await;
        let err = a.whereis(b.node_id(), "store").await.expect_err("relay lost B");
        assert!(matches!(err, ClusterError::Reply(ReplyError::NoRoute { .. })));

        // Losing the relay removes the last route to B.
        assert!(a.disconnect(c.local_address()));
        assert!(a.route(b.node_id()).is_none());
        let err = a
            .remote_actor(b.node_id(), store.id())
            .expect("proxy")
            .tell(Put(2))
            .expect_err("no route");
        assert!(matches!(err, SendError::NoRoute { .. }));

        a.shutdown();
        c.shutdown();
        for node in [&a, &b, &c] {
            node.system().shutdown();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_loss_kills_proxies_and_clears_ring() {
        let network = MemoryNetworkProvider::new();
        let a = start(&network, 7710).await;
        let b = start(&network, 7711).await;
        a.try_add_peer(b.local_address());
        members(&a, 1).await;
        members(&b, 1).await;
        assert!(a.ring().contains(&b.local_address()));

        let store = b.system().spawn(Store { values: Vec::new() });
        b.system().register_named("store", &store);
        let proxy = a.remote_actor(b.node_id(), store.id()).expect("proxy");
        assert_eq!(a.proxies().len(), 1);

        b.shutdown();
        eventually("A to notice", || a.members().is_empty()).await;
        assert!(!a.ring().contains(&b.local_address()));
        assert_eq!(a.peer_state(b.local_address()), PeerState::Failed);
        assert!(a.proxies().is_empty());
        assert!(matches!(proxy.tell(Put(1)), Err(SendError::QueueClosed)));

        a.shutdown();
        assert!(a.is_stopped());
        assert!(a.system().router().is_none());
        a.system().shutdown();
        b.system().shutdown();
    }
}
