//! Distribution: membership, routing and remote delivery.
//!
//! ```text
//!            ┌──────────────────── ClusterNode ─────────────────────┐
//!  seeds ──▶ │ Membership ── HashRing (copy-on-write)                │
//!            │     │                                                 │
//!            │     ▼                                                 │
//!            │ RoutingTable ── direct: handle ▶ node                 │
//!            │                 indirect: node ▶ relays               │
//!            │     │                                                 │
//!            │     ▼                                                 │
//!            │ RpcChannel per peer ◀── ActorProxy / VirtualProxy     │
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! A node hooks into its [`ActorSystem`](crate::ActorSystem) as the router:
//! [`VirtualRef`](crate::directory::VirtualRef)s whose key lands on another
//! node resolve to a proxy that ships a [`DispatchEnvelope`], and
//! [`ClusterNode::remote_actor`] hands out proxies for published actors on
//! other nodes.

mod bootstrap;
mod config;
mod dedup;
mod dispatch;
mod error;
mod handshake;
mod membership;
mod messages;
mod node;
mod protocol;
mod proxy;
mod ring;
mod routing;

pub use bootstrap::with_cluster;
pub use config::{ClusterConfig, ClusterConfigBuilder, ClusterConfigError, ReconnectConfig};
pub use dedup::{Batch, deduplicate};
pub use error::{ClusterError, HandshakeError};
pub use membership::PeerState;
pub use messages::{MessageRegistry, RemoteMessage};
pub use node::ClusterNode;
pub use protocol::{Args, DispatchEnvelope, HandshakeRequest, HandshakeResponse};
pub use ring::HashRing;
pub use routing::{Route, RoutingTable};

pub(crate) use messages::WireMessage;
pub(crate) use proxy::{ActorProxy, VirtualProxy};
