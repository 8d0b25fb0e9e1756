//! Key-addressed actors and their per-shard directories.
//!
//! ```text
//! VirtualRef<A>(key) ──resolve──▶ ring owner is remote? ──▶ VirtualProxy ──▶ DISPATCH
//!                                         │ local
//!                                         ▼
//!                       PlacementStrategy(hash) ──▶ shard
//!                                         │
//!                                         ▼
//!                 ShardContext[shard].Directory<A>[key] ──▶ ActorRef
//! ```

mod placement;
mod shard;
mod virtual_actor;

pub use placement::{FixedPlacement, ModuloPlacement, PlacementStrategy, RoundRobinPlacement};
pub use shard::{Directory, ShardContext};
pub use virtual_actor::{Activation, HandlerTable, VirtualActor, VirtualRef};

pub(crate) use virtual_actor::{Location, VirtualType, activate_local};
