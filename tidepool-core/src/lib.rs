//! # tidepool-core
//!
//! Core types shared by the tidepool transport and runtime crates.
//!
//! - **Addressing**: [`NetworkAddress`], [`NodeId`], [`ActorId`], [`ActorAddress`]
//! - **Codec trait**: [`MessageCodec`] with the default [`JsonCodec`]
//! - **Stable hashing**: [`stable_hash`] for values every node must agree on
//! - **Network providers**: [`NetworkProvider`] over real TCP or in-memory pipes

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod hash;
mod network;
mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use hash::{stable_hash, stable_key_hash};
pub use network::{
    MemoryListener, MemoryNetworkProvider, NetworkProvider, TcpListenerTrait,
    TokioNetworkProvider, TokioTcpListener,
};
pub use types::{ActorAddress, ActorId, NetworkAddress, NetworkAddressParseError, NodeId};
