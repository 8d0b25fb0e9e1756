//! # tidepool-transport
//!
//! Node-to-node transport for tidepool.
//!
//! This crate provides:
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//! - **RPC channels**: symmetric connections carrying calls, responses and
//!   one-way frames, with correlation ids and per-call timeouts
//! - **RPC server**: accept loop over any [`NetworkProvider`]

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub use tidepool_core::{
    CodecError, JsonCodec, MemoryNetworkProvider, MessageCodec, NetworkAddress, NetworkProvider,
    NodeId, TokioNetworkProvider,
};

/// Error types for transport operations.
pub mod error;

/// Frame serialization with CRC32C checksums.
pub mod wire;

/// RPC channels and server.
pub mod rpc;

pub use error::TransportError;
pub use rpc::{
    ChannelConfig, ChannelMetrics, ConnectionHandle, Direction, ReplyError, RpcChannel,
    RpcHandler, RpcServer,
};
pub use wire::{Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError};
