//! Bidirectional request/response channels.
//!
//! - [`RpcChannel`]: one connection, both sides may call and send
//! - [`RpcServer`]: accept loop producing inbound channels
//! - [`RpcHandler`]: what a node does with frames it receives
//! - [`ReplyError`]: serializable failure of a call

mod channel;
mod config;
mod handler;
mod reply_error;
mod server;

pub use channel::{ChannelMetrics, ConnectionHandle, Direction, RpcChannel};
pub use config::ChannelConfig;
pub use handler::RpcHandler;
pub use reply_error::ReplyError;
pub use server::RpcServer;
