//! Server-side hook invoked for every inbound frame.

use async_trait::async_trait;

use super::channel::RpcChannel;
use super::reply_error::ReplyError;
use crate::error::TransportError;

/// Handles frames arriving on an [`RpcChannel`].
///
/// One-way frames are handled inline by the connection's reader task, so
/// they are processed in arrival order and a slow handler applies
/// backpressure to that connection. Requests run on their own task and may
/// complete in any order.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Answer a request. The returned bytes become the response payload.
    async fn handle_request(
        &self,
        channel: RpcChannel,
        method: u32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ReplyError>;

    /// Consume a one-way frame.
    async fn handle_oneway(&self, channel: RpcChannel, method: u32, payload: Vec<u8>);

    /// Called once when the channel closes, for any reason.
    fn on_closed(&self, _channel: &RpcChannel, _reason: &TransportError) {}
}
