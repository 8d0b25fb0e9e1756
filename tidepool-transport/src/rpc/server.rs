//! Accept loop turning inbound connections into [`RpcChannel`]s.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{NetworkAddress, NetworkProvider, TcpListenerTrait};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::channel::{Direction, RpcChannel};
use super::config::ChannelConfig;
use super::handler::RpcHandler;
use crate::error::TransportError;

/// Pause after a failed accept so a broken listener does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// Listening side of the RPC layer.
///
/// Every accepted stream becomes an inbound [`RpcChannel`] served by the
/// shared handler. Dropping the server stops accepting but leaves
/// established channels alone; [`RpcServer::shutdown`] closes them too.
pub struct RpcServer {
    local_addr: NetworkAddress,
    accept_task: AbortHandle,
    inbound: Arc<Mutex<Vec<RpcChannel>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RpcServer {
    /// Bind `address` and start accepting.
    ///
    /// # Errors
    ///
    /// Returns the provider's bind error.
    pub async fn bind<N: NetworkProvider>(
        network: &N,
        address: &NetworkAddress,
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
    ) -> Result<Self, TransportError> {
        let listener = network.bind(address).await?;
        let local_addr = listener.local_addr()?;
        let inbound = Arc::new(Mutex::new(Vec::new()));
        info!(address = %local_addr, "rpc server listening");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            config,
            Arc::clone(&inbound),
        ))
        .abort_handle();

        Ok(Self {
            local_addr,
            accept_task,
            inbound,
        })
    }

    /// Address the listener is bound to (port 0 resolved).
    pub fn local_addr(&self) -> NetworkAddress {
        self.local_addr
    }

    /// Inbound channels that are still open.
    pub fn inbound_channels(&self) -> Vec<RpcChannel> {
        let mut inbound = self.inbound.lock();
        inbound.retain(|channel| !channel.is_closed());
        inbound.clone()
    }

    /// Stop accepting and close every inbound channel.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let channels: Vec<RpcChannel> = self
            .inbound
            .lock()
            .drain(..)
            .collect();
        for channel in channels {
            channel.close();
        }
        debug!(address = %self.local_addr, "rpc server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop<L: TcpListenerTrait>(
    listener: L,
    handler: Arc<dyn RpcHandler>,
    config: ChannelConfig,
    inbound: Arc<Mutex<Vec<RpcChannel>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted rpc connection");
                let channel = RpcChannel::spawn(
                    stream,
                    peer,
                    Direction::Inbound,
                    Arc::clone(&handler),
                    config.clone(),
                );
                let mut inbound = inbound.lock();
                inbound.retain(|c| !c.is_closed());
                inbound.push(channel);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {
                debug!("listener closed, accept loop exiting");
                return;
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
