//! Configuration for RPC channels.

use std::time::Duration;

/// Timeouts and buffer sizes for [`RpcChannel`](super::RpcChannel)s.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Timeout for establishing the underlying stream.
    pub connect_timeout: Duration,

    /// Default time a call waits for its response.
    pub request_timeout: Duration,

    /// Initial capacity of the per-connection read buffer.
    pub read_buffer_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            read_buffer_capacity: 64 * 1024,
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with explicit timeouts.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            ..Self::default()
        }
    }

    /// Short timeouts for loopback and in-memory networks.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            read_buffer_capacity: 16 * 1024,
        }
    }

    /// Generous timeouts for high-latency links.
    pub fn wan_network() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            read_buffer_capacity: 256 * 1024,
        }
    }
}
