//! Cluster configuration.
//!
//! Separates what a node needs to find its peers (address, seeds, join
//! policy) from how it talks to them ([`ChannelConfig`]).

use std::sync::Arc;
use std::time::Duration;

use tidepool_core::NetworkAddress;
use tidepool_transport::ChannelConfig;

use super::messages::MessageRegistry;

/// Backoff applied before re-offering a peer whose connection failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound of the delay.
    pub max_backoff: Duration,
    /// Consecutive failures after which the peer is given up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `failures` (1-based): exponential growth
    /// capped at `max_backoff`, scaled by a random factor in `[0.5, 1.0]`.
    pub fn delay(&self, failures: u32) -> Duration {
        use rand::Rng;

        let exponent = failures.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        base.mul_f64(rand::rng().random_range(0.5..=1.0))
    }
}

/// Configuration of one [`ClusterNode`](super::ClusterNode).
///
/// # Example
///
/// ```rust
/// use tidepool::cluster::ClusterConfig;
/// use tidepool_core::NetworkAddress;
///
/// let config = ClusterConfig::builder()
///     .local_address(NetworkAddress::localhost(4500))
///     .seed_peers(vec![NetworkAddress::localhost(4501)])
///     .minimum_connected_peers(1)
///     .build()
///     .expect("valid config");
/// assert_eq!(config.candidate_queue_capacity, 100);
/// ```
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address the RPC server binds to; also the node's identity.
    pub local_address: NetworkAddress,
    /// Peers contacted when joining.
    pub seed_peers: Vec<NetworkAddress>,
    /// Members required before the cluster body runs.
    pub minimum_connected_peers: usize,
    /// Bound of the queue of peers waiting to be contacted.
    pub candidate_queue_capacity: usize,
    /// Virtual positions per node on the hash ring.
    pub ring_replicas: usize,
    /// Rounds of seed contact before giving up.
    pub join_attempts: u32,
    /// Wait after the first join round; doubles every round.
    pub join_backoff: Duration,
    /// Upper bound on waiting for `minimum_connected_peers`.
    pub members_timeout: Duration,
    /// Upper bound on one handshake exchange.
    pub handshake_timeout: Duration,
    /// Reconnect policy for failed peers.
    pub reconnect: ReconnectConfig,
    /// Reject peers whose shard count differs from ours.
    ///
    /// Off by default: a mismatch is logged as a warning and the peer joins,
    /// since keys are placed on shards locally and nodes with different
    /// worker counts still agree on ring ownership.
    pub strict_shard_count: bool,
    /// Timeouts and buffers of every RPC channel.
    pub channel: ChannelConfig,
    /// Message types accepted by remote actor proxies.
    pub messages: Arc<MessageRegistry>,
}

impl ClusterConfig {
    /// Start building a configuration.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Single node on `address` with every other setting at its default.
    pub fn for_address(address: NetworkAddress) -> Self {
        Self {
            local_address: address,
            seed_peers: Vec::new(),
            minimum_connected_peers: 0,
            candidate_queue_capacity: DEFAULT_CANDIDATE_QUEUE_CAPACITY,
            ring_replicas: 1,
            join_attempts: 5,
            join_backoff: Duration::from_secs(1),
            members_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            strict_shard_count: false,
            channel: ChannelConfig::default(),
            messages: Arc::new(MessageRegistry::new()),
        }
    }
}

/// Default bound of the candidate queue.
pub const DEFAULT_CANDIDATE_QUEUE_CAPACITY: usize = 100;

/// Errors from [`ClusterConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterConfigError {
    /// No local address was given.
    #[error("cluster config requires a local address")]
    MissingLocalAddress,
    /// Nodes need at least one ring position.
    #[error("ring_replicas must be at least 1")]
    ZeroReplicas,
    /// The candidate queue must hold at least one peer.
    #[error("candidate_queue_capacity must be at least 1")]
    ZeroQueueCapacity,
    /// The reconnect backoff starts above its own cap.
    #[error("initial backoff {initial:?} exceeds max backoff {max:?}")]
    InvalidBackoff {
        /// Rejected initial delay.
        initial: Duration,
        /// Rejected cap.
        max: Duration,
    },
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    local_address: Option<NetworkAddress>,
    seed_peers: Vec<NetworkAddress>,
    minimum_connected_peers: Option<usize>,
    candidate_queue_capacity: Option<usize>,
    ring_replicas: Option<usize>,
    join_attempts: Option<u32>,
    join_backoff: Option<Duration>,
    members_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
    reconnect: Option<ReconnectConfig>,
    strict_shard_count: bool,
    channel: Option<ChannelConfig>,
    messages: Option<MessageRegistry>,
}

impl ClusterConfigBuilder {
    /// Set the address the node binds to.
    pub fn local_address(mut self, address: NetworkAddress) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Set the seed peers.
    pub fn seed_peers(mut self, seeds: Vec<NetworkAddress>) -> Self {
        self.seed_peers = seeds;
        self
    }

    /// Set how many members must have joined before the body runs.
    pub fn minimum_connected_peers(mut self, peers: usize) -> Self {
        self.minimum_connected_peers = Some(peers);
        self
    }

    /// Set the candidate queue bound.
    pub fn candidate_queue_capacity(mut self, capacity: usize) -> Self {
        self.candidate_queue_capacity = Some(capacity);
        self
    }

    /// Set the number of ring positions per node.
    pub fn ring_replicas(mut self, replicas: usize) -> Self {
        self.ring_replicas = Some(replicas);
        self
    }

    /// Set the number of join rounds and the first round's wait.
    pub fn join(mut self, attempts: u32, backoff: Duration) -> Self {
        self.join_attempts = Some(attempts);
        self.join_backoff = Some(backoff);
        self
    }

    /// Bound the wait for `minimum_connected_peers`.
    pub fn members_timeout(mut self, timeout: Duration) -> Self {
        self.members_timeout = Some(timeout);
        self
    }

    /// Bound one handshake exchange.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Bound connection establishment. Overrides the channel config's value.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        let mut channel = self.channel.take().unwrap_or_default();
        channel.connect_timeout = timeout;
        self.channel = Some(channel);
        self
    }

    /// Set the reconnect policy.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Reject peers with a different shard count. Without it a mismatch
    /// only logs a warning.
    pub fn strict_shard_count(mut self, strict: bool) -> Self {
        self.strict_shard_count = strict;
        self
    }

    /// Set channel timeouts and buffers.
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the message types remote actor proxies may carry.
    pub fn messages(mut self, messages: MessageRegistry) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// See [`ClusterConfigError`].
    pub fn build(self) -> Result<ClusterConfig, ClusterConfigError> {
        let address = self
            .local_address
            .ok_or(ClusterConfigError::MissingLocalAddress)?;
        let defaults = ClusterConfig::for_address(address);

        let ring_replicas = self.ring_replicas.unwrap_or(defaults.ring_replicas);
        if ring_replicas == 0 {
            return Err(ClusterConfigError::ZeroReplicas);
        }
        let candidate_queue_capacity = self
            .candidate_queue_capacity
            .unwrap_or(defaults.candidate_queue_capacity);
        if candidate_queue_capacity == 0 {
            return Err(ClusterConfigError::ZeroQueueCapacity);
        }
        let reconnect = self.reconnect.unwrap_or(defaults.reconnect);
        if reconnect.initial_backoff > reconnect.max_backoff {
            return Err(ClusterConfigError::InvalidBackoff {
                initial: reconnect.initial_backoff,
                max: reconnect.max_backoff,
            });
        }

        Ok(ClusterConfig {
            local_address: address,
            seed_peers: self.seed_peers,
            minimum_connected_peers: self
                .minimum_connected_peers
                .unwrap_or(defaults.minimum_connected_peers),
            candidate_queue_capacity,
            ring_replicas,
            join_attempts: self.join_attempts.unwrap_or(defaults.join_attempts),
            join_backoff: self.join_backoff.unwrap_or(defaults.join_backoff),
            members_timeout: self.members_timeout.unwrap_or(defaults.members_timeout),
            handshake_timeout: self
                .handshake_timeout
                .unwrap_or(defaults.handshake_timeout),
            reconnect,
            strict_shard_count: self.strict_shard_count,
            channel: self.channel.unwrap_or(defaults.channel),
            messages: self.messages.map_or(defaults.messages, Arc::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::builder()
            .local_address(NetworkAddress::localhost(4500))
            .build()
            .expect("valid config");
        assert_eq!(config.candidate_queue_capacity, 100);
        assert_eq!(config.ring_replicas, 1);
        assert_eq!(config.join_attempts, 5);
        assert_eq!(config.join_backoff, Duration::from_secs(1));
        assert!(!config.strict_shard_count);
        assert!(config.seed_peers.is_empty());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            ClusterConfig::builder().build().expect_err("no address"),
            ClusterConfigError::MissingLocalAddress
        );
        let builder = ClusterConfig::builder().local_address(NetworkAddress::localhost(1));
        assert_eq!(
            builder.clone().ring_replicas(0).build().expect_err("no replicas"),
            ClusterConfigError::ZeroReplicas
        );
        let inverted = ReconnectConfig {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
            max_attempts: 1,
        };
        assert!(matches!(
            builder.reconnect(inverted).build(),
            Err(ClusterConfigError::InvalidBackoff { .. })
        ));
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let reconnect = ReconnectConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            max_attempts: 5,
        };
        let first = reconnect.delay(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        let late = reconnect.delay(30);
        assert!(late >= Duration::from_millis(200) && late <= Duration::from_millis(400));
    }

    #[test]
    fn test_connect_timeout_overrides_channel() {
        let config = ClusterConfig::builder()
            .local_address(NetworkAddress::localhost(1))
            .channel(ChannelConfig::local_network())
            .connect_timeout(Duration::from_millis(42))
            .build()
            .expect("valid config");
        assert_eq!(config.channel.connect_timeout, Duration::from_millis(42));
        assert_eq!(config.channel.request_timeout, Duration::from_secs(2));
    }
}
