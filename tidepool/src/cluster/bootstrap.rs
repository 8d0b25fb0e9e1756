//! Scoped cluster lifetime.

use std::future::Future;
use std::time::Duration;

use tidepool_core::NetworkProvider;
use tracing::{info, warn};

use super::config::ClusterConfig;
use super::error::ClusterError;
use super::membership::PeerState;
use super::node::ClusterNode;
use crate::system::ActorSystem;

/// Run `body` as a member of the cluster described by `config`.
///
/// Starts a [`ClusterNode`] for `system` and joins the seed peers: up to
/// `join_attempts` rounds, round `i` waiting `2^i * join_backoff` for any
/// seed to accept. Then waits up to `members_timeout` for
/// `minimum_connected_peers` members, runs `body` and shuts the node down,
/// whether `body` ran or not.
///
/// ```rust,no_run
/// use tidepool::ActorSystem;
/// use tidepool::cluster::{ClusterConfig, with_cluster};
/// use tidepool::scheduler::SchedulerConfig;
/// use tidepool_core::{NetworkAddress, TokioNetworkProvider};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let system = ActorSystem::new(SchedulerConfig::default())?;
/// let config = ClusterConfig::builder()
///     .local_address("127.0.0.1:4500".parse::<NetworkAddress>()?)
///     .seed_peers(vec!["127.0.0.1:4501".parse()?])
///     .minimum_connected_peers(1)
///     .build()?;
/// let members = with_cluster(TokioNetworkProvider::new(), system, config, |node| async move {
///     node.members().len()
/// })
/// .await?;
/// # let _ = members;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// [`ClusterError::Bind`] when the server cannot start,
/// [`ClusterError::JoinFailed`] when seeds are configured and none could be
/// joined, [`ClusterError::MembersTimeout`] when too few members showed up.
pub async fn with_cluster<N, F, Fut, T>(
    network: N,
    system: ActorSystem,
    config: ClusterConfig,
    body: F,
) -> Result<T, ClusterError>
where
    N: NetworkProvider,
    F: FnOnce(ClusterNode<N>) -> Fut,
    Fut: Future<Output = T>,
{
    let node = ClusterNode::start(network, system, config).await?;
    let outcome = match prepare(&node).await {
        Ok(()) => Ok(body(node.clone()).await),
        Err(err) => Err(err),
    };
    node.shutdown();
    outcome
}

async fn prepare<N: NetworkProvider>(node: &ClusterNode<N>) -> Result<(), ClusterError> {
    join_seeds(node).await?;

    let config = node.config();
    let expected = config.minimum_connected_peers;
    if expected == 0 {
        return Ok(());
    }
    match tokio::time::timeout(config.members_timeout, node.wait_for_members(expected)).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::MembersTimeout {
            expected,
            joined: node.members().len(),
        }),
    }
}

async fn join_seeds<N: NetworkProvider>(node: &ClusterNode<N>) -> Result<(), ClusterError> {
    let config = node.config();
    let seeds: Vec<_> = config
        .seed_peers
        .iter()
        .copied()
        .filter(|seed| *seed != node.local_address())
        .collect();
    if seeds.is_empty() {
        return Ok(());
    }

    let mut joined = node.joined();
    for attempt in 0..config.join_attempts {
        for seed in &seeds {
            node.try_add_peer(*seed);
        }
        let wait = round_wait(config.join_backoff, attempt);
        let any_seed = joined.wait_for(|_| {
            seeds
                .iter()
                .any(|seed| node.peer_state(*seed) == PeerState::Joined)
        });
        let accepted = tokio::time::timeout(wait, any_seed)
            .await
            .is_ok_and(|result| result.is_ok());
        if accepted {
            info!(node = %node.node_id(), attempt, "joined the cluster");
            return Ok(());
        }
        warn!(node = %node.node_id(), attempt, ?wait, "no seed reachable yet");
    }
    Err(ClusterError::JoinFailed { seeds })
}

/// How long join round `attempt` waits for a seed.
fn round_wait(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(1 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use tidepool_core::{MemoryNetworkProvider, NetworkAddress};

    use super::*;
    use crate::scheduler::SchedulerConfig;

    fn system() -> ActorSystem {
        let config = SchedulerConfig::builder()
            .worker_count(1)
            .build()
            .expect("valid config");
        ActorSystem::new(config).expect("system starts")
    }

    #[test]
    fn test_round_wait_doubles() {
        let backoff = Duration::from_millis(10);
        assert_eq!(round_wait(backoff, 0), Duration::from_millis(10));
        assert_eq!(round_wait(backoff, 3), Duration::from_millis(80));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_seed_fails_join() {
        let network = MemoryNetworkProvider::new();
        let config = ClusterConfig::builder()
            .local_address(NetworkAddress::localhost(7600))
            .seed_peers(vec![NetworkAddress::localhost(7601)])
            .join(2, Duration::from_millis(20))
            .connect_timeout(Duration::from_millis(20))
            .build()
            .expect("valid config");
        let system = system();
        let err = with_cluster(network, system.clone(), config, |_| async {})
            .await
            .expect_err("nobody listens on the seed");
        assert!(matches!(err, ClusterError::JoinFailed { seeds } if seeds == vec![NetworkAddress::localhost(7601)]));
        assert!(system.router().is_none());
        system.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lone_node_runs_body() {
        let network = MemoryNetworkProvider::new();
        let config = ClusterConfig::for_address(NetworkAddress::localhost(7610));
        let system = system();
        let members = with_cluster(network, system.clone(), config, |node| async move {
            node.members().len()
        })
        .await
        .expect("runs");
        assert_eq!(members, 0);
        system.shutdown();
    }
}
