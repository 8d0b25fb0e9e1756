//! Multi-node tests over the in-memory network.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool::ActorSystem;
use tidepool::actor::{Actor, Behavior, Context};
use tidepool::cluster::{
    ClusterConfig, ClusterError, ClusterNode, PeerState, deduplicate, with_cluster,
};
use tidepool::directory::{HandlerTable, VirtualActor};
use tidepool::scheduler::SchedulerConfig;
use tidepool_core::{JsonCodec, MemoryNetworkProvider, NetworkAddress, stable_key_hash};

type Node = ClusterNode<MemoryNetworkProvider>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn actor_system() -> ActorSystem {
    let config = SchedulerConfig::builder()
        .worker_count(2)
        .build()
        .expect("valid config");
    let system = ActorSystem::new(config).expect("workers start");
    system.register_virtual::<Tally>();
    system
}

async fn start(network: &MemoryNetworkProvider, port: u16) -> Node {
    init_tracing();
    let config = ClusterConfig::builder()
        .local_address(NetworkAddress::localhost(port))
        .ring_replicas(16)
        .build()
        .expect("valid config");
    ClusterNode::start(network.clone(), actor_system(), config)
        .await
        .expect("node starts")
}

async fn members(node: &Node, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), node.wait_for_members(count))
        .await
        .expect("members in time")
        .expect("node running");
}

fn stop(nodes: &[&Node]) {
    for node in nodes {
        node.shutdown();
        node.system().shutdown();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Add(u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Steps;

/// Records every value it was given, in arrival order.
struct Tally {
    steps: Vec<u64>,
}

impl Actor for Tally {
    fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
        Behavior::new()
            .on(|this: &mut Tally, _ctx, Add(value): Add| this.steps.push(value))
            .on(|this: &mut Tally, _ctx, _: Steps| this.steps.clone())
    }
}

impl VirtualActor for Tally {
    type Key = String;
    const TYPE_NAME: &'static str = "tally";

    fn activate(_key: &String) -> Self {
        Tally { steps: Vec::new() }
    }

    fn register(handlers: &mut HandlerTable<Self>) {
        handlers.tell::<Add>("add").ask::<Steps, Vec<u64>>("steps");
    }
}

/// A key whose ring owner, as seen from `from`, is `owner`.
fn key_owned_by(from: &Node, owner: &Node) -> String {
    (0..10_000)
        .map(|i| format!("key-{i}"))
        .find(|key| {
            let hash = stable_key_hash(&JsonCodec, key).expect("hashable");
            from.node_for_key(hash) == Some(owner.local_address())
        })
        .expect("some key lands on the owner")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_nodes_see_each_other() {
    let network = MemoryNetworkProvider::new();
    let a = start(&network, 8000).await;
    let b = start(&network, 8001).await;

    assert!(a.try_add_peer(b.local_address()));
    assert!(!a.try_add_peer(a.local_address()));
    members(&a, 1).await;
    members(&b, 1).await;

    assert_eq!(a.members(), vec![b.node_id()]);
    assert_eq!(b.members(), vec![a.node_id()]);
    assert_eq!(*a.joined().borrow(), 1);
    assert_eq!(a.peer_state(b.local_address()), PeerState::Joined);
    assert!(!a.try_add_peer(b.local_address()));
    assert!(a.route(b.node_id()).is_some());
    assert_eq!(a.ring().len(), 2);
    assert_eq!(a.ring().nodes(), b.ring().nodes());
    stop(&[&a, &b]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gossip_introduces_known_nodes() {
    let network = MemoryNetworkProvider::new();
    let a = start(&network, 8010).await;
    let b = start(&network, 8011).await;
    let c = start(&network, 8012).await;

    a.try_add_peer(b.local_address());
    members(&b, 1).await;
    // C only knows B and learns about A from B's handshake.
    c.try_add_peer(b.local_address());
    for node in [&a, &b, &c] {
        members(node, 2).await;
    }
    assert!(c.members().contains(&a.node_id()));
    assert!(a.members().contains(&c.node_id()));
    stop(&[&a, &b, &c]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_with_cluster_waits_for_peers() {
    init_tracing();
    let network = MemoryNetworkProvider::new();
    let seed = start(&network, 8020).await;

    let config = ClusterConfig::builder()
        .local_address(NetworkAddress::localhost(8021))
        .seed_peers(vec![seed.local_address()])
        .minimum_connected_peers(1)
        .join(3, Duration::from_millis(200))
        .build()
        .expect("valid config");
    let system = actor_system();
    let seen = with_cluster(network.clone(), system.clone(), config, |node| async move {
        node.members()
    })
    .await
    .expect("joined");
    assert_eq!(seen, vec![seed.node_id()]);
    system.shutdown();

    let lonely = ClusterConfig::builder()
        .local_address(NetworkAddress::localhost(8022))
        .minimum_connected_peers(2)
        .members_timeout(Duration::from_millis(100))
        .build()
        .expect("valid config");
    let system = actor_system();
    let err = with_cluster(network, system.clone(), lonely, |_| async {})
        .await
        .expect_err("nobody else joins");
    assert!(matches!(err, ClusterError::MembersTimeout { expected: 2, .. }));
    system.shutdown();
    stop(&[&seed]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_virtual_actor_lives_on_ring_owner() {
    let network = MemoryNetworkProvider::new();
    let a = start(&network, 8030).await;
    let b = start(&network, 8031).await;
    a.try_add_peer(b.local_address());
    members(&a, 1).await;
    members(&b, 1).await;

    let key = key_owned_by(&a, &b);
    let from_a = a.system().virtual_ref::<Tally>(key.clone());
    let resolved = from_a.resolve().expect("resolves");
    assert!(resolved.is_remote());

    from_a.tell(Add(3)).expect("sent");
    let steps: Vec<u64> = tokio::time::timeout(Duration::from_secs(5), from_a.ask(Steps))
        .await
        .expect("in time")
        .expect("remote reply");
    assert_eq!(steps, vec![3]);

    // B answers from its own instance; A never activated one.
    let from_b: Vec<u64> = tokio::time::timeout(
        Duration::from_secs(5),
        b.system().virtual_ref::<Tally>(key).ask(Steps),
    )
    .await
    .expect("in time")
    .expect("local reply");
    assert_eq!(from_b, vec![3]);
    let on_a: usize = (0..a.system().shard_count())
        .map(|shard| a.system().shard(shard).instance_count::<Tally, String>())
        .sum();
    assert_eq!(on_a, 0);
    stop(&[&a, &b]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deduplicated_batch_is_one_frame() {
    let network = MemoryNetworkProvider::new();
    let a = start(&network, 8040).await;
    let b = start(&network, 8041).await;
    a.try_add_peer(b.local_address());
    members(&a, 1).await;
    members(&b, 1).await;

    let tally = a.system().virtual_ref::<Tally>(key_owned_by(&a, &b));
    let before = a.channel_metrics(b.node_id()).expect("connected").frames_sent;
    let sent = deduplicate(&tally, |batch| {
        for step in 1..=5 {
            batch.tell(Add(step));
        }
    })
    .expect("batch sent");
    assert_eq!(sent, 5);
    let after = a.channel_metrics(b.node_id()).expect("connected").frames_sent;
    assert_eq!(after - before, 1);

    let steps: Vec<u64> = tokio::time::timeout(Duration::from_secs(5), tally.ask(Steps))
        .await
        .expect("in time")
        .expect("remote reply");
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);
    stop(&[&a, &b]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_peer_leaves_no_route() {
    let network = MemoryNetworkProvider::new();
    let a = start(&network, 8050).await;
    let b = start(&network, 8051).await;
    a.try_add_peer(b.local_address());
    members(&a, 1).await;

    let key = key_owned_by(&a, &b);
    b.shutdown();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.route(b.node_id()).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "route to B never dropped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(a.members().is_empty());

    // With B off the ring the key is served locally again.
    let tally = a.system().virtual_ref::<Tally>(key);
    assert!(!tally.resolve().expect("resolves").is_remote());
    assert!(a.channel_metrics(b.node_id()).is_none());
    stop(&[&a, &b]);
}
