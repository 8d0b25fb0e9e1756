//! The actor system: scheduler, clock, shards and registries of one node.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tidepool_core::{ActorId, JsonCodec, NodeId, stable_key_hash};
use tidepool_transport::ReplyError;

use crate::actor::cell::ActorCell;
use crate::actor::{Actor, ActorRef, ExitReason, WeakActorRef};
use crate::directory::{ShardContext, VirtualActor, VirtualRef, VirtualType, activate_local};
use crate::error::SendError;
use crate::message::{MailboxElement, SystemMessage};
use crate::registry::ActorRegistry;
use crate::scheduler::{ActorClock, Coordinator, SchedulerConfig};

/// How long [`ActorSystem::shutdown`] waits for actors to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Callback receiving the outcome of a remote call.
pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<Vec<u8>, ReplyError>) + Send>;

/// Outbound half of a cluster, as seen by the local runtime.
pub(crate) trait RemoteRouter: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Node owning `key_hash` on the ring; `None` when it is this node or
    /// the ring is empty.
    fn owner_of(&self, key_hash: u64) -> Option<NodeId>;

    /// Queue a one-way frame for `node`.
    fn send(&self, node: NodeId, method: u32, payload: Vec<u8>) -> Result<(), SendError>;

    /// Call `method` on `node`; `on_reply` runs on the cluster runtime.
    fn call(
        &self,
        node: NodeId,
        method: u32,
        payload: Vec<u8>,
        on_reply: ReplyCallback,
    ) -> Result<(), SendError>;
}

struct SystemInner {
    scheduler: Coordinator,
    clock: ActorClock,
    registry: ActorRegistry,
    shards: Vec<ShardContext>,
    live: Mutex<HashMap<ActorId, WeakActorRef>>,
    virtual_types: RwLock<HashMap<TypeId, Arc<VirtualType>>>,
    virtual_names: RwLock<HashMap<&'static str, Arc<VirtualType>>>,
    router: RwLock<Option<Arc<dyn RemoteRouter>>>,
    next_actor_id: AtomicU64,
    stopped: AtomicBool,
}

/// Handle to a running actor system. Cheap to clone.
///
/// Owns the worker pool, the timer thread, one [`ShardContext`] per worker
/// and the [`ActorRegistry`]. A [`ClusterNode`](crate::cluster::ClusterNode)
/// plugs itself in as the router for remote virtual actors.
///
/// # Example
///
/// ```rust
/// use tidepool::actor::{Actor, Behavior, Context};
/// use tidepool::scheduler::SchedulerConfig;
/// use tidepool::ActorSystem;
///
/// struct Echo;
///
/// impl Actor for Echo {
///     fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
///         Behavior::new().on(|_: &mut Echo, _ctx, text: String| text)
///     }
/// }
///
/// let config = SchedulerConfig::builder().worker_count(2).build().expect("config");
/// let system = ActorSystem::new(config).expect("system");
/// let echo = system.spawn(Echo);
/// let reply: String = echo.ask("hi".to_string()).blocking().expect("reply");
/// assert_eq!(reply, "hi");
/// system.shutdown();
/// ```
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("shards", &self.inner.shards.len())
            .field("running", &self.inner.registry.running())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ActorSystem {
    /// Start the scheduler and the clock.
    ///
    /// # Errors
    ///
    /// The OS error when a thread cannot be spawned.
    pub fn new(config: SchedulerConfig) -> std::io::Result<Self> {
        let clock = ActorClock::start()?;
        let scheduler = match Coordinator::start(config) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                clock.shutdown();
                return Err(err);
            }
        };
        let shards = (0..scheduler.worker_count()).map(ShardContext::new).collect();
        Ok(Self {
            inner: Arc::new(SystemInner {
                scheduler,
                clock,
                registry: ActorRegistry::new(),
                shards,
                live: Mutex::new(HashMap::new()),
                virtual_types: RwLock::new(HashMap::new()),
                virtual_names: RwLock::new(HashMap::new()),
                router: RwLock::new(None),
                next_actor_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn an actor any worker may run.
    pub fn spawn<A: Actor>(&self, actor: A) -> ActorRef {
        ActorCell::spawn(self, actor, None)
    }

    /// Spawn an actor pinned to `shard` (taken modulo the shard count).
    /// Under work stealing it only ever runs on that shard's worker.
    pub fn spawn_on<A: Actor>(&self, shard: usize, actor: A) -> ActorRef {
        self.spawn_pinned(shard % self.shard_count(), actor)
    }

    pub(crate) fn spawn_pinned<A: Actor>(&self, shard: usize, actor: A) -> ActorRef {
        ActorCell::spawn(self, actor, Some(shard))
    }

    /// The worker pool.
    pub fn scheduler(&self) -> &Coordinator {
        &self.inner.scheduler
    }

    /// The timer thread.
    pub fn clock(&self) -> &ActorClock {
        &self.inner.clock
    }

    /// Published and running actors.
    pub fn registry(&self) -> &ActorRegistry {
        &self.inner.registry
    }

    /// Number of shards, one per worker.
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Context of shard `shard`, wrapping around the shard count.
    pub fn shard(&self, shard: usize) -> &ShardContext {
        &self.inner.shards[shard % self.inner.shards.len()]
    }

    /// Publish `actor` under `name`; remote nodes and [`whereis`](Self::whereis)
    /// can then find it. Returns the previous binding.
    pub fn register_named(&self, name: impl Into<String>, actor: &ActorRef) -> Option<ActorRef> {
        self.inner.registry.put_named(name, actor)
    }

    /// Actor published under `name`.
    pub fn whereis(&self, name: &str) -> Option<ActorRef> {
        self.inner.registry.get_named(name)
    }

    /// Location-transparent reference to the `A` instance for `key`.
    pub fn virtual_ref<A: VirtualActor>(&self, key: A::Key) -> VirtualRef<A> {
        VirtualRef::new(self.clone(), key)
    }

    /// The local instance for `key`, ignoring cluster ownership.
    ///
    /// # Errors
    ///
    /// [`SendError::Serialization`] when the key cannot be encoded for hashing.
    pub fn local_actor<A: VirtualActor>(&self, key: &A::Key) -> Result<ActorRef, SendError> {
        let hash = stable_key_hash(&JsonCodec, key)?;
        let vtype = self.virtual_type::<A>();
        Ok(activate_local::<A>(self, &vtype, key, hash))
    }

    /// Make `A` reachable from other nodes. Types are also registered on
    /// first local use, but a node only accepts remote dispatches for types
    /// registered one way or the other.
    pub fn register_virtual<A: VirtualActor>(&self) {
        let _ = self.virtual_type::<A>();
    }

    pub(crate) fn virtual_type<A: VirtualActor>(&self) -> Arc<VirtualType> {
        if let Some(vtype) = self.inner.virtual_types.read().get(&TypeId::of::<A>()) {
            return vtype.clone();
        }
        let mut types = self.inner.virtual_types.write();
        let vtype = types
            .entry(TypeId::of::<A>())
            .or_insert_with(|| Arc::new(VirtualType::new::<A>()))
            .clone();
        let previous = self
            .inner
            .virtual_names
            .write()
            .insert(vtype.name, vtype.clone());
        if previous.is_some_and(|previous| previous.type_id != vtype.type_id) {
            tracing::warn!(actor_type = vtype.name, "virtual actor type name registered twice");
        }
        vtype
    }

    pub(crate) fn virtual_type_by_name(&self, name: &str) -> Option<Arc<VirtualType>> {
        self.inner.virtual_names.read().get(name).cloned()
    }

    /// Purge every instance of `A` on every shard and forget where keys
    /// were placed.
    ///
    /// Meant for tests and benchmarks. Messages in flight to `A` race with
    /// the purge; callers must quiesce traffic to `A` first.
    pub fn clear_directory<A: VirtualActor>(&self) {
        let mut purged = 0;
        for shard in &self.inner.shards {
            let Some(directory) = shard.take_directory::<A, A::Key>() else {
                continue;
            };
            for actor in directory.into_instances() {
                purged += 1;
                let _ = actor.enqueue(MailboxElement::system(SystemMessage::Kill(
                    ExitReason::Kill,
                )));
            }
        }
        if let Some(vtype) = self.inner.virtual_types.read().get(&TypeId::of::<A>()) {
            vtype.clear_placements();
        }
        tracing::debug!(actor_type = A::TYPE_NAME, purged, "directory cleared");
    }

    pub(crate) fn set_router(&self, router: Option<Arc<dyn RemoteRouter>>) {
        let previous = std::mem::replace(&mut *self.inner.router.write(), router);
        drop(previous);
    }

    pub(crate) fn router(&self) -> Option<Arc<dyn RemoteRouter>> {
        self.inner.router.read().clone()
    }

    pub(crate) fn next_actor_id(&self) -> ActorId {
        ActorId(self.inner.next_actor_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn actor_spawned(&self, actor: WeakActorRef) {
        self.inner.live.lock().insert(actor.id(), actor);
        self.inner.registry.inc_running();
    }

    pub(crate) fn actor_terminated(&self, id: ActorId) {
        self.inner.live.lock().remove(&id);
        self.inner.registry.erase(id);
        self.inner.registry.dec_running();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Block until exactly `expected` actors are running or `timeout` passes.
    pub fn await_running_count(&self, expected: usize, timeout: Duration) -> bool {
        self.inner
            .registry
            .await_running_count_equal(expected, timeout)
    }

    /// Terminate every actor with [`ExitReason::UserShutdown`], then stop the
    /// workers and the clock. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_router(None);

        let live: Vec<ActorRef> = self
            .inner
            .live
            .lock()
            .values()
            .filter_map(WeakActorRef::upgrade)
            .collect();
        for actor in &live {
            let _ = actor.enqueue(MailboxElement::system(SystemMessage::Kill(
                ExitReason::UserShutdown,
            )));
        }
        drop(live);

        let on_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.starts_with("tidepool-worker-"));
        if !on_worker && !self.await_running_count(0, SHUTDOWN_GRACE) {
            tracing::warn!(
                running = self.inner.registry.running(),
                "actors still running at shutdown"
            );
        }

        self.inner.scheduler.shutdown();
        self.inner.clock.shutdown();
        for shard in &self.inner.shards {
            shard.clear();
        }
        self.inner.registry.clear();
        tracing::debug!("actor system stopped");
    }
}
