//! Virtual actors: instances addressed by key and activated on demand.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tidepool_core::{JsonCodec, MessageCodec, NodeId, stable_hash};

use super::placement::{ModuloPlacement, PlacementStrategy};
use crate::actor::{Actor, ActorRef, Ask, WeakActorRef};
use crate::cluster::WireMessage;
use crate::error::SendError;
use crate::system::{ActorSystem, RemoteRouter};

/// How many instances of one key may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// One instance per key in the whole cluster, placed on the node owning
    /// the key's position on the ring.
    #[default]
    Singleton,
    /// Stateless worker: one instance per key on each of up to
    /// `max_activations` local shards, used in turn. Never remote.
    Local {
        /// Upper bound on shards used per key.
        max_activations: usize,
    },
}

/// An actor type addressed by key rather than by reference.
///
/// Instances are created with [`activate`](Self::activate) the first time a
/// key is used and live in the directory of the shard chosen by the type's
/// [`PlacementStrategy`]. Message types listed in [`register`](Self::register)
/// can also reach instances hosted by other nodes.
///
/// ```rust
/// use tidepool::actor::{Actor, Behavior, Context};
/// use tidepool::directory::{HandlerTable, VirtualActor};
///
/// struct Account { balance: i64 }
///
/// impl Actor for Account {
///     fn behavior(&mut self, _ctx: &mut Context<Self>) -> Behavior<Self> {
///         Behavior::new()
///             .on(|this: &mut Account, _ctx, amount: i64| this.balance += amount)
///             .on(|this: &mut Account, _ctx, _: ()| this.balance)
///     }
/// }
///
/// impl VirtualActor for Account {
///     type Key = String;
///     const TYPE_NAME: &'static str = "account";
///
///     fn activate(_key: &String) -> Self {
///         Account { balance: 0 }
///     }
///
///     fn register(handlers: &mut HandlerTable<Self>) {
///         handlers.tell::<i64>("deposit").ask::<(), i64>("balance");
///     }
/// }
/// ```
pub trait VirtualActor: Actor {
    /// Logical key.
    type Key: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + Debug + 'static;

    /// Name of the type on the wire; must match on every node.
    const TYPE_NAME: &'static str;

    /// Activation kind.
    const ACTIVATION: Activation = Activation::Singleton;

    /// Create the instance for `key`.
    fn activate(key: &Self::Key) -> Self;

    /// Message types accepted from other nodes.
    fn register(_handlers: &mut HandlerTable<Self>) {}

    /// Shard placement on the local node.
    fn placement() -> Box<dyn PlacementStrategy> {
        Box::new(ModuloPlacement)
    }
}

/// Type-erased handler ids of one virtual actor type.
#[derive(Debug, Default)]
pub(crate) struct Handlers {
    by_type: HashMap<TypeId, Arc<WireMessage>>,
    by_id: HashMap<&'static str, Arc<WireMessage>>,
}

impl Handlers {
    pub(crate) fn by_type(&self, type_id: TypeId) -> Option<&Arc<WireMessage>> {
        self.by_type.get(&type_id)
    }

    pub(crate) fn by_id(&self, id: &str) -> Option<&Arc<WireMessage>> {
        self.by_id.get(id)
    }

    fn insert(&mut self, wire: WireMessage) {
        let wire = Arc::new(wire);
        if let Some(previous) = self.by_id.insert(wire.name, wire.clone()) {
            self.by_type.remove(&previous.type_id);
        }
        self.by_type.insert(wire.type_id, wire);
    }
}

/// Remote entry points of a virtual actor type, filled in by
/// [`VirtualActor::register`].
///
/// Each entry binds a handler id to a message type; the actor's behavior
/// must handle that type.
pub struct HandlerTable<A> {
    handlers: Handlers,
    _actor: PhantomData<fn() -> A>,
}

impl<A: VirtualActor> HandlerTable<A> {
    fn new() -> Self {
        Self {
            handlers: Handlers::default(),
            _actor: PhantomData,
        }
    }

    /// Accept `M` as a plain message under `id`.
    pub fn tell<M>(&mut self, id: &'static str) -> &mut Self
    where
        M: Serialize + DeserializeOwned + Any + Send,
    {
        self.handlers.insert(WireMessage::of::<M, ()>(id));
        self
    }

    /// Accept `M` as a request under `id`, answered with `R`.
    pub fn ask<M, R>(&mut self, id: &'static str) -> &mut Self
    where
        M: Serialize + DeserializeOwned + Any + Send,
        R: Serialize + DeserializeOwned + Any + Send,
    {
        self.handlers.insert(WireMessage::of::<M, R>(id));
        self
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.handlers.by_id.contains_key(id)
    }

    /// Number of registered ids.
    pub fn len(&self) -> usize {
        self.handlers.by_id.len()
    }

    /// Whether no id is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.by_id.is_empty()
    }
}

/// Sweeps of remembered placements never start below this many entries.
const MIN_PLACEMENT_SWEEP: usize = 64;

/// Shard remembered for a key hash.
enum Placed {
    /// Chosen, instance not stored yet.
    Reserved(usize),
    Active(usize, WeakActorRef),
}

impl Placed {
    fn shard(&self) -> usize {
        match self {
            Placed::Reserved(shard) | Placed::Active(shard, _) => *shard,
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Placed::Reserved(_) => true,
            Placed::Active(_, instance) => instance.is_alive(),
        }
    }
}

/// Choices of an impure placement strategy, kept while their instance lives.
struct Placements {
    by_hash: HashMap<u64, Placed>,
    sweep_at: usize,
}

impl Default for Placements {
    fn default() -> Self {
        Self {
            by_hash: HashMap::new(),
            sweep_at: MIN_PLACEMENT_SWEEP,
        }
    }
}

type LocalFn = Box<dyn Fn(&ActorSystem, &[u8]) -> Result<ActorRef, SendError> + Send + Sync>;

/// Runtime entry for one registered virtual actor type.
pub(crate) struct VirtualType {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
    pub(crate) activation: Activation,
    pub(crate) handlers: Handlers,
    placement: Box<dyn PlacementStrategy>,
    placed: Mutex<Placements>,
    next_local: AtomicUsize,
    local: LocalFn,
}

impl std::fmt::Debug for VirtualType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualType")
            .field("name", &self.name)
            .field("activation", &self.activation)
            .finish()
    }
}

impl VirtualType {
    pub(crate) fn new<A: VirtualActor>() -> Self {
        let mut table = HandlerTable::<A>::new();
        A::register(&mut table);
        Self {
            type_id: TypeId::of::<A>(),
            name: A::TYPE_NAME,
            activation: A::ACTIVATION,
            handlers: table.handlers,
            placement: A::placement(),
            placed: Mutex::new(Placements::default()),
            next_local: AtomicUsize::new(0),
            local: Box::new(|system, key_bytes| {
                let key: A::Key = JsonCodec.decode(key_bytes)?;
                let vtype = system.virtual_type::<A>();
                Ok(activate_local::<A>(system, &vtype, &key, stable_hash(key_bytes)))
            }),
        }
    }

    /// Local instance for an encoded key, activated if needed.
    pub(crate) fn local_instance(&self, system: &ActorSystem, key_bytes: &[u8]) -> Result<ActorRef, SendError> {
        (self.local)(system, key_bytes)
    }

    /// Shard for a key.
    ///
    /// Singletons placed by an impure strategy stay on the shard chosen for
    /// their live instance; a fresh choice is reserved until
    /// [`record_placement`](Self::record_placement) records the instance.
    pub(crate) fn shard_for(&self, hash: u64, shard_count: usize) -> usize {
        let shard_count = shard_count.max(1);
        match self.activation {
            Activation::Singleton if self.placement.is_pure() => {
                self.placement.place(hash, shard_count).min(shard_count - 1)
            }
            Activation::Singleton => {
                let mut placed = self.placed.lock();
                if let Some(entry) = placed.by_hash.get(&hash)
                    && entry.is_live()
                {
                    return entry.shard().min(shard_count - 1);
                }
                let shard = self.placement.place(hash, shard_count).min(shard_count - 1);
                placed.by_hash.insert(hash, Placed::Reserved(shard));
                shard
            }
            Activation::Local { max_activations } => {
                let spread = max_activations.clamp(1, shard_count);
                self.next_local.fetch_add(1, Ordering::Relaxed) % spread
            }
        }
    }

    /// Record the instance living on `shard` for `hash`. Entries whose
    /// instance terminated are swept once the table doubles past its last
    /// live size.
    pub(crate) fn record_placement(&self, hash: u64, shard: usize, instance: &ActorRef) {
        if self.activation != Activation::Singleton || self.placement.is_pure() {
            return;
        }
        let mut placed = self.placed.lock();
        placed
            .by_hash
            .insert(hash, Placed::Active(shard, instance.downgrade()));
        if placed.by_hash.len() >= placed.sweep_at {
            placed.by_hash.retain(|_, entry| entry.is_live());
            placed.sweep_at = (placed.by_hash.len() * 2).max(MIN_PLACEMENT_SWEEP);
        }
    }

    /// Number of remembered placements.
    pub(crate) fn placement_count(&self) -> usize {
        self.placed.lock().by_hash.len()
    }

    /// Forget remembered placements.
    pub(crate) fn clear_placements(&self) {
        *self.placed.lock() = Placements::default();
    }
}

/// Instance of `A` for `key` on the shard chosen for it.
///
/// Activation happens outside the directory lock so that `behavior()` may
/// resolve other virtual actors. Two threads racing on a new key may both
/// activate an instance; only one is stored and the other terminates as
/// unreachable.
pub(crate) fn activate_local<A: VirtualActor>(
    system: &ActorSystem,
    vtype: &VirtualType,
    key: &A::Key,
    hash: u64,
) -> ActorRef {
    let shard = vtype.shard_for(hash, system.shard_count());
    let context = system.shard(shard);
    if let Some(existing) = context.with_directory::<A, A::Key, _>(|directory| directory.get(key)) {
        vtype.record_placement(hash, shard, &existing);
        return existing;
    }

    tracing::debug!(actor_type = A::TYPE_NAME, ?key, shard, "activating");
    let fresh = system.spawn_pinned(shard, A::activate(key));
    let (winner, loser) = context
        .with_directory::<A, A::Key, _>(|directory| directory.get_or_insert(key.clone(), fresh));
    drop(loser);
    vtype.record_placement(hash, shard, &winner);
    winner
}

/// Where a virtual reference currently resolves.
pub(crate) enum Location {
    Local(ActorRef),
    Remote {
        router: Arc<dyn RemoteRouter>,
        node: NodeId,
        vtype: Arc<VirtualType>,
        key_bytes: Vec<u8>,
        hash: u64,
    },
}

/// Location-transparent reference to the virtual actor `A` with a key.
///
/// Resolution happens on every send, so a reference keeps working while
/// ownership of the key moves between nodes.
pub struct VirtualRef<A: VirtualActor> {
    system: ActorSystem,
    key: A::Key,
    _actor: PhantomData<fn() -> A>,
}

impl<A: VirtualActor> Clone for VirtualRef<A> {
    fn clone(&self) -> Self {
        Self {
            system: self.system.clone(),
            key: self.key.clone(),
            _actor: PhantomData,
        }
    }
}

impl<A: VirtualActor> Debug for VirtualRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRef")
            .field("type", &A::TYPE_NAME)
            .field("key", &self.key)
            .finish()
    }
}

impl<A: VirtualActor> VirtualRef<A> {
    pub(crate) fn new(system: ActorSystem, key: A::Key) -> Self {
        Self {
            system,
            key,
            _actor: PhantomData,
        }
    }

    /// The logical key.
    pub fn key(&self) -> &A::Key {
        &self.key
    }

    pub(crate) fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub(crate) fn locate(&self) -> Result<Location, SendError> {
        let vtype = self.system.virtual_type::<A>();
        let key_bytes = JsonCodec.encode(&self.key)?;
        let hash = stable_hash(&key_bytes);
        if vtype.activation == Activation::Singleton
            && let Some(router) = self.system.router()
            && let Some(node) = router.owner_of(hash)
        {
            return Ok(Location::Remote {
                router,
                node,
                vtype,
                key_bytes,
                hash,
            });
        }
        Ok(Location::Local(activate_local::<A>(
            &self.system,
            &vtype,
            &self.key,
            hash,
        )))
    }

    /// Reference to the instance that owns the key right now: a local actor
    /// or a proxy for the owning node.
    ///
    /// A proxy cannot be monitored or linked: observers attached to it are
    /// told at once that it is down with [`ExitReason::Unreachable`].
    ///
    /// [`ExitReason::Unreachable`]: crate::actor::ExitReason::Unreachable
    ///
    /// # Errors
    ///
    /// [`SendError::Serialization`] when the key cannot be encoded.
    pub fn resolve(&self) -> Result<ActorRef, SendError> {
        Ok(match self.locate()? {
            Location::Local(actor) => actor,
            Location::Remote {
                router,
                node,
                vtype,
                key_bytes,
                hash,
            } => crate::cluster::VirtualProxy::spawn(router, node, vtype, key_bytes, hash),
        })
    }

    /// Send `message` to the key's instance.
    ///
    /// # Errors
    ///
    /// See [`ActorRef::tell`]; remote sends also fail with
    /// [`SendError::UnknownHandler`] for unregistered message types and
    /// [`SendError::NoRoute`] when the owner is unreachable.
    pub fn tell<M: Any + Send>(&self, message: M) -> Result<(), SendError> {
        self.resolve()?.tell(message)
    }

    /// Request to the key's instance.
    pub fn ask<R: Any + Send, M: Any + Send>(&self, message: M) -> Ask<R> {
        match self.resolve() {
            Ok(actor) => actor.ask(message),
            Err(err) => Ask::failed(err.into()),
        }
    }
}
