//! Per-shard ownership of virtual actor directories.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::actor::ActorRef;

/// Key to instance map of one virtual actor type on one shard.
#[derive(Debug)]
pub struct Directory<K> {
    instances: HashMap<K, ActorRef>,
}

impl<K> Default for Directory<K> {
    fn default() -> Self {
        Self {
            instances: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> Directory<K> {
    /// Live instance for `key`. Terminated instances are treated as absent.
    pub fn get(&self, key: &K) -> Option<ActorRef> {
        self.instances
            .get(key)
            .filter(|actor| !actor.is_terminated())
            .cloned()
    }

    /// Keep the live instance for `key` if there is one, otherwise store
    /// `fresh`. Returns the winner and whatever lost, for the caller to drop
    /// outside any lock.
    pub(crate) fn get_or_insert(&mut self, key: K, fresh: ActorRef) -> (ActorRef, Option<ActorRef>) {
        if let Some(existing) = self.get(&key) {
            return (existing, Some(fresh));
        }
        let replaced = self.instances.insert(key, fresh.clone());
        (fresh, replaced)
    }

    /// Number of entries, including terminated ones not yet replaced.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the directory has no entry.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(crate) fn into_instances(self) -> impl Iterator<Item = ActorRef> {
        self.instances.into_values()
    }
}

/// State owned by one shard: the directories of every virtual actor type
/// placed on it.
///
/// Directories are created on first use and are keyed by actor type, so a
/// shard needs no compile-time knowledge of the types it hosts.
pub struct ShardContext {
    shard: usize,
    directories: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard", &self.shard)
            .field("types", &self.directories.lock().len())
            .finish()
    }
}

impl ShardContext {
    /// Empty context for `shard`.
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            directories: Mutex::new(HashMap::new()),
        }
    }

    /// Shard id, also the worker the shard's actors are pinned to.
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Run `f` on the directory of type `T` keyed by `K`, creating it if
    /// needed. The shard's directory table stays locked while `f` runs.
    pub(crate) fn with_directory<T, K, R>(&self, f: impl FnOnce(&mut Directory<K>) -> R) -> R
    where
        T: 'static,
        K: Eq + Hash + Send + 'static,
    {
        let mut directories = self.directories.lock();
        let entry = directories
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Directory::<K>::default()));
        match entry.downcast_mut::<Directory<K>>() {
            Some(directory) => f(directory),
            // Keyed by `T`, whose key type is fixed.
            None => f(&mut Directory::default()),
        }
    }

    /// Remove the directory of type `T`.
    pub(crate) fn take_directory<T, K>(&self) -> Option<Directory<K>>
    where
        T: 'static,
        K: Eq + Hash + Send + 'static,
    {
        let removed = self.directories.lock().remove(&TypeId::of::<T>())?;
        removed.downcast::<Directory<K>>().ok().map(|directory| *directory)
    }

    /// Drop every directory. Instances no longer referenced elsewhere
    /// terminate as unreachable.
    pub(crate) fn clear(&self) {
        let directories = std::mem::take(&mut *self.directories.lock());
        drop(directories);
    }

    /// Number of entries of type `T` on this shard.
    pub fn instance_count<T, K>(&self) -> usize
    where
        T: 'static,
        K: Eq + Hash + Send + 'static,
    {
        self.directories
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|directory| directory.downcast_ref::<Directory<K>>())
            .map_or(0, Directory::len)
    }
}
