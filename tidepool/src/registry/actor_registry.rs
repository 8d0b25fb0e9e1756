//! Published local actors and the running-actor count.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tidepool_core::ActorId;

use crate::actor::ActorRef;

/// Local actors reachable by id or name.
///
/// Only published actors are held here; the registry keeps them alive until
/// they terminate or are erased. It also tracks how many actors of the
/// system are running, which shutdown code and tests wait on.
#[derive(Default)]
pub struct ActorRegistry {
    by_id: RwLock<HashMap<ActorId, ActorRef>>,
    by_name: RwLock<HashMap<String, ActorRef>>,
    running: Mutex<usize>,
    running_changed: Condvar,
}

impl std::fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("published", &self.by_id.read().len())
            .field("named", &self.by_name.read().len())
            .field("running", &self.running())
            .finish()
    }
}

impl ActorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `actor` under its id so remote peers can address it.
    pub fn put(&self, actor: &ActorRef) {
        self.by_id.write().insert(actor.id(), actor.clone());
        // It may have terminated before the insert; don't keep it around.
        if actor.is_terminated() {
            self.erase(actor.id());
        }
    }

    /// Published actor with `id`.
    pub fn get(&self, id: ActorId) -> Option<ActorRef> {
        self.by_id.read().get(&id).cloned()
    }

    /// Remove `id` and every name bound to it.
    pub fn erase(&self, id: ActorId) {
        // References are dropped after the locks are released: dropping the
        // last one terminates the actor, which calls back into the registry.
        let removed = self.by_id.write().remove(&id);
        let mut unbound = Vec::new();
        self.by_name.write().retain(|_, actor| {
            if actor.id() == id {
                unbound.push(actor.clone());
                false
            } else {
                true
            }
        });
        drop(removed);
        drop(unbound);
    }

    /// Bind `name` to `actor`, returning the previous binding.
    pub fn put_named(&self, name: impl Into<String>, actor: &ActorRef) -> Option<ActorRef> {
        self.put(actor);
        let previous = self.by_name.write().insert(name.into(), actor.clone());
        if actor.is_terminated() {
            self.erase(actor.id());
        }
        previous
    }

    /// Actor bound to `name`.
    pub fn get_named(&self, name: &str) -> Option<ActorRef> {
        self.by_name.read().get(name).cloned()
    }

    /// Remove the binding for `name`; the actor stays published by id.
    pub fn erase_named(&self, name: &str) -> Option<ActorRef> {
        self.by_name.write().remove(name)
    }

    /// All bound names.
    pub fn named(&self) -> Vec<String> {
        self.by_name.read().keys().cloned().collect()
    }

    /// Number of published actors.
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    /// Whether nothing is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every publication.
    pub fn clear(&self) {
        let by_id = std::mem::take(&mut *self.by_id.write());
        let by_name = std::mem::take(&mut *self.by_name.write());
        drop(by_id);
        drop(by_name);
    }

    /// Actors spawned and not yet terminated.
    pub fn running(&self) -> usize {
        *self.running.lock()
    }

    pub(crate) fn inc_running(&self) {
        *self.running.lock() += 1;
        self.running_changed.notify_all();
    }

    pub(crate) fn dec_running(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        self.running_changed.notify_all();
    }

    /// Block until exactly `expected` actors run, or `timeout` passes.
    /// Returns whether the count was reached.
    pub fn await_running_count_equal(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.running.lock();
        while *running != expected {
            if self
                .running_changed
                .wait_until(&mut running, deadline)
                .timed_out()
            {
                return *running == expected;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_running_count_wakes_waiter() {
        let registry = Arc::new(ActorRegistry::new());
        registry.inc_running();
        registry.inc_running();

        let waiter = {
            let registry = registry.clone();
            thread::spawn(move || registry.await_running_count_equal(0, Duration::from_secs(5)))
        };
        registry.dec_running();
        registry.dec_running();
        assert!(waiter.join().expect("waiter thread"));
    }

    #[test]
    fn test_running_count_times_out() {
        let registry = ActorRegistry::new();
        registry.inc_running();
        assert!(!registry.await_running_count_equal(0, Duration::from_millis(20)));
        assert_eq!(registry.running(), 1);
    }
}
