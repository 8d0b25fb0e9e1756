//! Weak table of proxies standing in for remote actors.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tidepool_core::{ActorId, NodeId};

use crate::actor::{ActorRef, ExitReason};
use crate::cluster::ActorProxy;

/// Proxies keyed by `(node, actor)`.
///
/// Entries are weak: a proxy lives as long as some [`ActorRef`] uses it and
/// removes its own entry when dropped. When a node disconnects, every proxy
/// for it is killed with [`ExitReason::RemoteLinkUnreachable`].
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: Mutex<HashMap<(NodeId, ActorId), Weak<ActorProxy>>>,
}

impl ProxyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live proxy for `(node, id)`.
    pub fn get(&self, node: NodeId, id: ActorId) -> Option<ActorRef> {
        let proxy = self.proxies.lock().get(&(node, id))?.upgrade()?;
        Some(ActorRef::from_arc(proxy))
    }

    /// Live proxy for `(node, id)`, created with `make` when missing.
    pub(crate) fn get_or_put(
        &self,
        node: NodeId,
        id: ActorId,
        make: impl FnOnce() -> Arc<ActorProxy>,
    ) -> ActorRef {
        let mut proxies = self.proxies.lock();
        if let Some(proxy) = proxies.get(&(node, id)).and_then(Weak::upgrade) {
            return ActorRef::from_arc(proxy);
        }
        let proxy = make();
        proxies.insert((node, id), Arc::downgrade(&proxy));
        ActorRef::from_arc(proxy)
    }

    /// Every live proxy for `node`.
    pub fn get_all(&self, node: NodeId) -> Vec<ActorRef> {
        let live: Vec<Arc<ActorProxy>> = self
            .proxies
            .lock()
            .iter()
            .filter(|((owner, _), _)| *owner == node)
            .filter_map(|(_, proxy)| proxy.upgrade())
            .collect();
        live.into_iter()
            .map(|proxy| ActorRef::from_arc(proxy))
            .collect()
    }

    /// Number of entries for `node`, live or not yet cleaned up.
    pub fn count(&self, node: NodeId) -> usize {
        self.proxies
            .lock()
            .keys()
            .filter(|(owner, _)| *owner == node)
            .count()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.proxies.lock().len()
    }

    /// Whether no proxy is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and kill every proxy for `node`.
    pub fn erase(&self, node: NodeId, reason: ExitReason) {
        let mut removed = Vec::new();
        self.proxies.lock().retain(|(owner, _), proxy| {
            if *owner != node {
                return true;
            }
            removed.extend(proxy.upgrade());
            false
        });
        if !removed.is_empty() {
            tracing::debug!(%node, proxies = removed.len(), %reason, "purging proxies");
        }
        // Killing notifies observers; never do that under the table lock.
        for proxy in removed {
            proxy.kill(reason.clone());
        }
    }

    /// Remove and kill one proxy.
    pub fn erase_one(&self, node: NodeId, id: ActorId, reason: ExitReason) {
        let removed = self
            .proxies
            .lock()
            .remove(&(node, id))
            .and_then(|proxy| proxy.upgrade());
        if let Some(proxy) = removed {
            proxy.kill(reason);
        }
    }

    /// Kill every proxy.
    pub fn clear(&self, reason: ExitReason) {
        let removed: Vec<Arc<ActorProxy>> = self
            .proxies
            .lock()
            .drain()
            .filter_map(|(_, proxy)| proxy.upgrade())
            .collect();
        for proxy in removed {
            proxy.kill(reason.clone());
        }
    }

    /// Drop the entry of a proxy being destroyed, unless a new proxy took
    /// its place already.
    pub(crate) fn remove_dead(&self, node: NodeId, id: ActorId) {
        let mut proxies = self.proxies.lock();
        if proxies
            .get(&(node, id))
            .is_some_and(|proxy| proxy.strong_count() == 0)
        {
            proxies.remove(&(node, id));
        }
    }
}
