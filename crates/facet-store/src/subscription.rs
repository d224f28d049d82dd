use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use facet_types::CacheKey;
use tracing::debug;

use crate::entry::Entry;

/// What a subscriber receives: the visible entry for one key.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub key: CacheKey,
    pub entry: Arc<Entry>,
    /// `true` when the entry comes from an optimistic layer.
    pub is_optimistic: bool,
}

/// Subscriber callback.
pub type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Per-key observer lists.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    listeners: Mutex<HashMap<CacheKey, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub(crate) fn add(self: &Arc<Self>, key: CacheKey, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("subscriber lock poisoned")
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        Subscription {
            key,
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, key: &CacheKey, id: u64) {
        let mut listeners = self.listeners.lock().expect("subscriber lock poisoned");
        if let Some(list) = listeners.get_mut(key) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                listeners.remove(key);
            }
        }
    }

    pub(crate) fn count(&self, key: &CacheKey) -> usize {
        self.listeners
            .lock()
            .expect("subscriber lock poisoned")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Deliver each snapshot to the listeners of its key. Callbacks run
    /// without any lock held.
    pub(crate) fn notify(&self, snapshots: &[Snapshot]) {
        for snapshot in snapshots {
            let listeners: Vec<Listener> = {
                let guard = self.listeners.lock().expect("subscriber lock poisoned");
                match guard.get(&snapshot.key) {
                    Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                    None => continue,
                }
            };
            for listener in listeners {
                listener(snapshot);
            }
        }
    }
}

/// Handle for one registered listener. Dropping it unsubscribes.
pub struct Subscription {
    key: CacheKey,
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// The key this subscription observes.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
            debug!(key = %self.key, id = self.id, "unsubscribed");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
