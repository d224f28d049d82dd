use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Slot {
    refs: usize,
    /// Set while `refs` is zero.
    idle_since: Option<Instant>,
}

/// Reference counts with a keep-alive window.
///
/// A key whose count drops to zero is not collected at once: it becomes
/// collectable `keep_alive` after it went idle, and a retain in between
/// revives it. Keys are only tracked once registered or retained.
#[derive(Debug)]
pub struct RefCounts<K> {
    keep_alive: Duration,
    slots: HashMap<K, Slot>,
}

impl<K: Hash + Eq + Clone> RefCounts<K> {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            slots: HashMap::new(),
        }
    }

    /// Start tracking `key` with no references. An unretained key that is
    /// already tracked restarts its idle clock; a retained one is untouched.
    pub fn register(&mut self, key: K, now: Instant) {
        let slot = self.slots.entry(key).or_insert(Slot {
            refs: 0,
            idle_since: Some(now),
        });
        if slot.refs == 0 {
            slot.idle_since = Some(now);
        }
    }

    /// Add one reference to `key`.
    pub fn retain(&mut self, key: K) {
        let slot = self.slots.entry(key).or_insert(Slot {
            refs: 0,
            idle_since: None,
        });
        slot.refs += 1;
        slot.idle_since = None;
    }

    /// Drop one reference. Returns `true` when the key went idle.
    pub fn release(&mut self, key: &K, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        if slot.refs == 0 {
            return false;
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.idle_since = Some(now);
            return true;
        }
        false
    }

    /// Current reference count of `key`, `None` if untracked.
    pub fn count(&self, key: &K) -> Option<usize> {
        self.slots.get(key).map(|s| s.refs)
    }

    /// Stop tracking every key idle for at least the keep-alive window and
    /// return them.
    pub fn collect(&mut self, now: Instant) -> Vec<K> {
        let keep_alive = self.keep_alive;
        let expired: Vec<K> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= keep_alive)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.slots.remove(key);
        }
        expired
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
