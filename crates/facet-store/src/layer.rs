use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use facet_types::{CacheKey, OptimisticId};

use crate::entry::Entry;

/// One optimistic overlay.
#[derive(Debug)]
struct OptimisticLayer {
    id: OptimisticId,
    entries: HashMap<CacheKey, Arc<Entry>>,
}

/// The base layer plus a stack of optimistic overlays.
///
/// Reads scan from the most recently pushed overlay down to the base, which
/// always exists and is the terminal fallback.
#[derive(Debug, Default)]
pub struct Layers {
    base: HashMap<CacheKey, Arc<Entry>>,
    optimistic: Vec<OptimisticLayer>,
}

impl Layers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The visible entry for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<&Arc<Entry>> {
        self.optimistic
            .iter()
            .rev()
            .find_map(|layer| layer.entries.get(key))
            .or_else(|| self.base.get(key))
    }

    /// The confirmed entry for `key`, ignoring overlays.
    pub fn get_base(&self, key: &CacheKey) -> Option<&Arc<Entry>> {
        self.base.get(key)
    }

    /// Returns `true` if the visible entry comes from an overlay.
    pub fn is_optimistic(&self, key: &CacheKey) -> bool {
        match (self.get(key), self.base.get(key)) {
            (Some(top), Some(base)) => !Arc::ptr_eq(top, base),
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Push a new overlay.
    pub fn push(&mut self, id: OptimisticId) {
        self.optimistic.push(OptimisticLayer {
            id,
            entries: HashMap::new(),
        });
    }

    /// Write into the base layer (`None`) or into the topmost overlay with
    /// the given id. An overlay that is not on the stack yet is pushed first.
    pub fn set(&mut self, target: Option<OptimisticId>, key: CacheKey, entry: Arc<Entry>) {
        let Some(id) = target else {
            self.base.insert(key, entry);
            return;
        };
        match self.optimistic.iter_mut().rev().find(|l| l.id == id) {
            Some(layer) => {
                layer.entries.insert(key, entry);
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(key, entry);
                self.optimistic.push(OptimisticLayer { id, entries });
            }
        }
    }

    /// Returns `true` if any overlay carries `id`.
    pub fn contains_layer(&self, id: OptimisticId) -> bool {
        self.optimistic.iter().any(|l| l.id == id)
    }

    /// Keys written by overlays tagged `id`.
    pub fn keys_in(&self, id: OptimisticId) -> HashSet<CacheKey> {
        self.optimistic
            .iter()
            .filter(|l| l.id == id)
            .flat_map(|l| l.entries.keys().cloned())
            .collect()
    }

    /// Remove every overlay tagged `id`. Returns the keys they held, or
    /// `None` if there was no such overlay.
    pub fn remove(&mut self, id: OptimisticId) -> Option<HashSet<CacheKey>> {
        if !self.contains_layer(id) {
            return None;
        }
        let mut keys = HashSet::new();
        self.optimistic.retain(|layer| {
            if layer.id == id {
                keys.extend(layer.entries.keys().cloned());
                false
            } else {
                true
            }
        });
        Some(keys)
    }

    /// Number of overlays on the stack.
    pub fn depth(&self) -> usize {
        self.optimistic.len()
    }

    /// Drop the base entry for `key`. Refused while an overlay holds the key.
    pub fn evict(&mut self, key: &CacheKey) -> bool {
        if self.is_optimistic(key) {
            return false;
        }
        self.base.remove(key).is_some()
    }
}
