use std::collections::HashSet;
use std::sync::Arc;

use facet_types::{CacheKey, ListCacheKey, ObjectCacheKey, ObjectInstance, OptimisticId, Status};
use tracing::trace;

use crate::changes::ChangedObjects;
use crate::entry::{now_ms, CacheValue, Entry};
use crate::layer::Layers;

/// Options for [`Store::batch`](crate::Store::batch).
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    /// Write into a fresh optimistic layer with this id instead of the base.
    pub optimistic_id: Option<OptimisticId>,
}

impl BatchOptions {
    /// Options for a batch against confirmed state.
    pub fn base() -> Self {
        Self::default()
    }

    /// Options for a batch on a new optimistic layer.
    pub fn optimistic(id: OptimisticId) -> Self {
        Self {
            optimistic_id: Some(id),
        }
    }
}

/// What a completed batch produced.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// The body's return value.
    pub value: R,
    /// Net object changes recorded by the body.
    pub changes: ChangedObjects,
    /// Keys whose visible entry changed, in first-touch order.
    pub touched: Vec<CacheKey>,
}

/// Scoped unit of work for one synchronous mutation sequence.
///
/// Tracks every key whose visible entry changes, the net [`ChangedObjects`]
/// delta, and which lists were rewritten. A context only lives for the
/// duration of one [`Store::batch`](crate::Store::batch) call.
pub struct BatchContext<'a> {
    layers: &'a mut Layers,
    optimistic_id: Option<OptimisticId>,
    touched: Vec<CacheKey>,
    touched_set: HashSet<CacheKey>,
    changes: ChangedObjects,
    modified_lists: HashSet<ListCacheKey>,
    now: u64,
}

impl<'a> BatchContext<'a> {
    pub(crate) fn new(layers: &'a mut Layers, optimistic_id: Option<OptimisticId>) -> Self {
        Self {
            layers,
            optimistic_id,
            touched: Vec::new(),
            touched_set: HashSet::new(),
            changes: ChangedObjects::new(),
            modified_lists: HashSet::new(),
            now: now_ms(),
        }
    }

    /// Returns `true` if writes in this batch land in an optimistic layer.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some()
    }

    /// The optimistic layer this batch writes into, if any.
    pub fn optimistic_id(&self) -> Option<OptimisticId> {
        self.optimistic_id
    }

    /// The entry this batch's writes are compared against: the visible entry
    /// for optimistic batches, the base entry otherwise.
    pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        match self.optimistic_id {
            Some(_) => self.layers.get(key).cloned(),
            None => self.layers.get_base(key).cloned(),
        }
    }

    /// Write `value` with `status` to `key`.
    ///
    /// A value deep-equal to the current one is not replaced: if the status is
    /// also unchanged the existing entry is returned as is, otherwise a new
    /// entry reusing the existing value allocation is written.
    pub fn write(&mut self, key: CacheKey, value: CacheValue, status: Status) -> Arc<Entry> {
        let current = self.read(&key);
        let value = match &current {
            Some(existing) if existing.value == value => {
                if existing.status == status {
                    return Arc::clone(existing);
                }
                existing.value.clone()
            }
            _ => value,
        };

        let entry = Arc::new(Entry {
            key: key.clone(),
            value,
            status,
            last_updated: self.now,
        });
        self.put(key, Arc::clone(&entry));
        entry
    }

    /// Change only the status of `key`, keeping its value.
    pub fn set_status(&mut self, key: CacheKey, status: Status) -> Arc<Entry> {
        let value = self
            .read(&key)
            .map(|e| e.value.clone())
            .unwrap_or(CacheValue::Empty);
        self.write(key, value, status)
    }

    /// Write an object to its owning entry and record the change.
    ///
    /// The change is recorded only if the stored value actually changed.
    pub fn write_object(&mut self, object: Arc<ObjectInstance>, status: Status) -> Arc<Entry> {
        let key = CacheKey::Object(object.cache_key());
        let previous = self.read(&key);
        let entry = self.write(key, CacheValue::Object(object), status);

        let value_changed = previous
            .as_ref()
            .map_or(true, |p| !p.value.same_allocation(&entry.value));
        if value_changed {
            if let Some(stored) = entry.value.as_object() {
                let is_new = previous
                    .as_ref()
                    .map_or(true, |p| p.value.as_object().is_none());
                self.changes.register_object(Arc::clone(stored), is_new);
            }
        }
        entry
    }

    /// Tombstone an object and record it as removed.
    pub fn delete(&mut self, key: ObjectCacheKey) -> Arc<Entry> {
        let cache_key = CacheKey::Object(key.clone());
        let existed = self
            .read(&cache_key)
            .is_some_and(|e| e.value.as_object().is_some());
        let entry = self.write(cache_key, CacheValue::Tombstone, Status::Loaded);
        if existed {
            self.changes.register_removed(key);
        }
        entry
    }

    /// Record that `key`'s sequence was rewritten in this batch. Returns
    /// `false` if it already was.
    pub fn mark_list_modified(&mut self, key: ListCacheKey) -> bool {
        self.modified_lists.insert(key)
    }

    /// Returns `true` if `key`'s sequence was already rewritten in this
    /// batch. Propagation skips such lists.
    pub fn is_list_modified(&self, key: &ListCacheKey) -> bool {
        self.modified_lists.contains(key)
    }

    /// Net object changes so far.
    pub fn changes(&self) -> &ChangedObjects {
        &self.changes
    }

    /// Keys touched so far.
    pub fn touched(&self) -> &[CacheKey] {
        &self.touched
    }

    pub(crate) fn into_parts(self) -> (Vec<CacheKey>, ChangedObjects) {
        (self.touched, self.changes)
    }

    fn put(&mut self, key: CacheKey, entry: Arc<Entry>) {
        let before = self.layers.get(&key).cloned();
        self.layers.set(self.optimistic_id, key.clone(), Arc::clone(&entry));
        let visible_changed = match (before, self.layers.get(&key)) {
            (Some(a), Some(b)) => !Arc::ptr_eq(&a, b),
            (None, Some(_)) => true,
            _ => false,
        };
        trace!(key = %key, status = %entry.status, visible_changed, "entry written");
        if visible_changed && self.touched_set.insert(key.clone()) {
            self.touched.push(key);
        }
    }
}
