use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use facet_types::{ObjectCacheKey, ObjectInstance, PrimaryKey};

/// Net object changes of one batch, grouped by object type.
///
/// Repeated writes to one object collapse to the last value. An object that
/// was added and then modified in the same batch stays "added". Removal wins
/// over both.
#[derive(Clone, Default)]
pub struct ChangedObjects {
    added: BTreeMap<String, BTreeMap<PrimaryKey, Arc<ObjectInstance>>>,
    modified: BTreeMap<String, BTreeMap<PrimaryKey, Arc<ObjectInstance>>>,
    removed: BTreeMap<String, BTreeMap<PrimaryKey, ObjectCacheKey>>,
}

impl ChangedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a written object. `is_new` is `true` when the object had no
    /// entry before this write.
    pub fn register_object(&mut self, object: Arc<ObjectInstance>, is_new: bool) {
        let ty = object.object_type().to_string();
        let pk = object.primary_key().clone();

        if let Some(removed) = self.removed.get_mut(&ty) {
            removed.remove(&pk);
        }

        let already_added = self
            .added
            .get(&ty)
            .is_some_and(|objects| objects.contains_key(&pk));
        if is_new || already_added {
            self.added.entry(ty).or_default().insert(pk, object);
        } else {
            self.modified.entry(ty).or_default().insert(pk, object);
        }
    }

    /// Record a deleted object.
    pub fn register_removed(&mut self, key: ObjectCacheKey) {
        let ty = key.object_type().to_string();
        let pk = key.primary_key().clone();
        if let Some(added) = self.added.get_mut(&ty) {
            added.remove(&pk);
        }
        if let Some(modified) = self.modified.get_mut(&ty) {
            modified.remove(&pk);
        }
        self.removed.entry(ty).or_default().insert(pk, key);
    }

    /// Objects of `object_type` that did not exist before the batch.
    pub fn added(&self, object_type: &str) -> impl Iterator<Item = &Arc<ObjectInstance>> {
        self.added.get(object_type).into_iter().flat_map(|m| m.values())
    }

    /// Existing objects of `object_type` whose value changed.
    pub fn modified(&self, object_type: &str) -> impl Iterator<Item = &Arc<ObjectInstance>> {
        self.modified.get(object_type).into_iter().flat_map(|m| m.values())
    }

    /// Objects of `object_type` that were deleted.
    pub fn removed(&self, object_type: &str) -> impl Iterator<Item = &ObjectCacheKey> {
        self.removed.get(object_type).into_iter().flat_map(|m| m.values())
    }

    /// Returns `true` if anything of `object_type` changed.
    pub fn touches_type(&self, object_type: &str) -> bool {
        [
            self.added.get(object_type).map(BTreeMap::len),
            self.modified.get(object_type).map(BTreeMap::len),
            self.removed.get(object_type).map(BTreeMap::len),
        ]
        .into_iter()
        .flatten()
        .any(|n| n > 0)
    }

    /// Every object type with at least one change.
    pub fn object_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .added
            .keys()
            .chain(self.modified.keys())
            .chain(self.removed.keys())
            .map(String::as_str)
            .filter(|t| self.touches_type(t))
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Total number of changed objects.
    pub fn len(&self) -> usize {
        self.added.values().map(BTreeMap::len).sum::<usize>()
            + self.modified.values().map(BTreeMap::len).sum::<usize>()
            + self.removed.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ChangedObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = |m: &BTreeMap<String, BTreeMap<PrimaryKey, Arc<ObjectInstance>>>| {
            m.iter()
                .flat_map(|(t, objs)| objs.keys().map(move |pk| format!("{t}:{pk}")))
                .collect::<Vec<_>>()
        };
        f.debug_struct("ChangedObjects")
            .field("added", &keys(&self.added))
            .field("modified", &keys(&self.modified))
            .field(
                "removed",
                &self
                    .removed
                    .values()
                    .flat_map(|m| m.values().map(ToString::to_string))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
