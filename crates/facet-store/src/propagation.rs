//! Change-propagation from a batch's object delta into live lists.

use std::sync::Arc;

use facet_types::{ListCacheKey, ObjectCacheKey};
use tracing::debug;

use crate::batch::BatchContext;
use crate::changes::ChangedObjects;

/// A live list query that reacts to object changes made elsewhere.
///
/// Implementations must only touch the store through the supplied
/// [`BatchContext`]: [`maybe_update_list`](Self::maybe_update_list) runs while
/// the store is mid-batch.
pub trait ListMembership: Send + Sync {
    /// The list's cache key. Its object type selects which changes it sees.
    fn list_key(&self) -> &ListCacheKey;

    /// Apply `changes` to the list inside the running batch. Returns `true`
    /// if [`maybe_revalidate_list`](Self::maybe_revalidate_list) should run
    /// once the batch has flushed.
    fn maybe_update_list(&self, changes: &ChangedObjects, batch: &mut BatchContext<'_>) -> bool;

    /// Called after the batch's notifications went out, for lists whose
    /// [`maybe_update_list`](Self::maybe_update_list) returned `true`.
    fn maybe_revalidate_list(&self);

    /// Called after an optimistic layer was removed, with the objects of this
    /// list's type whose visible entry changed.
    fn objects_rolled_back(&self, _objects: &[ObjectCacheKey]) {}
}

/// Run `maybe_update_list` on every list whose type has changes. Returns the
/// lists that asked for revalidation.
pub(crate) fn propagate(
    lists: Vec<Arc<dyn ListMembership>>,
    changes: &ChangedObjects,
    batch: &mut BatchContext<'_>,
) -> Vec<Arc<dyn ListMembership>> {
    let mut pending = Vec::new();
    for list in lists {
        let key = list.list_key();
        if !changes.touches_type(key.object_type()) {
            continue;
        }
        if list.maybe_update_list(changes, batch) {
            pending.push(list);
        }
    }
    if !pending.is_empty() {
        debug!(lists = pending.len(), "lists flagged after propagation");
    }
    pending
}
