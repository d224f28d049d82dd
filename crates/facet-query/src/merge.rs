//! Reconciling derived-property fields between two views of one object.

use std::collections::BTreeSet;
use std::sync::Arc;

use facet_store::{BatchContext, Entry};
use facet_types::{CacheKey, ObjectInstance, Status};

/// Combine `source` with `target` over their derived-property field sets.
///
/// If `target_fields` is a subset of `source_fields`, the result is `source`
/// restricted to `target_fields`, and `source` itself when the sets are equal.
/// Otherwise every field of the union is kept: a field `source` has a value
/// for (an explicit null included) takes that value, a field `source` lacks
/// falls back to `target`. Base fields always come from `source`.
pub fn merge_object_fields(
    source: &Arc<ObjectInstance>,
    source_fields: &BTreeSet<String>,
    target_fields: &BTreeSet<String>,
    target: Option<&ObjectInstance>,
) -> Arc<ObjectInstance> {
    if target_fields.is_subset(source_fields) {
        if target_fields == source_fields {
            return Arc::clone(source);
        }
        let mut restricted = ObjectInstance::clone(source);
        for field in source_fields.difference(target_fields) {
            restricted.remove_property(field);
        }
        return Arc::new(restricted);
    }

    union_merge(source, source_fields, target_fields, target)
}

fn union_merge(
    source: &ObjectInstance,
    source_fields: &BTreeSet<String>,
    target_fields: &BTreeSet<String>,
    target: Option<&ObjectInstance>,
) -> Arc<ObjectInstance> {
    let mut merged = source.clone();
    for field in source_fields.union(target_fields) {
        let from_source = source_fields
            .contains(field)
            .then(|| source.get(field))
            .flatten();
        let value = match from_source {
            Some(value) => Some(value.clone()),
            None => target.and_then(|t| t.get(field)).cloned(),
        };
        merged.set_derived(field.clone(), value);
    }
    Arc::new(merged)
}

/// Write `object` to its entry, keeping derived values the stored object
/// already has for fields `object` did not carry.
pub fn write_object_merged(
    batch: &mut BatchContext<'_>,
    object: Arc<ObjectInstance>,
    status: Status,
) -> Arc<Entry> {
    let key = CacheKey::Object(object.cache_key());
    let existing = batch.read(&key);
    let previous = existing.as_ref().and_then(|e| e.value.as_object());

    let merged = match previous {
        Some(old) => {
            let source_fields = object.derived_fields();
            let gaps = source_fields
                .iter()
                .any(|f| object.get(f).is_none() && old.get(f).is_some());
            if gaps || !old.derived_fields().is_subset(source_fields) {
                let target_fields: BTreeSet<String> =
                    source_fields.union(old.derived_fields()).cloned().collect();
                union_merge(&object, source_fields, &target_fields, Some(old))
            } else {
                object
            }
        }
        None => object,
    };
    batch.write_object(merged, status)
}
