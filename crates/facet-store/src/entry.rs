use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use facet_types::{CacheKey, DerivedProperty, ObjectCacheKey, ObjectInstance, RdpId, Status};

/// The value held by a cache slot.
///
/// Equality is deep: two values built separately with equal contents compare
/// equal. Use [`CacheValue::same_allocation`] for reference identity.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    /// Never written.
    Empty,
    /// The object was deleted.
    Tombstone,
    Object(Arc<ObjectInstance>),
    /// Ordered references to object entries.
    List(Arc<Vec<ObjectCacheKey>>),
    /// Union of derived properties registered for one type.
    Registry(Arc<BTreeMap<RdpId, DerivedProperty>>),
}

impl CacheValue {
    pub fn as_object(&self) -> Option<&Arc<ObjectInstance>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Arc<Vec<ObjectCacheKey>>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    /// Returns `true` if both values share the same heap allocation (or are
    /// both the same payload-free variant).
    pub fn same_allocation(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) | (Self::Tombstone, Self::Tombstone) => true,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Arc::ptr_eq(a, b),
            (Self::Registry(a), Self::Registry(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Immutable snapshot of one cache slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub key: CacheKey,
    pub value: CacheValue,
    pub status: Status,
    /// Wall-clock milliseconds since UNIX epoch of the write.
    pub last_updated: u64,
}

impl Entry {
    /// The entry a never-written key reads as.
    pub fn init(key: CacheKey) -> Self {
        Self {
            key,
            value: CacheValue::Empty,
            status: Status::Init,
            last_updated: 0,
        }
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
