//! Value-typed identities for cache slots.
//!
//! Keys compare structurally: two keys built independently from equal parts
//! address the same slot. List keys embed a [`Canonical`] where-clause, so
//! equivalent filters share one slot.

use std::fmt;

use crate::canonical::Canonical;
use crate::object::PrimaryKey;
use crate::where_clause::WhereClause;

/// The kind of a [`CacheKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKeyKind {
    Object,
    List,
    RdpRegistry,
}

impl fmt::Display for CacheKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Object => "object",
            Self::List => "list",
            Self::RdpRegistry => "rdp-registry",
        })
    }
}

/// Identity of one object: type name and primary key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectCacheKey {
    object_type: String,
    primary_key: PrimaryKey,
}

impl ObjectCacheKey {
    pub fn new(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }
}

impl fmt::Display for ObjectCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object:{}:{}", self.object_type, self.primary_key)
    }
}

/// Identity of one list query: type name and canonical where-clause.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListCacheKey {
    object_type: String,
    where_clause: Canonical<WhereClause>,
}

impl ListCacheKey {
    pub fn new(object_type: impl Into<String>, where_clause: Canonical<WhereClause>) -> Self {
        Self {
            object_type: object_type.into(),
            where_clause,
        }
    }

    /// The type discriminator: every member of the list is of this type.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn where_clause(&self) -> &Canonical<WhereClause> {
        &self.where_clause
    }
}

impl fmt::Display for ListCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list:{}:{}", self.object_type, self.where_clause)
    }
}

/// Identity of one cache slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    Object(ObjectCacheKey),
    List(ListCacheKey),
    /// The derived-property registry of one object type.
    RdpRegistry(String),
}

impl CacheKey {
    pub fn kind(&self) -> CacheKeyKind {
        match self {
            Self::Object(_) => CacheKeyKind::Object,
            Self::List(_) => CacheKeyKind::List,
            Self::RdpRegistry(_) => CacheKeyKind::RdpRegistry,
        }
    }

    /// The object type this key belongs to.
    pub fn object_type(&self) -> &str {
        match self {
            Self::Object(k) => k.object_type(),
            Self::List(k) => k.object_type(),
            Self::RdpRegistry(t) => t,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectCacheKey> {
        match self {
            Self::Object(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListCacheKey> {
        match self {
            Self::List(k) => Some(k),
            _ => None,
        }
    }
}

impl From<ObjectCacheKey> for CacheKey {
    fn from(key: ObjectCacheKey) -> Self {
        Self::Object(key)
    }
}

impl From<ListCacheKey> for CacheKey {
    fn from(key: ListCacheKey) -> Self {
        Self::List(key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(k) => k.fmt(f),
            Self::List(k) => k.fmt(f),
            Self::RdpRegistry(t) => write!(f, "rdp-registry:{t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn canonical(form: &str) -> Canonical<WhereClause> {
        Canonical::from_parts(WhereClause::all(), form)
    }

    #[test]
    fn independently_built_keys_are_equal() {
        let a = CacheKey::from(ObjectCacheKey::new("Employee", 5));
        let b = CacheKey::from(ObjectCacheKey::new(String::from("Employee"), 5i64));
        assert_eq!(a, b);

        let mut slots = HashMap::new();
        slots.insert(a, 1);
        assert_eq!(slots.get(&b), Some(&1));
    }

    #[test]
    fn list_keys_compare_by_canonical_form() {
        let a = ListCacheKey::new("Todo", canonical("{\"status\":\"open\"}"));
        let b = ListCacheKey::new("Todo", canonical("{\"status\":\"open\"}"));
        let c = ListCacheKey::new("Todo", canonical("{\"status\":\"done\"}"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kinds_and_types() {
        let obj = CacheKey::from(ObjectCacheKey::new("A", 1));
        let list = CacheKey::from(ListCacheKey::new("B", canonical("{}")));
        let reg = CacheKey::RdpRegistry("C".into());
        assert_eq!(obj.kind(), CacheKeyKind::Object);
        assert_eq!(list.kind(), CacheKeyKind::List);
        assert_eq!(reg.kind(), CacheKeyKind::RdpRegistry);
        assert_eq!(obj.object_type(), "A");
        assert_eq!(list.object_type(), "B");
        assert_eq!(reg.object_type(), "C");
        assert!(list.as_list().is_some());
        assert!(list.as_object().is_none());
    }

    #[test]
    fn display() {
        assert_eq!(ObjectCacheKey::new("A", 1).to_string(), "object:A:1");
        assert_eq!(CacheKey::RdpRegistry("A".into()).to_string(), "rdp-registry:A");
    }
}
