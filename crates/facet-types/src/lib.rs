//! Foundation types for the facet object cache.
//!
//! This crate provides the value and identity types shared by every other
//! facet crate. It performs no I/O and holds no state.
//!
//! # Key Types
//!
//! - [`ObjectInstance`]: one object of the typed graph, with base and derived fields
//! - [`PrimaryKey`]: the primary key of an object within its type
//! - [`WhereClause`]: tagged-variant filter tree for list queries
//! - [`DerivedPropertyDefinition`]: structural definition of a server-computed field
//! - [`CacheKey`]: value-typed identity of one cache slot
//! - [`Canonical`]: a value paired with its canonical form
//! - [`Status`]: load state of a cache entry
//! - [`OptimisticId`]: identifier of one optimistic layer

pub mod cache_key;
pub mod canonical;
pub mod derived;
pub mod error;
pub mod object;
pub mod status;
pub mod where_clause;

pub use cache_key::{CacheKey, CacheKeyKind, ListCacheKey, ObjectCacheKey};
pub use canonical::Canonical;
pub use derived::{
    Aggregation, DerivedProperty, DerivedPropertyBuilder, DerivedPropertyDefinition,
    DerivedPropertySet, RdpId,
};
pub use error::{CanonicalizationError, TypeResult};
pub use object::{ObjectInstance, PrimaryKey};
pub use status::{OptimisticId, Status};
pub use where_clause::{PropertyFilter, WhereClause};
