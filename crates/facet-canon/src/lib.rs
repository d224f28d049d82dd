//! Canonicalization for the facet object cache.
//!
//! Every query shape that participates in cache identity passes through this
//! crate so that semantically equal shapes map to one cache slot:
//!
//! - [`WhereClauseCanonicalizer`]: normalizes filter trees and interns them
//! - [`RdpCanonicalizer`]: derives fixed-format [`RdpId`]s from derived
//!   property structure
//! - [`CanonicalHasher`]: domain-separated BLAKE3 over canonical JSON
//!
//! Canonicalization is pure, total over well-formed input, and independent of
//! map insertion order.
//!
//! [`RdpId`]: facet_types::RdpId

pub mod derived;
pub mod hasher;
pub mod json;
pub mod where_clause;

pub use derived::RdpCanonicalizer;
pub use hasher::CanonicalHasher;
pub use json::{canonical_json, normalize_value};
pub use where_clause::WhereClauseCanonicalizer;
