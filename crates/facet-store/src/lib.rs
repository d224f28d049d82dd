//! Layered, batched store for the facet object cache.
//!
//! The [`Store`] is the single source of truth for every cached value and the
//! only component allowed to mutate shared state. All mutation goes through
//! [`Store::batch`], which runs a synchronous body against a
//! [`BatchContext`], propagates object changes into live lists, and then
//! notifies each touched key's subscribers exactly once.
//!
//! # Layers
//!
//! Entries live in a base layer (confirmed server state) overlaid by a stack
//! of optimistic layers, each tagged with an [`OptimisticId`]. Reads resolve
//! top-down. [`Store::remove_layer`] rolls an optimistic layer back and
//! re-notifies every key whose visible entry changes.
//!
//! # Design Rules
//!
//! 1. Entries are immutable; every write replaces the entry wholesale.
//! 2. A write whose value deep-equals the current one keeps the existing
//!    value allocation (and the whole entry if the status is unchanged).
//! 3. Lists store object keys only. Object data has exactly one owning entry.
//! 4. Subscribers see at most one notification per key per batch.
//! 5. Batches never nest; a re-entrant call panics.
//! 6. Object and list entries nobody retains are dropped by [`Store::gc`]
//!    once the keep-alive window has passed.
//!
//! [`OptimisticId`]: facet_types::OptimisticId

pub mod batch;
pub mod changes;
pub mod entry;
pub mod error;
pub mod layer;
pub mod propagation;
pub mod rdp_registry;
pub mod refcount;
pub mod store;
pub mod subscription;

pub use batch::{BatchContext, BatchOptions, BatchOutcome};
pub use changes::ChangedObjects;
pub use entry::{CacheValue, Entry};
pub use error::{StoreError, StoreResult};
pub use layer::Layers;
pub use propagation::ListMembership;
pub use rdp_registry::RdpRegistry;
pub use refcount::RefCounts;
pub use store::{Store, DEFAULT_KEEP_ALIVE};
pub use subscription::{Listener, Snapshot, Subscription};
