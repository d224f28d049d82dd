//! Observable client for the facet object cache.
//!
//! [`ObservableClient`] is what UI bindings talk to. It hands out one query
//! per cache key, registers requested derived properties so every fetch of a
//! type asks for their union, and exposes confirmed, optimistic and list
//! writes on top of the [`Store`](facet_store::Store). Entries nobody
//! retains are collected after a keep-alive window, on demand or by a
//! [`GcWorker`].
//!
//! [`InMemoryBackend`] serves in-memory tables through the backend trait for
//! tests and local development.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod gc;

pub use backend::{InMemoryBackend, RecordedRequest};
pub use client::ObservableClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use gc::GcWorker;

// Re-export the types callers need to observe and write
pub use facet_query::{
    AutoFetchMore, BulkLoadConfig, FetchError, FetchMode, ListListener, ListPayload, ObjectListener, ObjectPayload,
    ObserveListOptions, ObserveObjectOptions, QuerySubscription, SharedFetch,
};
pub use facet_types::{
    DerivedPropertyBuilder, DerivedPropertySet, ObjectInstance, OptimisticId, PrimaryKey, Status,
    WhereClause,
};
