//! Query orchestration for the facet object cache.
//!
//! An [`ObjectQuery`] or [`ListQuery`] exists per cache key. It owns the
//! fetch lifecycle for that key against an [`ObjectBackend`]: deduplicating
//! concurrent fetches, aborting superseded ones, and writing results into the
//! [`Store`](facet_store::Store) in batches. Subscribers never talk to the
//! backend; they receive whatever the store holds, restricted to the derived
//! fields they asked for.
//!
//! List queries additionally keep their membership current as objects change
//! elsewhere in the store: strict matches are inserted directly, inconclusive
//! matches schedule a revalidation.
//!
//! [`BulkLoader`] optionally coalesces by-key fetches into batched requests.

pub mod abort;
pub mod backend;
pub mod bulk;
pub mod error;
pub mod fetch;
pub mod handle;
pub mod list_query;
pub mod merge;
pub mod object_query;
pub mod options;
pub mod predicate;

pub use abort::{AbortController, AbortSignal};
pub use backend::{ObjectBackend, ObjectPage, PageRequest};
pub use bulk::{BulkLoadConfig, BulkLoader};
pub use error::{FetchError, QueryError, QueryResult};
pub use fetch::SharedFetch;
pub use handle::QuerySubscription;
pub use list_query::{ListListener, ListPayload, ListQuery};
pub use merge::{merge_object_fields, write_object_merged};
pub use object_query::{ObjectListener, ObjectPayload, ObjectQuery};
pub use options::{AutoFetchMore, FetchMode, ObserveListOptions, ObserveObjectOptions, QueryConfig};
pub use predicate::{evaluate, MatchResult};
