//! Shared bookkeeping for in-flight fetches.

use std::collections::{BTreeMap, BTreeSet};

use facet_store::{CacheValue, Entry};
use facet_types::{DerivedProperty, RdpId, Status};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;

use crate::abort::AbortController;
use crate::error::{QueryError, QueryResult};

/// A fetch every interested caller can await. Resolves once, with the same
/// result for all of them.
pub type SharedFetch = Shared<BoxFuture<'static, QueryResult<()>>>;

/// The fetch currently running for one query.
pub(crate) struct InFlight {
    pub(crate) generation: u64,
    /// Ids of the derived properties the request carried.
    pub(crate) rdps: BTreeSet<RdpId>,
    pub(crate) controller: AbortController,
    pub(crate) future: SharedFetch,
}

impl InFlight {
    pub(crate) fn abort(&self) {
        self.controller.abort();
    }

    /// Whether this fetch requested every property in `wanted`.
    pub(crate) fn covers(&self, wanted: &BTreeSet<RdpId>) -> bool {
        wanted.is_subset(&self.rdps)
    }
}

/// A fetch queued behind the running one. It reads the derived-property
/// union only once it starts.
pub(crate) struct FollowUp {
    pub(crate) controller: AbortController,
    pub(crate) future: SharedFetch,
}

impl FollowUp {
    pub(crate) fn abort(&self) {
        self.controller.abort();
    }

    pub(crate) fn start(self, generation: u64, rdps: BTreeSet<RdpId>) -> InFlight {
        InFlight {
            generation,
            rdps,
            controller: self.controller,
            future: self.future,
        }
    }
}

/// The ids of a derived-property union.
pub(crate) fn rdp_ids(rdps: &BTreeMap<RdpId, DerivedProperty>) -> BTreeSet<RdpId> {
    rdps.keys().cloned().collect()
}

/// The status an aborted fetch puts back on `entry`. A loading status left by
/// a superseded fetch settles to what the value shows.
pub(crate) fn settled_status(entry: Option<&Entry>) -> Status {
    match entry {
        None => Status::Init,
        Some(entry) if entry.status == Status::Loading => match entry.value {
            CacheValue::Empty => Status::Init,
            _ => Status::Loaded,
        },
        Some(entry) => entry.status,
    }
}

/// Wrap a spawned fetch task so several callers can await it.
pub(crate) fn share_task(task: JoinHandle<QueryResult<()>>) -> SharedFetch {
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => Err(QueryError::Task(e.to_string())),
        }
    }
    .boxed()
    .shared()
}

/// An already-resolved fetch.
pub(crate) fn resolved(result: QueryResult<()>) -> SharedFetch {
    future::ready(result).boxed().shared()
}
