//! Fetch orchestration for one object key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use facet_store::{BatchOptions, Entry, Listener, Snapshot, Store};
use facet_types::{CacheKey, DerivedProperty, ObjectCacheKey, ObjectInstance, RdpId, Status};
use tracing::{debug, warn};

use crate::abort::{AbortController, AbortSignal};
use crate::backend::ObjectBackend;
use crate::error::{FetchError, QueryResult};
use crate::fetch::{
    rdp_ids, resolved, settled_status, share_task, FollowUp, InFlight, SharedFetch,
};
use crate::handle::{QuerySubscription, SubscriberCount};
use crate::merge::{merge_object_fields, write_object_merged};
use crate::options::{FetchMode, QueryConfig};

/// What object subscribers receive.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectPayload {
    /// `None` before the first load and after the object was deleted.
    pub object: Option<Arc<ObjectInstance>>,
    pub status: Status,
    pub last_updated: u64,
    pub is_optimistic: bool,
}

impl ObjectPayload {
    /// Build the view of `snapshot` restricted to `fields`.
    pub fn from_snapshot(snapshot: &Snapshot, fields: &BTreeSet<String>) -> Self {
        let object = snapshot
            .entry
            .value
            .as_object()
            .map(|o| merge_object_fields(o, o.derived_fields(), fields, None));
        Self {
            object,
            status: snapshot.entry.status,
            last_updated: snapshot.entry.last_updated,
            is_optimistic: snapshot.is_optimistic,
        }
    }

    fn same_view(&self, other: &Self) -> bool {
        self.status == other.status
            && self.is_optimistic == other.is_optimistic
            && self.object == other.object
    }
}

/// Object subscriber callback.
pub type ObjectListener = Arc<dyn Fn(&ObjectPayload) + Send + Sync>;

#[derive(Default)]
struct FetchState {
    in_flight: Option<InFlight>,
    follow_up: Option<FollowUp>,
    generation: u64,
    subscribers: usize,
    last_fetched: Option<Instant>,
}

/// Query for one object.
///
/// At most one fetch per key runs at a time: callers asking for a fetch while
/// one is pending share it. A forced fetch supersedes the pending one, whose
/// result is then discarded. When derived properties were registered after
/// the pending fetch was sent, a follow-up fetch is queued behind it instead.
pub struct ObjectQuery {
    key: ObjectCacheKey,
    cache_key: CacheKey,
    store: Arc<Store>,
    backend: Arc<dyn ObjectBackend>,
    config: QueryConfig,
    state: Mutex<FetchState>,
    this: Weak<ObjectQuery>,
}

impl ObjectQuery {
    /// Create the query for `key`. Nothing is fetched until the first
    /// [`observe`](Self::observe) or [`fetch`](Self::fetch).
    pub fn new(
        key: ObjectCacheKey,
        store: Arc<Store>,
        backend: Arc<dyn ObjectBackend>,
        config: QueryConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            cache_key: CacheKey::Object(key.clone()),
            key,
            store,
            backend,
            config,
            state: Mutex::new(FetchState::default()),
            this: this.clone(),
        })
    }

    pub fn key(&self) -> &ObjectCacheKey {
        &self.key
    }

    /// Subscribe and, depending on `mode`, fetch.
    ///
    /// `fields` are the derived fields this subscriber asked for; emissions
    /// are restricted to them. Must be called inside a Tokio runtime unless
    /// `mode` is [`FetchMode::Offline`].
    pub fn observe(
        &self,
        mode: FetchMode,
        fields: BTreeSet<String>,
        listener: ObjectListener,
    ) -> QuerySubscription {
        let wants_fetch = match mode {
            FetchMode::Offline => false,
            FetchMode::Force => true,
            FetchMode::Auto => !self.is_fresh(&fields),
        };
        let subscription = self.subscribe(fields, listener);
        if wants_fetch {
            drop(self.fetch(false));
        }
        subscription
    }

    /// Subscribe without fetching. The listener receives the current payload
    /// immediately. The object stays cached while any subscription is held.
    pub fn subscribe(&self, fields: BTreeSet<String>, listener: ObjectListener) -> QuerySubscription {
        self.lock_state().subscribers += 1;
        self.store.retain(&self.cache_key);

        let last: Mutex<Option<ObjectPayload>> = Mutex::new(None);
        let store_listener: Listener = Arc::new(move |snapshot: &Snapshot| {
            let payload = ObjectPayload::from_snapshot(snapshot, &fields);
            {
                let mut last = last.lock().expect("payload lock poisoned");
                if last.as_ref().is_some_and(|prev| prev.same_view(&payload)) {
                    return;
                }
                *last = Some(payload.clone());
            }
            listener(&payload);
        });

        let subscription = self.store.subscribe(self.cache_key.clone(), store_listener);
        let owner: Weak<dyn SubscriberCount> = self.this.clone();
        QuerySubscription::new(Some(subscription), owner, None)
    }

    /// Start a fetch, or join the pending one. With `force`, pending fetches
    /// are aborted and a new one started.
    ///
    /// A pending fetch that did not request every registered derived
    /// property is not joined: a follow-up fetch is queued behind it.
    pub fn fetch(&self, force: bool) -> SharedFetch {
        let Some(this) = self.this.upgrade() else {
            return resolved(Err(FetchError::Aborted.into()));
        };
        let rdps = self.store.get_all_rdps_for_type(self.key.object_type());
        let wanted = rdp_ids(&rdps);

        let mut state = self.lock_state();
        if force {
            if let Some(follow_up) = state.follow_up.take() {
                follow_up.abort();
            }
            if let Some(in_flight) = &state.in_flight {
                in_flight.abort();
                debug!(key = %self.key, generation = in_flight.generation, "object fetch superseded");
            }
        } else {
            if let Some(follow_up) = &state.follow_up {
                return follow_up.future.clone();
            }
            let pending = state
                .in_flight
                .as_ref()
                .map(|f| (f.covers(&wanted), f.future.clone()));
            if let Some((covers, future)) = pending {
                if covers {
                    return future;
                }
                return self.queue_follow_up(&mut state, this, future);
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let controller = AbortController::new();
        let signal = controller.signal();
        let future = share_task(tokio::spawn(this.run_fetch(generation, signal, rdps)));
        state.in_flight = Some(InFlight {
            generation,
            rdps: wanted,
            controller,
            future: future.clone(),
        });
        future
    }

    /// Fetch again, superseding any pending fetch.
    pub fn revalidate(&self) -> SharedFetch {
        self.fetch(true)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers
    }

    fn queue_follow_up(&self, state: &mut FetchState, this: Arc<Self>, prior: SharedFetch) -> SharedFetch {
        let controller = AbortController::new();
        let signal = controller.signal();
        let future = share_task(tokio::spawn(async move {
            let _ = prior.await;
            this.start_follow_up(signal).await
        }));
        debug!(key = %self.key, "object fetch queued for new derived properties");
        state.follow_up = Some(FollowUp {
            controller,
            future: future.clone(),
        });
        future
    }

    async fn start_follow_up(self: Arc<Self>, signal: AbortSignal) -> QueryResult<()> {
        let rdps = self.store.get_all_rdps_for_type(self.key.object_type());
        let generation = {
            let mut state = self.lock_state();
            if signal.is_aborted() {
                return Err(FetchError::Aborted.into());
            }
            let Some(follow_up) = state.follow_up.take() else {
                return Err(FetchError::Aborted.into());
            };
            state.generation += 1;
            let generation = state.generation;
            state.in_flight = Some(follow_up.start(generation, rdp_ids(&rdps)));
            generation
        };
        self.run_fetch(generation, signal, rdps).await
    }

    async fn run_fetch(
        self: Arc<Self>,
        generation: u64,
        signal: AbortSignal,
        rdps: BTreeMap<RdpId, DerivedProperty>,
    ) -> QueryResult<()> {
        let (previous, loading) = self
            .store
            .batch(BatchOptions::base(), |b| {
                let previous = settled_status(b.read(&self.cache_key).as_deref());
                (previous, b.set_status(self.cache_key.clone(), Status::Loading))
            })
            .value;

        debug!(key = %self.key, rdps = rdps.len(), generation, "object fetch started");
        let result = self
            .backend
            .fetch_object_by_key(self.key.object_type(), self.key.primary_key(), &rdps, &signal)
            .await;

        if !self.is_current(generation, &signal) {
            debug!(key = %self.key, generation, "object fetch discarded");
            self.settle_aborted(&loading, previous);
            return Err(FetchError::Aborted.into());
        }

        let outcome = match result {
            Ok(Some(object)) => {
                self.store.batch(BatchOptions::base(), |b| {
                    write_object_merged(b, Arc::new(object), Status::Loaded);
                });
                debug!(key = %self.key, "object fetch completed");
                Ok(())
            }
            Ok(None) => {
                self.store.batch(BatchOptions::base(), |b| {
                    b.delete(self.key.clone());
                });
                debug!(key = %self.key, "object not found");
                Ok(())
            }
            Err(FetchError::Aborted) => {
                self.settle_aborted(&loading, previous);
                return Err(FetchError::Aborted.into());
            }
            Err(error) => {
                warn!(key = %self.key, %error, "object fetch failed");
                self.store.batch(BatchOptions::base(), |b| {
                    b.set_status(self.cache_key.clone(), Status::Error);
                });
                Err(error.into())
            }
        };

        self.finish(generation, outcome.is_ok());
        outcome
    }

    /// Put back the status the entry had before an aborted fetch marked it
    /// loading. Skipped once the entry was written since or another fetch
    /// is pending.
    fn settle_aborted(&self, loading: &Arc<Entry>, previous: Status) {
        self.store.batch(BatchOptions::base(), |b| {
            let untouched = b
                .read(&self.cache_key)
                .is_some_and(|current| Arc::ptr_eq(&current, loading));
            let idle = {
                let state = self.lock_state();
                state.in_flight.is_none() && state.follow_up.is_none()
            };
            if untouched && idle {
                b.set_status(self.cache_key.clone(), previous);
            }
        });
    }

    fn is_current(&self, generation: u64, signal: &AbortSignal) -> bool {
        !signal.is_aborted() && self.lock_state().generation == generation
    }

    fn finish(&self, generation: u64, succeeded: bool) {
        let mut state = self.lock_state();
        if state.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
            state.in_flight = None;
        }
        if succeeded {
            state.last_fetched = Some(Instant::now());
        }
    }

    fn is_fresh(&self, fields: &BTreeSet<String>) -> bool {
        let wanted = rdp_ids(&self.store.get_all_rdps_for_type(self.key.object_type()));
        {
            let state = self.lock_state();
            if state.follow_up.is_some() {
                return true;
            }
            if let Some(in_flight) = &state.in_flight {
                return in_flight.covers(&wanted);
            }
            let recent = state
                .last_fetched
                .is_some_and(|at| at.elapsed() < self.config.dedupe_interval);
            if !recent {
                return false;
            }
        }
        self.store.read(&self.cache_key).is_some_and(|entry| {
            entry.status == Status::Loaded
                && entry
                    .value
                    .as_object()
                    .map_or(true, |o| fields.is_subset(o.derived_fields()))
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FetchState> {
        self.state.lock().expect("object query lock poisoned")
    }
}

impl SubscriberCount for ObjectQuery {
    fn release_subscriber(&self, _listener_id: Option<u64>) {
        {
            let mut state = self.lock_state();
            state.subscribers = state.subscribers.saturating_sub(1);
            if state.subscribers == 0 && self.config.cancel_on_last_unsubscribe {
                let follow_up = state.follow_up.take();
                let in_flight = state.in_flight.take();
                if let Some(follow_up) = &follow_up {
                    follow_up.abort();
                }
                if let Some(in_flight) = &in_flight {
                    in_flight.abort();
                }
                if follow_up.is_some() || in_flight.is_some() {
                    state.generation += 1;
                    debug!(key = %self.key, "object fetch aborted after last unsubscribe");
                }
            }
        }
        self.store.release(&self.cache_key);
    }
}

impl fmt::Debug for ObjectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectQuery")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
