//! Fetch orchestration and membership upkeep for one list key.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use facet_store::{
    BatchContext, BatchOptions, CacheValue, ChangedObjects, Entry, ListMembership, Snapshot,
    Store, Subscription,
};
use facet_types::{
    CacheKey, DerivedProperty, ListCacheKey, ObjectCacheKey, ObjectInstance, RdpId, Status,
};
use tracing::{debug, info, warn};

use crate::abort::{AbortController, AbortSignal};
use crate::backend::{ObjectBackend, PageRequest};
use crate::error::{FetchError, QueryResult};
use crate::fetch::{
    rdp_ids, resolved, settled_status, share_task, FollowUp, InFlight, SharedFetch,
};
use crate::handle::{QuerySubscription, SubscriberCount};
use crate::merge::{merge_object_fields, write_object_merged};
use crate::options::{AutoFetchMore, FetchMode, QueryConfig};
use crate::predicate::{evaluate, MatchResult};

/// What list subscribers receive.
#[derive(Clone, Debug, PartialEq)]
pub struct ListPayload {
    /// Resolved members in list order. Deleted objects are skipped.
    pub objects: Vec<Arc<ObjectInstance>>,
    pub status: Status,
    /// The backend reported another page.
    pub has_more: bool,
    /// The list or one of its members comes from an optimistic layer.
    pub is_optimistic: bool,
    pub last_updated: u64,
}

impl ListPayload {
    fn same_view(&self, other: &Self) -> bool {
        self.status == other.status
            && self.has_more == other.has_more
            && self.is_optimistic == other.is_optimistic
            && self.objects == other.objects
    }
}

/// List subscriber callback.
pub type ListListener = Arc<dyn Fn(&ListPayload) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    fields: BTreeSet<String>,
    callback: ListListener,
    last: Option<ListPayload>,
}

#[derive(Clone, Copy, Debug)]
enum Chain {
    /// Start over from the first page.
    First,
    /// Continue after the last loaded page.
    Next,
}

#[derive(Default)]
struct ListState {
    in_flight: Option<InFlight>,
    pending_page: Option<InFlight>,
    follow_up: Option<FollowUp>,
    generation: u64,
    next_page_token: Option<String>,
    fetched: bool,
    /// Derived properties the last successful fetch requested.
    fetched_rdps: BTreeSet<RdpId>,
    auto_fetch_more: AutoFetchMore,
    subscribers: usize,
    last_fetched: Option<Instant>,
    revalidate_pending: bool,
    members_dirty: bool,
    disposed: bool,
}

impl ListState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending_page.is_none() && self.follow_up.is_none()
    }

    /// Abort every pending fetch. Returns `true` if there was one.
    fn abort_all(&mut self) -> bool {
        let mut aborted = false;
        if let Some(follow_up) = self.follow_up.take() {
            follow_up.abort();
            aborted = true;
        }
        for fetch in [self.in_flight.take(), self.pending_page.take()].into_iter().flatten() {
            fetch.abort();
            aborted = true;
        }
        if aborted {
            self.generation += 1;
        }
        aborted
    }
}

/// Query for one list key.
///
/// The list entry stores object keys only; emissions resolve them against the
/// object entries, so member updates show through without a list write. The
/// query retains the member keys it currently shows so they stay cached.
pub struct ListQuery {
    key: ListCacheKey,
    cache_key: CacheKey,
    store: Arc<Store>,
    backend: Arc<dyn ObjectBackend>,
    config: QueryConfig,
    page_size: Option<u32>,
    state: Mutex<ListState>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    store_subscription: Mutex<Option<Subscription>>,
    retained: Mutex<HashSet<ObjectCacheKey>>,
    this: Weak<ListQuery>,
}

impl ListQuery {
    /// Create the query and register it for change-propagation.
    pub fn new(
        key: ListCacheKey,
        store: Arc<Store>,
        backend: Arc<dyn ObjectBackend>,
        config: QueryConfig,
        page_size: Option<u32>,
    ) -> Arc<Self> {
        let page_size = page_size.or(config.default_page_size);
        let query = Arc::new_cyclic(|this| Self {
            cache_key: CacheKey::List(key.clone()),
            key,
            store,
            backend,
            config,
            page_size,
            state: Mutex::new(ListState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            store_subscription: Mutex::new(None),
            retained: Mutex::new(HashSet::new()),
            this: this.clone(),
        });

        query.store.register_list(&query);
        let weak = Arc::downgrade(&query);
        let subscription = query.store.subscribe(
            query.cache_key.clone(),
            Arc::new(move |snapshot: &Snapshot| {
                if let Some(query) = weak.upgrade() {
                    query.emit(snapshot);
                }
            }),
        );
        *query.lock_subscription() = Some(subscription);
        query
    }

    /// The canonical key this query serves.
    pub fn key(&self) -> &ListCacheKey {
        &self.key
    }

    // -----------------------------------------------------------------------
    // Subscribing
    // -----------------------------------------------------------------------

    /// Subscribe and, depending on `mode`, fetch.
    ///
    /// The list keeps the most demanding `auto_fetch_more` any observer asked
    /// for. Must be called inside a Tokio runtime unless `mode` is
    /// [`FetchMode::Offline`].
    pub fn observe(
        &self,
        mode: FetchMode,
        auto_fetch_more: AutoFetchMore,
        fields: BTreeSet<String>,
        listener: ListListener,
    ) -> QuerySubscription {
        {
            let mut state = self.lock_state();
            state.auto_fetch_more = state.auto_fetch_more.max(auto_fetch_more);
        }
        let wants_fetch = match mode {
            FetchMode::Offline => false,
            FetchMode::Force => true,
            FetchMode::Auto => !self.is_fresh(),
        };
        let subscription = self.subscribe(fields, listener);
        if wants_fetch {
            drop(self.fetch(false));
        }
        subscription
    }

    /// Subscribe without fetching. The listener receives the current payload
    /// immediately. The list stays cached while any subscription is held.
    pub fn subscribe(&self, fields: BTreeSet<String>, listener: ListListener) -> QuerySubscription {
        self.lock_state().subscribers += 1;
        self.store.retain(&self.cache_key);
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push(ListenerEntry {
            id,
            fields,
            callback: listener,
            last: None,
        });

        let snapshot = self.store.snapshot(&self.cache_key);
        self.emit(&snapshot);

        let owner: Weak<dyn SubscriberCount> = self.this.clone();
        QuerySubscription::new(None, owner, Some(id))
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers
    }

    /// Returns `true` if the backend reported another page.
    pub fn has_more(&self) -> bool {
        self.lock_state().next_page_token.is_some()
    }

    /// Detach the query from the store. Pending fetches are aborted,
    /// change-propagation stops, and retained members are released. Later
    /// fetches resolve as aborted.
    pub fn dispose(&self) {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.abort_all();
        }
        self.store.unregister_list(&self.key);
        self.lock_subscription().take();
        let retained = std::mem::take(&mut *self.lock_retained());
        for key in retained {
            self.store.release(&CacheKey::Object(key));
        }
        debug!(list = %self.key, "list query disposed");
    }

    fn emit(&self, snapshot: &Snapshot) {
        if self.lock_state().disposed {
            return;
        }
        let keys: Vec<ObjectCacheKey> = snapshot
            .entry
            .value
            .as_list()
            .map(|l| l.as_ref().clone())
            .unwrap_or_default();
        self.retain_members(&keys);

        let mut is_optimistic = snapshot.is_optimistic;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let member = self.store.snapshot(&CacheKey::Object(key));
            if let Some(object) = member.entry.value.as_object() {
                is_optimistic |= member.is_optimistic;
                objects.push(Arc::clone(object));
            }
        }
        let has_more = self.has_more();

        let mut deliveries = Vec::new();
        {
            let mut listeners = self.lock_listeners();
            for listener in listeners.iter_mut() {
                let payload = ListPayload {
                    objects: objects
                        .iter()
                        .map(|o| merge_object_fields(o, o.derived_fields(), &listener.fields, None))
                        .collect(),
                    status: snapshot.entry.status,
                    has_more,
                    is_optimistic,
                    last_updated: snapshot.entry.last_updated,
                };
                if listener.last.as_ref().is_some_and(|p| p.same_view(&payload)) {
                    continue;
                }
                listener.last = Some(payload.clone());
                deliveries.push((Arc::clone(&listener.callback), payload));
            }
        }
        for (callback, payload) in deliveries {
            callback(&payload);
        }
    }

    /// Hold a store reference on exactly the members currently shown.
    fn retain_members(&self, keys: &[ObjectCacheKey]) {
        let current: HashSet<ObjectCacheKey> = keys.iter().cloned().collect();
        let (added, dropped) = {
            let mut retained = self.lock_retained();
            if *retained == current {
                return;
            }
            let added: Vec<ObjectCacheKey> = current.difference(&retained).cloned().collect();
            let dropped: Vec<ObjectCacheKey> = retained.difference(&current).cloned().collect();
            *retained = current;
            (added, dropped)
        };
        for key in added {
            self.store.retain(&CacheKey::Object(key));
        }
        for key in dropped {
            self.store.release(&CacheKey::Object(key));
        }
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    /// Fetch from the first page, or join the pending fetch. With `force`,
    /// pending fetches are aborted and the list is rebuilt from page one.
    ///
    /// A pending fetch that did not request every registered derived
    /// property is not joined: a refetch from page one is queued behind it.
    pub fn fetch(&self, force: bool) -> SharedFetch {
        let Some(this) = self.this.upgrade() else {
            return resolved(Err(FetchError::Aborted.into()));
        };
        let rdps = self.store.get_all_rdps_for_type(self.key.object_type());
        let wanted = rdp_ids(&rdps);

        let mut state = self.lock_state();
        if state.disposed {
            return resolved(Err(FetchError::Aborted.into()));
        }
        if force {
            if state.abort_all() {
                debug!(list = %self.key, "list fetch superseded");
            }
        } else {
            if let Some(follow_up) = &state.follow_up {
                return follow_up.future.clone();
            }
            let running: Vec<(bool, SharedFetch)> = [state.in_flight.as_ref(), state.pending_page.as_ref()]
                .into_iter()
                .flatten()
                .map(|f| (f.covers(&wanted), f.future.clone()))
                .collect();
            if !running.is_empty() {
                if running.iter().all(|(covers, _)| *covers) {
                    return running[0].1.clone();
                }
                let priors = running.into_iter().map(|(_, future)| future).collect();
                return self.queue_follow_up(&mut state, this, priors);
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let policy = state.auto_fetch_more;
        let controller = AbortController::new();
        let signal = controller.signal();
        let future = share_task(tokio::spawn(this.run_pages(
            generation,
            signal,
            Chain::First,
            policy,
            rdps,
        )));
        state.in_flight = Some(InFlight {
            generation,
            rdps: wanted,
            controller,
            future: future.clone(),
        });
        future
    }

    /// Authoritatively refetch from the first page.
    pub fn revalidate(&self) -> SharedFetch {
        self.fetch(true)
    }

    /// Load the next page.
    ///
    /// Concurrent calls share one fetch. A call made while a first-page
    /// fetch is pending or queued waits for it and then loads the page after
    /// it.
    pub fn fetch_more(&self) -> SharedFetch {
        let Some(this) = self.this.upgrade() else {
            return resolved(Err(FetchError::Aborted.into()));
        };
        let rdps = self.store.get_all_rdps_for_type(self.key.object_type());

        let mut state = self.lock_state();
        if state.disposed {
            return resolved(Err(FetchError::Aborted.into()));
        }
        if let Some(page) = &state.pending_page {
            return page.future.clone();
        }
        let prior = state
            .follow_up
            .as_ref()
            .map(|f| f.future.clone())
            .or_else(|| state.in_flight.as_ref().map(|f| f.future.clone()));
        if state.fetched && state.next_page_token.is_none() && prior.is_none() {
            return resolved(Ok(()));
        }

        let controller = AbortController::new();
        let signal = controller.signal();
        let wanted = rdp_ids(&rdps);
        let task = tokio::spawn(async move {
            if let Some(prior) = prior {
                // the page chain continues from wherever the prior fetch ended
                let _ = prior.await;
            }
            this.start_next_page(signal, rdps).await
        });
        let future = share_task(task);
        state.pending_page = Some(InFlight {
            generation: state.generation,
            rdps: wanted,
            controller,
            future: future.clone(),
        });
        future
    }

    fn queue_follow_up(&self, state: &mut ListState, this: Arc<Self>, priors: Vec<SharedFetch>) -> SharedFetch {
        let controller = AbortController::new();
        let signal = controller.signal();
        let future = share_task(tokio::spawn(async move {
            for prior in priors {
                let _ = prior.await;
            }
            this.start_follow_up(signal).await
        }));
        debug!(list = %self.key, "list refetch queued for new derived properties");
        state.follow_up = Some(FollowUp {
            controller,
            future: future.clone(),
        });
        future
    }

    async fn start_follow_up(self: Arc<Self>, signal: AbortSignal) -> QueryResult<()> {
        let rdps = self.store.get_all_rdps_for_type(self.key.object_type());
        let (generation, policy) = {
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
            (generation, state.auto_fetch_more)
        };
        self.run_pages(generation, signal, Chain::First, policy, rdps).await
    }

    async fn start_next_page(
        self: Arc<Self>,
        signal: AbortSignal,
        rdps: BTreeMap<RdpId, DerivedProperty>,
    ) -> QueryResult<()> {
        let generation = {
            let mut state = self.lock_state();
            if signal.is_aborted() {
                return Err(FetchError::Aborted.into());
            }
            let generation = state.generation;
            if let Some(page) = state.pending_page.as_mut() {
                page.generation = generation;
            }
            generation
        };
        self.run_pages(generation, signal, Chain::Next, AutoFetchMore::Off, rdps)
            .await
    }

    async fn run_pages(
        self: Arc<Self>,
        generation: u64,
        signal: AbortSignal,
        chain: Chain,
        policy: AutoFetchMore,
        rdps: BTreeMap<RdpId, DerivedProperty>,
    ) -> QueryResult<()> {
        let (mut token, mut accumulated) = match chain {
            Chain::First => (None, Vec::new()),
            Chain::Next => {
                let token = {
                    let state = self.lock_state();
                    if state.fetched && state.next_page_token.is_none() {
                        drop(state);
                        self.finish(chain, generation, None);
                        return Ok(());
                    }
                    state.next_page_token.clone()
                };
                let existing = self
                    .store
                    .read_base(&self.cache_key)
                    .and_then(|e| e.value.as_list().map(|l| l.as_ref().clone()))
                    .unwrap_or_default();
                (token, existing)
            }
        };

        if !self.is_current(generation, &signal) {
            return Err(FetchError::Aborted.into());
        }
        let (previous, mut last_written) = self
            .store
            .batch(BatchOptions::base(), |b| {
                let previous = settled_status(b.read(&self.cache_key).as_deref());
                (previous, b.set_status(self.cache_key.clone(), Status::Loading))
            })
            .value;
        let mut restore = previous;
        let requested = rdp_ids(&rdps);

        loop {
            let request = PageRequest {
                object_type: self.key.object_type().to_string(),
                where_clause: self.key.where_clause().clone(),
                derived_properties: rdps.clone(),
                page_token: token.clone(),
                page_size: self.page_size,
            };
            debug!(list = %self.key, page_token = ?token, ?chain, "list page fetch started");
            let result = self.backend.fetch_object_page(request, &signal).await;

            if !self.is_current(generation, &signal) {
                debug!(list = %self.key, generation, "list page discarded");
                self.settle_aborted(&last_written, restore);
                return Err(FetchError::Aborted.into());
            }

            let page = match result {
                Ok(page) => page,
                Err(FetchError::Aborted) => {
                    self.settle_aborted(&last_written, restore);
                    return Err(FetchError::Aborted.into());
                }
                Err(error) => {
                    warn!(list = %self.key, %error, "list fetch failed");
                    self.store.batch(BatchOptions::base(), |b| {
                        b.set_status(self.cache_key.clone(), Status::Error);
                    });
                    self.finish(chain, generation, None);
                    return Err(error.into());
                }
            };

            let next = page.next_page_token;
            {
                let mut state = self.lock_state();
                state.next_page_token = next.clone();
                state.fetched = true;
            }

            let (more, written) = self
                .store
                .batch(BatchOptions::base(), |b| {
                    for object in page.objects {
                        accumulated.push(object.cache_key());
                        write_object_merged(b, Arc::new(object), Status::Loaded);
                    }
                    dedupe(&mut accumulated);
                    let more = next.is_some() && policy.wants_more(accumulated.len());
                    let status = if more { Status::Loading } else { Status::Loaded };
                    (more, self.write_to_store(b, accumulated.clone(), status))
                })
                .value;
            last_written = written;
            // pages already written are confirmed data
            restore = Status::Loaded;

            if !more {
                break;
            }
            token = next;
        }

        debug!(list = %self.key, loaded = accumulated.len(), has_more = self.has_more(), "list fetch completed");
        self.finish(chain, generation, Some(requested));
        Ok(())
    }

    /// Write `keys` as the list's sequence.
    ///
    /// A sequence identical to the current one keeps the existing value (and
    /// the whole entry when `status` is unchanged) and does not mark the list
    /// as modified in `batch`.
    pub fn write_to_store(
        &self,
        batch: &mut BatchContext<'_>,
        mut keys: Vec<ObjectCacheKey>,
        status: Status,
    ) -> Arc<Entry> {
        dedupe(&mut keys);
        let changed = batch
            .read(&self.cache_key)
            .map_or(true, |e| e.value.as_list().map_or(true, |l| **l != keys));
        let entry = batch.write(self.cache_key.clone(), CacheValue::List(Arc::new(keys)), status);
        if changed {
            batch.mark_list_modified(self.key.clone());
        }
        entry
    }

    /// Put back `status` on a list an aborted fetch left loading. Skipped
    /// once the entry was written since or another fetch is pending.
    fn settle_aborted(&self, last_written: &Arc<Entry>, status: Status) {
        self.store.batch(BatchOptions::base(), |b| {
            let untouched = b
                .read(&self.cache_key)
                .is_some_and(|current| Arc::ptr_eq(&current, last_written));
            if untouched && self.lock_state().is_idle() {
                b.set_status(self.cache_key.clone(), status);
            }
        });
    }

    fn is_current(&self, generation: u64, signal: &AbortSignal) -> bool {
        !signal.is_aborted() && self.lock_state().generation == generation
    }

    /// Clear the slot of a settled fetch. `requested` carries the derived
    /// properties of a successful fetch.
    fn finish(&self, chain: Chain, generation: u64, requested: Option<BTreeSet<RdpId>>) {
        let mut state = self.lock_state();
        let slot = match chain {
            Chain::First => &mut state.in_flight,
            Chain::Next => &mut state.pending_page,
        };
        if slot.as_ref().is_some_and(|f| f.generation == generation) {
            *slot = None;
        }
        if let Some(requested) = requested {
            state.last_fetched = Some(Instant::now());
            if matches!(chain, Chain::First) {
                state.fetched_rdps = requested;
            }
        }
    }

    fn is_fresh(&self) -> bool {
        let wanted = rdp_ids(&self.store.get_all_rdps_for_type(self.key.object_type()));
        {
            let state = self.lock_state();
            if state.follow_up.is_some() {
                return true;
            }
            let running: Vec<&InFlight> = [state.in_flight.as_ref(), state.pending_page.as_ref()]
                .into_iter()
                .flatten()
                .collect();
            if !running.is_empty() {
                return running.iter().all(|f| f.covers(&wanted));
            }
            let recent = state
                .last_fetched
                .is_some_and(|at| at.elapsed() < self.config.dedupe_interval);
            if !recent || !wanted.is_subset(&state.fetched_rdps) {
                return false;
            }
        }
        self.store
            .read(&self.cache_key)
            .is_some_and(|e| e.status == Status::Loaded)
    }

    fn lock_state(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().expect("list query lock poisoned")
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().expect("list listener lock poisoned")
    }

    fn lock_subscription(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.store_subscription
            .lock()
            .expect("list subscription lock poisoned")
    }

    fn lock_retained(&self) -> MutexGuard<'_, HashSet<ObjectCacheKey>> {
        self.retained.lock().expect("retained members lock poisoned")
    }
}

impl ListMembership for ListQuery {
    fn list_key(&self) -> &ListCacheKey {
        &self.key
    }

    fn maybe_update_list(&self, changes: &ChangedObjects, batch: &mut BatchContext<'_>) -> bool {
        if batch.is_list_modified(&self.key) {
            return false;
        }
        let Some(entry) = batch.read(&self.cache_key) else {
            return false;
        };
        let Some(current) = entry.value.as_list() else {
            return false;
        };

        let clause = self.key.where_clause().value();
        let object_type = self.key.object_type();
        let optimistic = batch.is_optimistic();
        let mut keys: Vec<ObjectCacheKey> = current.as_ref().clone();
        let (mut inserted, mut removed, mut sorta) = (0usize, 0usize, 0usize);
        let mut members_changed = false;

        for object in changes.added(object_type).chain(changes.modified(object_type)) {
            let key = object.cache_key();
            let position = keys.iter().position(|k| *k == key);
            match (evaluate(clause, object), position) {
                (MatchResult::Match, None) => {
                    keys.push(key);
                    inserted += 1;
                }
                (MatchResult::Match, Some(_)) => members_changed = true,
                (MatchResult::Unknown, position) => {
                    sorta += 1;
                    members_changed |= position.is_some();
                }
                (MatchResult::NoMatch, Some(i)) if !optimistic => {
                    keys.remove(i);
                    removed += 1;
                }
                (MatchResult::NoMatch, Some(_)) => members_changed = true,
                (MatchResult::NoMatch, None) => {}
            }
        }

        for key in changes.removed(object_type) {
            if let Some(i) = keys.iter().position(|k| k == key) {
                if optimistic {
                    members_changed = true;
                } else {
                    keys.remove(i);
                    removed += 1;
                }
            }
        }

        let rewritten = inserted + removed > 0;
        if rewritten {
            let status = if optimistic || sorta > 0 {
                Status::Loading
            } else {
                Status::Loaded
            };
            self.write_to_store(batch, keys, status);
        }

        let revalidate = sorta > 0 && !optimistic;
        let dirty = members_changed && !rewritten;
        {
            let mut state = self.lock_state();
            state.revalidate_pending |= revalidate;
            state.members_dirty |= dirty;
        }
        if rewritten || sorta > 0 {
            debug!(list = %self.key, inserted, removed, sorta, optimistic, "list membership updated");
        }
        rewritten || revalidate || dirty
    }

    fn maybe_revalidate_list(&self) {
        let (revalidate, dirty, observed) = {
            let mut state = self.lock_state();
            let revalidate = std::mem::take(&mut state.revalidate_pending);
            let dirty = std::mem::take(&mut state.members_dirty);
            let observed = state.subscribers > 0;
            if revalidate && !observed {
                // the next observer refetches
                state.last_fetched = None;
            }
            (revalidate, dirty, observed)
        };
        if dirty {
            let snapshot = self.store.snapshot(&self.cache_key);
            self.emit(&snapshot);
        }
        if !revalidate {
            return;
        }
        if !observed {
            debug!(list = %self.key, "unobserved list marked stale");
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(list = %self.key, "no async runtime, skipping list revalidation");
            return;
        }
        info!(list = %self.key, "revalidating list after inconclusive match");
        drop(self.fetch(true));
    }

    fn objects_rolled_back(&self, objects: &[ObjectCacheKey]) {
        let snapshot = self.store.snapshot(&self.cache_key);
        let is_member = snapshot
            .entry
            .value
            .as_list()
            .is_some_and(|list| objects.iter().any(|k| list.contains(k)));
        if is_member {
            self.emit(&snapshot);
        }
    }
}

impl SubscriberCount for ListQuery {
    fn release_subscriber(&self, listener_id: Option<u64>) {
        if let Some(id) = listener_id {
            self.lock_listeners().retain(|l| l.id != id);
        }
        {
            let mut state = self.lock_state();
            state.subscribers = state.subscribers.saturating_sub(1);
            if state.subscribers == 0 && self.config.cancel_on_last_unsubscribe && state.abort_all() {
                debug!(list = %self.key, "list fetch aborted after last unsubscribe");
            }
        }
        self.store.release(&self.cache_key);
    }
}

impl fmt::Debug for ListQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListQuery")
            .field("key", &self.key)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

fn dedupe(keys: &mut Vec<ObjectCacheKey>) {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.retain(|k| seen.insert(k.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectPage;
    use async_trait::async_trait;
    use facet_types::{PrimaryKey, WhereClause};
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl ObjectBackend for Offline {
        async fn fetch_object_page(
            &self,
            _request: PageRequest,
            _signal: &AbortSignal,
        ) -> Result<ObjectPage, FetchError> {
            Err(FetchError::Network("offline".into()))
        }

        async fn fetch_object_by_key(
            &self,
            _object_type: &str,
            _primary_key: &PrimaryKey,
            _derived: &BTreeMap<RdpId, DerivedProperty>,
            _signal: &AbortSignal,
        ) -> Result<Option<ObjectInstance>, FetchError> {
            Err(FetchError::Network("offline".into()))
        }
    }

    fn todo(pk: i64, status: &str) -> Arc<ObjectInstance> {
        Arc::new(ObjectInstance::new("Todo", pk).with_property("status", status))
    }

    fn list(store: &Arc<Store>, clause: serde_json::Value) -> Arc<ListQuery> {
        let key = store.list_key("Todo", &WhereClause::from_json(&clause).unwrap());
        ListQuery::new(key, Arc::clone(store), Arc::new(Offline), QueryConfig::default(), None)
    }

    fn seed(store: &Store, query: &ListQuery, objects: &[Arc<ObjectInstance>]) {
        store.batch(BatchOptions::base(), |b| {
            let keys = objects.iter().map(|o| o.cache_key()).collect();
            for o in objects {
                b.write_object(Arc::clone(o), Status::Loaded);
            }
            query.write_to_store(b, keys, Status::Loaded);
        });
    }

    fn member_keys(store: &Store, query: &ListQuery) -> Vec<PrimaryKey> {
        store
            .read(&CacheKey::List(query.key().clone()))
            .and_then(|e| e.value.as_list().cloned())
            .map(|l| l.iter().map(|k| k.primary_key().clone()).collect())
            .unwrap_or_default()
    }

    fn recorder() -> (ListListener, Arc<Mutex<Vec<ListPayload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |p: &ListPayload| sink.lock().unwrap().push(p.clone())), seen)
    }

    #[test]
    fn identical_sequence_is_not_modified() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        seed(&store, &query, &[todo(1, "open"), todo(2, "open")]);
        let before = store.read(&CacheKey::List(query.key().clone())).unwrap();

        store.batch(BatchOptions::base(), |b| {
            let keys = vec![todo(1, "").cache_key(), todo(2, "").cache_key()];
            query.write_to_store(b, keys, Status::Loaded);
            assert!(!b.is_list_modified(query.key()));
        });
        let after = store.read(&CacheKey::List(query.key().clone())).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn duplicate_keys_are_collapsed() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({}));
        store.batch(BatchOptions::base(), |b| {
            let k = todo(1, "").cache_key();
            query.write_to_store(b, vec![k.clone(), k], Status::Loaded);
        });
        assert_eq!(member_keys(&store, &query), vec![PrimaryKey::Integer(1)]);
    }

    #[test]
    fn strict_match_is_inserted() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        seed(&store, &query, &[todo(1, "open")]);
        let (listener, seen) = recorder();
        let _sub = query.subscribe(BTreeSet::new(), listener);

        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(2, "open"), Status::Loaded);
            b.write_object(todo(3, "done"), Status::Loaded);
        });

        assert_eq!(
            member_keys(&store, &query),
            vec![PrimaryKey::Integer(1), PrimaryKey::Integer(2)]
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().objects.len(), 2);
        assert_eq!(seen.last().unwrap().status, Status::Loaded);
    }

    #[test]
    fn no_longer_matching_member_is_removed() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        seed(&store, &query, &[todo(1, "open"), todo(2, "open")]);

        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(1, "done"), Status::Loaded);
        });
        assert_eq!(member_keys(&store, &query), vec![PrimaryKey::Integer(2)]);
    }

    #[test]
    fn deleted_member_is_removed() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({}));
        seed(&store, &query, &[todo(1, "open"), todo(2, "open")]);

        store.batch(BatchOptions::base(), |b| {
            b.delete(todo(2, "").cache_key());
        });
        assert_eq!(member_keys(&store, &query), vec![PrimaryKey::Integer(1)]);
    }

    #[test]
    fn sorta_match_flags_revalidation_without_insert() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": {"$containsAnyTerm": "open"}}));
        seed(&store, &query, &[]);

        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(9, "open"), Status::Loaded);
            // revalidation runs after the batch; keep it from spawning here
            let flagged = query.maybe_update_list(&b.changes().clone(), b);
            assert!(flagged);
        });
        assert!(member_keys(&store, &query).is_empty());
    }

    #[test]
    fn optimistic_batch_inserts_but_never_removes() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        seed(&store, &query, &[todo(1, "open")]);
        let (listener, seen) = recorder();
        let _sub = query.subscribe(BTreeSet::new(), listener);

        let id = facet_types::OptimisticId::new();
        store.batch(BatchOptions::optimistic(id), |b| {
            b.write_object(todo(1, "done"), Status::Loaded);
            b.write_object(todo(2, "open"), Status::Loaded);
        });
        assert_eq!(
            member_keys(&store, &query),
            vec![PrimaryKey::Integer(1), PrimaryKey::Integer(2)]
        );
        assert!(seen.lock().unwrap().last().unwrap().is_optimistic);

        store.remove_layer(id).unwrap();
        assert_eq!(member_keys(&store, &query), vec![PrimaryKey::Integer(1)]);
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert!(!last.is_optimistic);
        assert_eq!(last.objects[0].get("status"), Some(&json!("open")));
    }

    #[test]
    fn member_update_reemits_list() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({}));
        seed(&store, &query, &[todo(1, "open")]);
        let (listener, seen) = recorder();
        let _sub = query.subscribe(BTreeSet::new(), listener);

        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(1, "done"), Status::Loaded);
        });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].objects[0].get("status"), Some(&json!("done")));
    }

    #[test]
    fn unfetched_list_is_left_alone() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(1, "open"), Status::Loaded);
        });
        assert!(store.read(&CacheKey::List(query.key().clone())).is_none());
    }

    #[test]
    fn unobserved_sorta_match_marks_list_stale() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": {"$containsAnyTerm": "open"}}));
        seed(&store, &query, &[]);
        query.lock_state().last_fetched = Some(Instant::now());

        // no runtime: a refetch attempt would only log
        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(9, "open"), Status::Loaded);
        });
        let state = query.lock_state();
        assert!(state.last_fetched.is_none());
        assert!(!state.revalidate_pending);
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn shown_members_are_retained() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({}));
        seed(&store, &query, &[todo(1, "open"), todo(2, "open")]);
        let object = |pk: i64| CacheKey::Object(todo(pk, "open").cache_key());
        assert_eq!(store.ref_count(&object(1)), Some(0));

        let (listener, _seen) = recorder();
        let _sub = query.subscribe(BTreeSet::new(), listener);
        assert_eq!(store.ref_count(&object(1)), Some(1));
        assert_eq!(store.ref_count(&object(2)), Some(1));
        assert_eq!(store.ref_count(&CacheKey::List(query.key().clone())), Some(1));

        store.batch(BatchOptions::base(), |b| {
            query.write_to_store(b, vec![todo(1, "open").cache_key()], Status::Loaded);
        });
        assert_eq!(store.ref_count(&object(2)), Some(0));

        query.dispose();
        assert_eq!(store.ref_count(&object(1)), Some(0));
    }

    #[test]
    fn disposed_list_ignores_matching_writes() {
        let store = Arc::new(Store::new());
        let query = list(&store, json!({"status": "open"}));
        seed(&store, &query, &[todo(1, "open")]);
        query.dispose();

        store.batch(BatchOptions::base(), |b| {
            b.write_object(todo(2, "open"), Status::Loaded);
        });
        assert_eq!(member_keys(&store, &query), vec![PrimaryKey::Integer(1)]);
    }
}
