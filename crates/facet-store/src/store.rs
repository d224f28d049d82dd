use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use facet_canon::{RdpCanonicalizer, WhereClauseCanonicalizer};
use facet_types::{
    CacheKey, Canonical, DerivedProperty, DerivedPropertySet, ListCacheKey, ObjectCacheKey,
    OptimisticId, RdpId, Status, WhereClause,
};
use tracing::{debug, info};

use crate::batch::{BatchContext, BatchOptions, BatchOutcome};
use crate::entry::{CacheValue, Entry};
use crate::error::{StoreError, StoreResult};
use crate::layer::Layers;
use crate::propagation::{propagate, ListMembership};
use crate::rdp_registry::RdpRegistry;
use crate::refcount::RefCounts;
use crate::subscription::{Listener, Snapshot, SubscriberRegistry, Subscription};

thread_local! {
    static IN_BATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a batch for its lifetime.
struct BatchGuard;

impl BatchGuard {
    fn enter() -> Self {
        IN_BATCH.with(|flag| {
            assert!(
                !flag.replace(true),
                "Store::batch called from inside a running batch"
            );
        });
        BatchGuard
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        IN_BATCH.with(|flag| flag.set(false));
    }
}

/// How long an object or list entry nobody retains stays cached.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// The single source of truth for cached entries.
///
/// Object and list entries are reference counted: queries
/// [`retain`](Self::retain) the keys they serve and [`release`](Self::release)
/// them when their last subscriber leaves. [`gc`](Self::gc) drops entries that
/// stayed unretained for the keep-alive window.
pub struct Store {
    state: Mutex<Layers>,
    subscribers: Arc<SubscriberRegistry>,
    rdps: RwLock<RdpRegistry>,
    lists: RwLock<HashMap<ListCacheKey, Weak<dyn ListMembership>>>,
    refs: Mutex<RefCounts<CacheKey>>,
    where_clauses: WhereClauseCanonicalizer,
    rdp_canonicalizer: RdpCanonicalizer,
}

impl Store {
    /// Create an empty store with the [`DEFAULT_KEEP_ALIVE`] window.
    pub fn new() -> Self {
        Self::with_keep_alive(DEFAULT_KEEP_ALIVE)
    }

    /// Create an empty store whose unretained entries become collectable
    /// after `keep_alive`.
    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        Self {
            state: Mutex::new(Layers::new()),
            subscribers: Arc::new(SubscriberRegistry::default()),
            rdps: RwLock::new(RdpRegistry::new()),
            lists: RwLock::new(HashMap::new()),
            refs: Mutex::new(RefCounts::new(keep_alive)),
            where_clauses: WhereClauseCanonicalizer::new(),
            rdp_canonicalizer: RdpCanonicalizer::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The visible entry for `key`.
    pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    /// The confirmed entry for `key`, ignoring optimistic layers.
    pub fn read_base(&self, key: &CacheKey) -> Option<Arc<Entry>> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .get_base(key)
            .cloned()
    }

    /// What a subscriber of `key` would see right now. Unknown keys read as
    /// an [`Init`](Status::Init) entry.
    pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
        let layers = self.state.lock().expect("store lock poisoned");
        snapshot_of(&layers, key)
    }

    /// Number of optimistic layers on the stack.
    pub fn layer_depth(&self) -> usize {
        self.state.lock().expect("store lock poisoned").depth()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Run `body` as one batch.
    ///
    /// With an optimistic id, a new layer is pushed first and every write
    /// lands in it until [`remove_layer`](Self::remove_layer). After `body`
    /// returns, object changes are propagated into live lists inside the same
    /// batch, then every touched key is notified once with its final entry.
    ///
    /// # Panics
    ///
    /// Panics if called from inside another batch on the same thread.
    pub fn batch<R>(
        &self,
        options: BatchOptions,
        body: impl FnOnce(&mut BatchContext<'_>) -> R,
    ) -> BatchOutcome<R> {
        let guard = BatchGuard::enter();
        let mut layers = self.state.lock().expect("store lock poisoned");
        if let Some(id) = options.optimistic_id {
            layers.push(id);
            debug!(layer = %id.short_id(), depth = layers.depth(), "optimistic layer pushed");
        }

        let mut ctx = BatchContext::new(&mut layers, options.optimistic_id);
        let value = body(&mut ctx);

        let changes = ctx.changes().clone();
        let pending = if changes.is_empty() {
            Vec::new()
        } else {
            propagate(self.live_lists(), &changes, &mut ctx)
        };

        let (touched, changes) = ctx.into_parts();
        let snapshots: Vec<Snapshot> = touched.iter().map(|k| snapshot_of(&layers, k)).collect();
        drop(layers);
        drop(guard);
        self.track(&touched);

        debug!(
            touched = touched.len(),
            changed_objects = changes.len(),
            optimistic = options.optimistic_id.is_some(),
            "batch flushed"
        );
        self.subscribers.notify(&snapshots);
        for list in pending {
            list.maybe_revalidate_list();
        }

        BatchOutcome {
            value,
            changes,
            touched,
        }
    }

    /// Roll back every optimistic layer tagged `id` and re-notify each key
    /// whose visible entry changes as a result.
    pub fn remove_layer(&self, id: OptimisticId) -> StoreResult<()> {
        let guard = BatchGuard::enter();
        let mut layers = self.state.lock().expect("store lock poisoned");
        let before: Vec<(CacheKey, Option<Arc<Entry>>)> = layers
            .keys_in(id)
            .into_iter()
            .map(|k| {
                let entry = layers.get(&k).cloned();
                (k, entry)
            })
            .collect();
        if layers.remove(id).is_none() {
            return Err(StoreError::UnknownLayer(id));
        }

        let snapshots: Vec<Snapshot> = before
            .into_iter()
            .filter(|(k, old)| match (old, layers.get(k)) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            })
            .map(|(k, _)| snapshot_of(&layers, &k))
            .collect();
        let depth = layers.depth();
        drop(layers);
        drop(guard);

        info!(layer = %id.short_id(), depth, renotified = snapshots.len(), "optimistic layer removed");
        self.subscribers.notify(&snapshots);

        let rolled_back: Vec<ObjectCacheKey> = snapshots
            .iter()
            .filter_map(|s| s.key.as_object().cloned())
            .collect();
        if !rolled_back.is_empty() {
            for list in self.live_lists() {
                let object_type = list.list_key().object_type();
                let objects: Vec<ObjectCacheKey> = rolled_back
                    .iter()
                    .filter(|k| k.object_type() == object_type)
                    .cloned()
                    .collect();
                if !objects.is_empty() {
                    list.objects_rolled_back(&objects);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Observe `key`. The listener receives the current snapshot immediately
    /// and then once per batch that changes the visible entry.
    pub fn subscribe(&self, key: CacheKey, listener: Listener) -> Subscription {
        let subscription = self.subscribers.add(key.clone(), Arc::clone(&listener));
        let current = self.snapshot(&key);
        listener(&current);
        subscription
    }

    /// Number of listeners on `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.count(key)
    }

    // -----------------------------------------------------------------------
    // Canonicalization and derived properties
    // -----------------------------------------------------------------------

    /// The interned canonical form of `clause`. Equivalent clauses return
    /// equal values.
    pub fn canonicalize_where_clause(&self, clause: &WhereClause) -> Canonical<WhereClause> {
        self.where_clauses.canonicalize(clause)
    }

    /// The list key for `object_type` filtered by `clause`.
    pub fn list_key(&self, object_type: &str, clause: &WhereClause) -> ListCacheKey {
        ListCacheKey::new(object_type, self.canonicalize_where_clause(clause))
    }

    /// Canonicalize `set` and add it to the union for `object_type`.
    ///
    /// Returns the canonical ids of the requested properties. When the union
    /// grows, the registry entry for the type is rewritten so its observers
    /// see the new union.
    pub fn register_rdps(
        &self,
        object_type: &str,
        set: &DerivedPropertySet,
    ) -> StoreResult<BTreeMap<RdpId, DerivedProperty>> {
        let requested = self.rdp_canonicalizer.canonicalize_each(set)?;
        if requested.is_empty() {
            return Ok(requested);
        }

        let union = {
            let mut registry = self.rdps.write().expect("rdp registry lock poisoned");
            if !registry.register(object_type, &requested)? {
                return Ok(requested);
            }
            registry.get(object_type)
        };

        info!(object_type, registered = union.len(), "derived properties registered");
        self.batch(BatchOptions::base(), |batch| {
            batch.write(
                CacheKey::RdpRegistry(object_type.to_string()),
                CacheValue::Registry(Arc::new(union)),
                Status::Loaded,
            );
        });
        Ok(requested)
    }

    /// The union of derived properties registered for `object_type`.
    pub fn get_all_rdps_for_type(&self, object_type: &str) -> BTreeMap<RdpId, DerivedProperty> {
        self.rdps
            .read()
            .expect("rdp registry lock poisoned")
            .get(object_type)
    }

    // -----------------------------------------------------------------------
    // Live lists
    // -----------------------------------------------------------------------

    /// Make `list` receive change-propagation. The store keeps only a weak
    /// reference.
    pub fn register_list<L: ListMembership + 'static>(&self, list: &Arc<L>) {
        let weak: Weak<dyn ListMembership> = Arc::downgrade(list) as Weak<dyn ListMembership>;
        let key = list.list_key().clone();
        debug!(list = %key, "list registered");
        self.lists
            .write()
            .expect("list registry lock poisoned")
            .insert(key, weak);
    }

    /// Stop change-propagation into the list registered under `key`.
    pub fn unregister_list(&self, key: &ListCacheKey) {
        let removed = self
            .lists
            .write()
            .expect("list registry lock poisoned")
            .remove(key);
        if removed.is_some() {
            debug!(list = %key, "list unregistered");
        }
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    /// Keep `key` cached until a matching [`release`](Self::release).
    pub fn retain(&self, key: &CacheKey) {
        self.lock_refs().retain(key.clone());
    }

    /// Drop one reference to `key`. Once none remain the entry becomes
    /// collectable after the keep-alive window.
    pub fn release(&self, key: &CacheKey) {
        if self.lock_refs().release(key, Instant::now()) {
            debug!(key = %key, "cache key idle");
        }
    }

    /// Current reference count of `key`, `None` if the key is not tracked.
    pub fn ref_count(&self, key: &CacheKey) -> Option<usize> {
        self.lock_refs().count(key)
    }

    /// Drop every object and list entry that stayed unretained for the
    /// keep-alive window, and stop propagating into collected lists. Entries
    /// still held by an optimistic layer are kept and retried later. Returns
    /// the collected keys.
    ///
    /// Subscribers of a collected key are not notified.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a batch on the same thread.
    pub fn gc(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let expired = self.lock_refs().collect(now);
        if expired.is_empty() {
            return expired;
        }

        let mut collected = Vec::new();
        let mut kept = Vec::new();
        {
            let _guard = BatchGuard::enter();
            let mut layers = self.state.lock().expect("store lock poisoned");
            let mut refs = self.lock_refs();
            for key in expired {
                if refs.count(&key).is_some() {
                    // retained again since it expired
                    continue;
                }
                if layers.evict(&key) || layers.get(&key).is_none() {
                    collected.push(key);
                } else {
                    kept.push(key);
                }
            }
            for key in &kept {
                refs.register(key.clone(), now);
            }
        }
        for key in &collected {
            if let CacheKey::List(list) = key {
                self.unregister_list(list);
            }
        }
        info!(collected = collected.len(), kept = kept.len(), "cache gc finished");
        collected
    }

    fn track(&self, touched: &[CacheKey]) {
        let now = Instant::now();
        let mut refs = self.lock_refs();
        for key in touched {
            if !matches!(key, CacheKey::RdpRegistry(_)) {
                refs.register(key.clone(), now);
            }
        }
    }

    fn lock_refs(&self) -> MutexGuard<'_, RefCounts<CacheKey>> {
        self.refs.lock().expect("ref count lock poisoned")
    }

    fn live_lists(&self) -> Vec<Arc<dyn ListMembership>> {
        let mut lists = self.lists.write().expect("list registry lock poisoned");
        lists.retain(|_, weak| weak.strong_count() > 0);
        lists.values().filter_map(Weak::upgrade).collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("layer_depth", &self.layer_depth())
            .finish_non_exhaustive()
    }
}

fn snapshot_of(layers: &Layers, key: &CacheKey) -> Snapshot {
    let entry = layers
        .get(key)
        .cloned()
        .unwrap_or_else(|| Arc::new(Entry::init(key.clone())));
    Snapshot {
        key: key.clone(),
        entry,
        is_optimistic: layers.is_optimistic(key),
    }
}
