use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use facet_query::{
    write_object_merged, BulkLoader, ListListener, ListQuery, ObjectBackend, ObjectListener,
    ObjectQuery, ObserveListOptions, ObserveObjectOptions, QuerySubscription, SharedFetch,
};
use facet_store::{BatchContext, BatchOptions, StoreResult, Store};
use facet_types::{
    CacheKey, DerivedProperty, DerivedPropertySet, ListCacheKey, ObjectCacheKey, ObjectInstance,
    OptimisticId, PrimaryKey, RdpId, Status, WhereClause,
};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::gc::GcWorker;

/// Entry point for observing and writing cached objects and lists.
///
/// One query exists per cache key until [`gc`](Self::gc) collects the key;
/// observers of the same key share its fetches.
pub struct ObservableClient {
    store: Arc<Store>,
    backend: Arc<dyn ObjectBackend>,
    config: ClientConfig,
    objects: Mutex<HashMap<ObjectCacheKey, Arc<ObjectQuery>>>,
    lists: Mutex<HashMap<ListCacheKey, Arc<ListQuery>>>,
}

impl ObservableClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, config: ClientConfig) -> Self {
        let store = Arc::new(Store::with_keep_alive(config.keep_alive));
        Self::with_store(store, backend, config)
    }

    /// Build a client over an existing store. The store's keep-alive window
    /// applies, not the one in `config`.
    pub fn with_store(store: Arc<Store>, backend: Arc<dyn ObjectBackend>, config: ClientConfig) -> Self {
        let backend: Arc<dyn ObjectBackend> = match config.bulk_load {
            Some(bulk) => {
                debug!(window = ?bulk.window, max_entries = bulk.max_entries, "bulk object loading enabled");
                Arc::new(BulkLoader::new(backend, bulk))
            }
            None => backend,
        };
        Self {
            store,
            backend,
            config,
            objects: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- Observation ----

    /// Observe one object. The listener receives the current payload
    /// immediately, then every change, restricted to the derived properties
    /// named in `options`.
    pub fn observe_object(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
        options: ObserveObjectOptions,
        listener: ObjectListener,
    ) -> ClientResult<QuerySubscription> {
        let fields = self.register_rdps(object_type, &options.derived_properties)?;
        let query = self.object_query(object_type, primary_key);
        Ok(query.observe(options.mode, fields, listener))
    }

    /// Observe the list of `object_type` objects matching `clause`.
    ///
    /// The first observer of a list fixes its page size.
    pub fn observe_list(
        &self,
        object_type: &str,
        clause: &WhereClause,
        options: ObserveListOptions,
        listener: ListListener,
    ) -> ClientResult<QuerySubscription> {
        let fields = self.register_rdps(object_type, &options.derived_properties)?;
        let query = self.list_query(object_type, clause, options.page_size);
        Ok(query.observe(options.mode, options.auto_fetch_more, fields, listener))
    }

    /// The query for one object, created on first use.
    pub fn object_query(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) -> Arc<ObjectQuery> {
        let key = ObjectCacheKey::new(object_type, primary_key);
        let mut objects = self.lock_objects();
        let query = objects.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "object query created");
            ObjectQuery::new(
                key,
                Arc::clone(&self.store),
                Arc::clone(&self.backend),
                self.config.query_config(),
            )
        });
        Arc::clone(query)
    }

    /// The query for one list, created on first use with `page_size`.
    pub fn list_query(&self, object_type: &str, clause: &WhereClause, page_size: Option<u32>) -> Arc<ListQuery> {
        let key = self.store.list_key(object_type, clause);
        let mut lists = self.lock_lists();
        let query = lists.entry(key.clone()).or_insert_with(|| {
            debug!(list = %key, ?page_size, "list query created");
            ListQuery::new(
                key,
                Arc::clone(&self.store),
                Arc::clone(&self.backend),
                self.config.query_config(),
                page_size,
            )
        });
        Arc::clone(query)
    }

    /// Load the next page of a list.
    pub fn fetch_more(&self, object_type: &str, clause: &WhereClause) -> SharedFetch {
        self.list_query(object_type, clause, None).fetch_more()
    }

    // ---- Writes ----

    /// Write a confirmed object. Derived values the cache already holds for
    /// fields `object` lacks are kept. Returns the stored object.
    pub fn update_object(&self, object: ObjectInstance) -> Arc<ObjectInstance> {
        let object = Arc::new(object);
        let written = self.store.batch(BatchOptions::base(), |b| {
            write_object_merged(b, Arc::clone(&object), Status::Loaded)
        });
        written.value.value.as_object().cloned().unwrap_or(object)
    }

    /// Replace a list's contents with `objects`, writing each object too.
    pub fn update_list(
        &self,
        object_type: &str,
        clause: &WhereClause,
        objects: Vec<ObjectInstance>,
    ) -> ClientResult<()> {
        if let Some(stray) = objects.iter().find(|o| o.object_type() != object_type) {
            return Err(ClientError::TypeMismatch {
                expected: object_type.to_string(),
                actual: stray.object_type().to_string(),
            });
        }
        let query = self.list_query(object_type, clause, None);
        self.store.batch(BatchOptions::base(), |b| {
            let keys = objects.iter().map(ObjectInstance::cache_key).collect();
            for object in objects {
                write_object_merged(b, Arc::new(object), Status::Loaded);
            }
            query.write_to_store(b, keys, Status::Loaded);
        });
        Ok(())
    }

    /// Tombstone an object and drop it from every live list of its type.
    pub fn delete_object(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) {
        let key = ObjectCacheKey::new(object_type, primary_key);
        self.store.batch(BatchOptions::base(), |b| {
            b.delete(key);
        });
    }

    /// Run `body` against a new optimistic layer tagged `id`. The writes show
    /// through until [`remove_optimistic_layer`](Self::remove_optimistic_layer).
    pub fn apply_optimistic<R>(&self, id: OptimisticId, body: impl FnOnce(&mut BatchContext<'_>) -> R) -> R {
        info!(layer = %id.short_id(), "applying optimistic update");
        self.store.batch(BatchOptions::optimistic(id), body).value
    }

    pub fn remove_optimistic_layer(&self, id: OptimisticId) -> ClientResult<()> {
        self.store.remove_layer(id)?;
        Ok(())
    }

    // ---- Invalidation ----

    /// Refetch one object, superseding any pending fetch of it.
    pub fn invalidate_object(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) -> SharedFetch {
        self.object_query(object_type, primary_key).revalidate()
    }

    /// Refetch every observed object and list of `object_type`.
    pub fn invalidate_object_type(&self, object_type: &str) -> Vec<SharedFetch> {
        let objects: Vec<Arc<ObjectQuery>> = self
            .lock_objects()
            .iter()
            .filter(|(key, query)| key.object_type() == object_type && query.subscriber_count() > 0)
            .map(|(_, query)| Arc::clone(query))
            .collect();
        let lists: Vec<Arc<ListQuery>> = self
            .lock_lists()
            .iter()
            .filter(|(key, query)| key.object_type() == object_type && query.subscriber_count() > 0)
            .map(|(_, query)| Arc::clone(query))
            .collect();

        info!(object_type, objects = objects.len(), lists = lists.len(), "invalidating object type");
        objects
            .iter()
            .map(|q| q.revalidate())
            .chain(lists.iter().map(|q| q.revalidate()))
            .collect()
    }

    // ---- Collection ----

    /// Drop every entry nobody retained for the keep-alive window, together
    /// with the queries serving them. Collected lists stop tracking changes;
    /// a later observe starts over with a fresh query. Returns the collected
    /// keys.
    pub fn gc(&self) -> Vec<CacheKey> {
        let collected = self.store.gc();
        let mut dropped = Vec::new();
        {
            let mut objects = self.lock_objects();
            let mut lists = self.lock_lists();
            for key in &collected {
                match key {
                    CacheKey::Object(key) => {
                        objects.remove(key);
                    }
                    CacheKey::List(key) => dropped.extend(lists.remove(key)),
                    CacheKey::RdpRegistry(_) => {}
                }
            }
        }
        for list in dropped {
            list.dispose();
        }
        collected
    }

    /// Run [`gc`](Self::gc) every `gc_interval` until the returned worker is
    /// stopped or dropped. Must be called inside a Tokio runtime.
    pub fn start_gc(self: &Arc<Self>) -> GcWorker {
        GcWorker::spawn(Arc::downgrade(self), self.config.gc_interval)
    }

    // ---- Derived properties ----

    pub fn get_all_rdps_for_type(&self, object_type: &str) -> BTreeMap<RdpId, DerivedProperty> {
        self.store.get_all_rdps_for_type(object_type)
    }

    fn register_rdps(&self, object_type: &str, set: &DerivedPropertySet) -> StoreResult<BTreeSet<String>> {
        if set.is_empty() {
            return Ok(BTreeSet::new());
        }
        let registered = self.store.register_rdps(object_type, set)?;
        Ok(registered.into_values().map(|p| p.name).collect())
    }

    fn lock_objects(&self) -> MutexGuard<'_, HashMap<ObjectCacheKey, Arc<ObjectQuery>>> {
        self.objects.lock().expect("object query map lock poisoned")
    }

    fn lock_lists(&self) -> MutexGuard<'_, HashMap<ListCacheKey, Arc<ListQuery>>> {
        self.lists.lock().expect("list query map lock poisoned")
    }
}

impl std::fmt::Debug for ObservableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableClient")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use facet_query::{
        AutoFetchMore, FetchError, FetchMode, ListPayload, ObjectPayload,
    };
    use facet_types::{Aggregation, DerivedPropertyBuilder};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<dyn Fn(&T) + Send + Sync>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |p: &T| sink.lock().unwrap().push(p.clone())), seen)
    }

    fn last<T: Clone>(seen: &Arc<Mutex<Vec<T>>>) -> T {
        seen.lock().unwrap().last().cloned().unwrap()
    }

    fn todo(pk: i64, status: &str) -> ObjectInstance {
        ObjectInstance::new("Todo", pk)
            .with_property("title", format!("todo {pk}"))
            .with_property("status", status)
    }

    fn setup(rows: impl IntoIterator<Item = ObjectInstance>) -> (Arc<InMemoryBackend>, ObservableClient) {
        setup_with(rows, ClientConfig::default())
    }

    fn setup_with(
        rows: impl IntoIterator<Item = ObjectInstance>,
        config: ClientConfig,
    ) -> (Arc<InMemoryBackend>, ObservableClient) {
        init_tracing();
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_all(rows);
        let client = ObservableClient::new(backend.clone(), config);
        (backend, client)
    }

    fn clause(value: Value) -> WhereClause {
        WhereClause::from_json(&value).unwrap()
    }

    fn list_options(page_size: Option<u32>, auto_fetch_more: AutoFetchMore) -> ObserveListOptions {
        ObserveListOptions {
            page_size,
            auto_fetch_more,
            ..Default::default()
        }
    }

    fn rdps(names: &[&str]) -> DerivedPropertySet {
        names
            .iter()
            .map(|n| {
                let definition = DerivedPropertyBuilder::new()
                    .pivot_to(*n)
                    .aggregate(Aggregation::Count);
                (n.to_string(), definition)
            })
            .collect()
    }

    fn pks(payload: &ListPayload) -> Vec<PrimaryKey> {
        payload.objects.iter().map(|o| o.primary_key().clone()).collect()
    }

    async fn until_held(backend: &InMemoryBackend, n: usize) {
        while backend.held() < n {
            tokio::task::yield_now().await;
        }
    }

    // ---------------------------------------------------------------------
    // Identity and dedup
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn reordered_where_clauses_share_one_list() {
        let (backend, client) = setup([todo(1, "open")]);
        let a = clause(json!({"status": "open", "title": "todo 1"}));
        let b = clause(json!({"title": "todo 1", "status": "open"}));

        let (l1, _) = recorder::<ListPayload>();
        let (l2, _) = recorder::<ListPayload>();
        let _s1 = client.observe_list("Todo", &a, Default::default(), l1).unwrap();
        let _s2 = client.observe_list("Todo", &b, Default::default(), l2).unwrap();

        let q1 = client.list_query("Todo", &a, None);
        let q2 = client.list_query("Todo", &b, None);
        assert!(Arc::ptr_eq(&q1, &q2));
        q1.fetch(false).await.unwrap();
        assert_eq!(backend.page_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_observers_share_one_fetch() {
        let (backend, client) = setup([todo(1, "open")]);
        let (l1, seen1) = recorder::<ObjectPayload>();
        let (l2, seen2) = recorder::<ObjectPayload>();

        let _s1 = client.observe_object("Todo", 1, Default::default(), l1).unwrap();
        let _s2 = client.observe_object("Todo", 1, Default::default(), l2).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();

        assert_eq!(backend.key_calls(), 1);
        for seen in [&seen1, &seen2] {
            let payload = last(seen);
            assert_eq!(payload.status, Status::Loaded);
            assert_eq!(payload.object.unwrap().get("status"), Some(&json!("open")));
        }
    }

    #[tokio::test]
    async fn recently_loaded_object_is_not_refetched() {
        let (backend, client) = setup_with([todo(1, "open")], ClientConfig::cached_for(Duration::from_secs(60)));
        let (listener, _) = recorder::<ObjectPayload>();
        let first = client.observe_object("Todo", 1, Default::default(), listener.clone()).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();
        drop(first);

        let (again, seen) = recorder::<ObjectPayload>();
        let _second = client.observe_object("Todo", 1, Default::default(), again).unwrap();
        assert_eq!(backend.key_calls(), 1);
        assert_eq!(last(&seen).status, Status::Loaded);
    }

    #[tokio::test]
    async fn offline_mode_never_fetches() {
        let (backend, client) = setup([todo(1, "open")]);
        let (listener, seen) = recorder::<ObjectPayload>();
        let options = ObserveObjectOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_object("Todo", 1, options, listener).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(backend.key_calls(), 0);
        let payload = last(&seen);
        assert_eq!(payload.status, Status::Init);
        assert!(payload.object.is_none());
    }

    // ---------------------------------------------------------------------
    // Batching and list writes
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn three_writes_in_one_batch_notify_once() {
        let (_, client) = setup([]);
        let (listener, seen) = recorder::<ObjectPayload>();
        let options = ObserveObjectOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_object("Todo", 1, options, listener).unwrap();

        client.store().batch(BatchOptions::base(), |b| {
            for status in ["a", "b", "c"] {
                b.write_object(Arc::new(todo(1, status)), Status::Loaded);
            }
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].object.as_ref().unwrap().get("status"), Some(&json!("c")));
    }

    #[test]
    fn identical_update_list_keeps_entry() {
        let (_, client) = setup([]);
        let open = clause(json!({"status": "open"}));
        client
            .update_list("Todo", &open, vec![todo(1, "open"), todo(2, "open")])
            .unwrap();
        let key = CacheKey::List(client.store().list_key("Todo", &open));
        let before = client.store().read(&key).unwrap();

        client
            .update_list("Todo", &open, vec![todo(1, "open"), todo(2, "open")])
            .unwrap();
        let after = client.store().read(&key).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn update_list_rejects_foreign_objects() {
        let (_, client) = setup([]);
        let err = client
            .update_list("Todo", &WhereClause::all(), vec![ObjectInstance::new("Employee", 1)])
            .unwrap_err();
        assert!(matches!(err, ClientError::TypeMismatch { .. }));
    }

    // ---------------------------------------------------------------------
    // Change-propagation
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn strict_match_is_inserted_without_fetch() {
        let (backend, client) = setup([todo(1, "open"), todo(2, "done")]);
        let open = clause(json!({"status": "open"}));
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &open, Default::default(), listener).unwrap();
        client.list_query("Todo", &open, None).fetch(false).await.unwrap();
        assert_eq!(pks(&last(&seen)), vec![PrimaryKey::Integer(1)]);

        client.update_object(todo(3, "open"));

        let payload = last(&seen);
        assert_eq!(pks(&payload), vec![PrimaryKey::Integer(1), PrimaryKey::Integer(3)]);
        assert_eq!(payload.status, Status::Loaded);
        assert_eq!(backend.page_calls(), 1);
    }

    #[tokio::test]
    async fn object_leaving_filter_leaves_list() {
        let (_, client) = setup([todo(1, "open"), todo(2, "open")]);
        let open = clause(json!({"status": "open"}));
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &open, Default::default(), listener).unwrap();
        client.list_query("Todo", &open, None).fetch(false).await.unwrap();

        client.update_object(todo(1, "done"));
        assert_eq!(pks(&last(&seen)), vec![PrimaryKey::Integer(2)]);
    }

    #[tokio::test]
    async fn sorta_match_triggers_refetch_instead_of_insert() {
        let (backend, client) = setup([todo(1, "open")]);
        let search = clause(json!({"title": {"$containsAnyTerm": "todo"}}));
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &search, Default::default(), listener).unwrap();
        let query = client.list_query("Todo", &search, None);
        query.fetch(false).await.unwrap();

        backend.insert(todo(2, "open"));
        client.update_object(todo(2, "open"));
        assert_eq!(pks(&last(&seen)), vec![PrimaryKey::Integer(1)]);

        // joins the revalidation started by the write
        query.fetch(false).await.unwrap();
        assert_eq!(backend.page_calls(), 2);
        let payload = last(&seen);
        assert_eq!(pks(&payload), vec![PrimaryKey::Integer(1), PrimaryKey::Integer(2)]);
        assert_eq!(payload.status, Status::Loaded);
    }

    #[tokio::test]
    async fn unobserved_search_list_is_not_refetched() {
        let (backend, client) =
            setup_with([todo(1, "open")], ClientConfig::cached_for(Duration::from_secs(60)));
        let search = clause(json!({"title": {"$containsAnyTerm": "todo"}}));
        let (listener, _) = recorder::<ListPayload>();
        let sub = client.observe_list("Todo", &search, Default::default(), listener).unwrap();
        client.list_query("Todo", &search, None).fetch(false).await.unwrap();
        drop(sub);

        for pk in 2..=4 {
            client.update_object(todo(pk, "open"));
        }
        tokio::task::yield_now().await;
        assert_eq!(backend.page_calls(), 1);

        // stale despite the dedupe interval
        let (listener, _) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &search, Default::default(), listener).unwrap();
        client.list_query("Todo", &search, None).fetch(false).await.unwrap();
        assert_eq!(backend.page_calls(), 2);
    }

    #[tokio::test]
    async fn missing_object_is_removed_from_lists() {
        let (backend, client) = setup([todo(1, "open"), todo(2, "open")]);
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client
            .observe_list("Todo", &WhereClause::all(), Default::default(), listener)
            .unwrap();
        client.list_query("Todo", &WhereClause::all(), None).fetch(false).await.unwrap();

        backend.remove("Todo", &PrimaryKey::Integer(2));
        client.invalidate_object("Todo", 2).await.unwrap();
        assert_eq!(pks(&last(&seen)), vec![PrimaryKey::Integer(1)]);
    }

    #[test]
    fn delete_object_drops_it_from_lists() {
        let (_, client) = setup([]);
        let all = WhereClause::all();
        client.update_list("Todo", &all, vec![todo(1, "open"), todo(2, "open")]).unwrap();
        let (listener, seen) = recorder::<ListPayload>();
        let options = ObserveListOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_list("Todo", &all, options, listener).unwrap();

        client.delete_object("Todo", 1);
        assert_eq!(pks(&last(&seen)), vec![PrimaryKey::Integer(2)]);
    }

    // ---------------------------------------------------------------------
    // Optimistic layers
    // ---------------------------------------------------------------------

    #[test]
    fn optimistic_update_rolls_back() {
        let (_, client) = setup([]);
        client.update_object(todo(1, "open"));
        let (listener, seen) = recorder::<ObjectPayload>();
        let options = ObserveObjectOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_object("Todo", 1, options, listener).unwrap();

        let id = OptimisticId::new();
        client.apply_optimistic(id, |b| {
            write_object_merged(b, Arc::new(todo(1, "done")), Status::Loaded);
        });
        let during = last(&seen);
        assert!(during.is_optimistic);
        assert_eq!(during.object.unwrap().get("status"), Some(&json!("done")));

        client.remove_optimistic_layer(id).unwrap();
        let after = last(&seen);
        assert!(!after.is_optimistic);
        assert_eq!(after.object.unwrap().get("status"), Some(&json!("open")));

        assert!(matches!(
            client.remove_optimistic_layer(id),
            Err(ClientError::Store(_))
        ));
    }

    // ---------------------------------------------------------------------
    // Derived properties
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn every_fetch_requests_the_registered_union() {
        let (backend, client) = setup([todo(1, "open"), todo(2, "open")]);
        let (l1, _) = recorder::<ObjectPayload>();
        let (l2, _) = recorder::<ObjectPayload>();

        let with_a = ObserveObjectOptions {
            derived_properties: rdps(&["a"]),
            ..Default::default()
        };
        let _s1 = client.observe_object("Todo", 1, with_a, l1).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();

        let with_b = ObserveObjectOptions {
            derived_properties: rdps(&["b"]),
            ..Default::default()
        };
        let _s2 = client.observe_object("Todo", 2, with_b, l2).unwrap();
        client.object_query("Todo", 2).fetch(false).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests[0].derived_fields, BTreeSet::from(["a".to_string()]));
        assert_eq!(
            requests[1].derived_fields,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(client.get_all_rdps_for_type("Todo").len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_only_their_derived_fields() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.set_derived_value("Todo", 1, "a", 1);
        backend.set_derived_value("Todo", 1, "b", 2);

        let (la, seen_a) = recorder::<ObjectPayload>();
        let (lb, seen_b) = recorder::<ObjectPayload>();
        let options = |names: &[&str]| ObserveObjectOptions {
            derived_properties: rdps(names),
            ..Default::default()
        };
        let _sa = client.observe_object("Todo", 1, options(&["a"]), la).unwrap();
        let _sb = client.observe_object("Todo", 1, options(&["b"]), lb).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();
        assert_eq!(backend.key_calls(), 1);

        let a = last(&seen_a).object.unwrap();
        assert_eq!(a.get("a"), Some(&json!(1)));
        assert_eq!(a.get("b"), None);
        let b = last(&seen_b).object.unwrap();
        assert_eq!(b.get("b"), Some(&json!(2)));
        assert_eq!(b.get("a"), None);
    }

    #[tokio::test]
    async fn property_registered_mid_fetch_gets_a_follow_up_fetch() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.set_derived_value("Todo", 1, "a", 1);
        backend.set_derived_value("Todo", 1, "b", 2);
        backend.pause();

        let options = |names: &[&str]| ObserveObjectOptions {
            derived_properties: rdps(names),
            ..Default::default()
        };
        let (la, _) = recorder::<ObjectPayload>();
        let (lb, seen_b) = recorder::<ObjectPayload>();
        let _sa = client.observe_object("Todo", 1, options(&["a"]), la).unwrap();
        until_held(&backend, 1).await;
        let _sb = client.observe_object("Todo", 1, options(&["b"]), lb).unwrap();

        backend.resume();
        client.object_query("Todo", 1).fetch(false).await.unwrap();

        assert_eq!(backend.key_calls(), 2);
        assert_eq!(
            backend.requests()[1].derived_fields,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(last(&seen_b).object.unwrap().get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn list_refetches_for_property_registered_mid_fetch() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.set_derived_value("Todo", 1, "b", 2);
        backend.pause();
        let all = WhereClause::all();

        let options = |names: &[&str]| ObserveListOptions {
            derived_properties: rdps(names),
            ..Default::default()
        };
        let (la, _) = recorder::<ListPayload>();
        let (lb, seen_b) = recorder::<ListPayload>();
        let _sa = client.observe_list("Todo", &all, options(&["a"]), la).unwrap();
        until_held(&backend, 1).await;
        let _sb = client.observe_list("Todo", &all, options(&["b"]), lb).unwrap();

        backend.resume();
        client.list_query("Todo", &all, None).fetch(false).await.unwrap();

        assert_eq!(backend.page_calls(), 2);
        assert_eq!(
            backend.requests()[1].derived_fields,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        let payload = last(&seen_b);
        assert_eq!(payload.status, Status::Loaded);
        assert_eq!(payload.objects[0].get("b"), Some(&json!(2)));
    }

    #[test]
    fn confirmed_write_keeps_cached_derived_values() {
        let (_, client) = setup([]);
        client.update_object(todo(1, "open").with_derived("a", 1));
        let stored = client.update_object(todo(1, "done").with_unfetched_derived("a"));
        assert_eq!(stored.get("a"), Some(&json!(1)));
        assert_eq!(stored.get("status"), Some(&json!("done")));

        let stored = client.update_object(todo(1, "done").with_derived("a", Value::Null));
        assert_eq!(stored.get("a"), Some(&Value::Null));
    }

    // ---------------------------------------------------------------------
    // Pagination
    // ---------------------------------------------------------------------

    fn hundred() -> Vec<ObjectInstance> {
        (1..=100).map(|i| todo(i, "open")).collect()
    }

    #[tokio::test]
    async fn auto_fetch_more_stops_at_first_boundary_past_target() {
        let (backend, client) = setup(hundred());
        let all = WhereClause::all();
        let (listener, seen) = recorder::<ListPayload>();
        let options = list_options(Some(20), AutoFetchMore::AtLeast(50));
        let _sub = client.observe_list("Todo", &all, options, listener).unwrap();
        client.list_query("Todo", &all, None).fetch(false).await.unwrap();

        let payload = last(&seen);
        assert_eq!(payload.objects.len(), 60);
        assert_eq!(payload.status, Status::Loaded);
        assert!(payload.has_more);
        assert_eq!(backend.page_calls(), 3);
    }

    #[tokio::test]
    async fn auto_fetch_all_stops_when_exhausted() {
        let (_, client) = setup((1..=45).map(|i| todo(i, "open")));
        let all = WhereClause::all();
        let (listener, seen) = recorder::<ListPayload>();
        let options = list_options(Some(20), AutoFetchMore::All);
        let _sub = client.observe_list("Todo", &all, options, listener).unwrap();
        client.list_query("Todo", &all, None).fetch(false).await.unwrap();

        let payload = last(&seen);
        assert_eq!(payload.objects.len(), 45);
        assert_eq!(payload.status, Status::Loaded);
        assert!(!payload.has_more);
    }

    #[tokio::test]
    async fn concurrent_fetch_more_calls_share_one_page() {
        let (backend, client) = setup(hundred());
        let all = WhereClause::all();
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client
            .observe_list("Todo", &all, list_options(Some(20), AutoFetchMore::Off), listener)
            .unwrap();
        client.list_query("Todo", &all, None).fetch(false).await.unwrap();
        assert_eq!(last(&seen).objects.len(), 20);

        let first = client.fetch_more("Todo", &all);
        let second = client.fetch_more("Todo", &all);
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(backend.page_calls(), 2);
        let payload = last(&seen);
        assert_eq!(payload.objects.len(), 40);
        assert_eq!(pks(&payload)[20], PrimaryKey::Integer(21));
    }

    #[tokio::test]
    async fn fetch_more_during_auto_fetch_is_queued() {
        let (backend, client) = setup(hundred());
        let all = WhereClause::all();
        let (listener, seen) = recorder::<ListPayload>();
        let options = list_options(Some(20), AutoFetchMore::AtLeast(40));
        let _sub = client.observe_list("Todo", &all, options, listener).unwrap();

        client.fetch_more("Todo", &all).await.unwrap();

        assert_eq!(backend.page_calls(), 3);
        let payload = last(&seen);
        assert_eq!(payload.objects.len(), 60);
        assert_eq!(payload.status, Status::Loaded);
    }

    #[tokio::test]
    async fn fetch_more_after_last_page_is_a_no_op() {
        let (backend, client) = setup((1..=5).map(|i| todo(i, "open")));
        let all = WhereClause::all();
        let (listener, _) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &all, Default::default(), listener).unwrap();
        client.list_query("Todo", &all, None).fetch(false).await.unwrap();

        client.fetch_more("Todo", &all).await.unwrap();
        assert_eq!(backend.page_calls(), 1);
    }

    // ---------------------------------------------------------------------
    // Failure and cancellation
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn fetch_error_keeps_last_known_value() {
        let (backend, client) = setup([todo(1, "open")]);
        let (listener, seen) = recorder::<ObjectPayload>();
        let _sub = client.observe_object("Todo", 1, Default::default(), listener).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();

        backend.fail_next(FetchError::Network("connection reset".into()));
        let err = client.invalidate_object("Todo", 1).await.unwrap_err();
        assert!(!err.is_aborted());

        let payload = last(&seen);
        assert_eq!(payload.status, Status::Error);
        assert_eq!(payload.object.unwrap().get("status"), Some(&json!("open")));
    }

    #[tokio::test]
    async fn last_unsubscribe_aborts_pending_fetch() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.pause();
        let (listener, _) = recorder::<ObjectPayload>();
        let sub = client.observe_object("Todo", 1, Default::default(), listener).unwrap();
        let pending = client.object_query("Todo", 1).fetch(false);
        tokio::task::yield_now().await;

        drop(sub);
        let err = pending.await.unwrap_err();
        assert!(err.is_aborted());
        backend.resume();

        let entry = client
            .store()
            .read(&CacheKey::Object(ObjectCacheKey::new("Todo", 1)))
            .unwrap();
        assert!(entry.value.as_object().is_none());
        assert_eq!(entry.status, Status::Init);

        let (listener, seen) = recorder::<ObjectPayload>();
        let offline = ObserveObjectOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_object("Todo", 1, offline, listener).unwrap();
        assert_eq!(last(&seen).status, Status::Init);
        assert_eq!(backend.key_calls(), 1);
    }

    #[tokio::test]
    async fn aborted_refetch_restores_loaded_status() {
        let (backend, client) = setup([todo(1, "open")]);
        let (listener, seen) = recorder::<ObjectPayload>();
        let sub = client.observe_object("Todo", 1, Default::default(), listener).unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();

        backend.pause();
        let pending = client.invalidate_object("Todo", 1);
        until_held(&backend, 1).await;
        assert_eq!(last(&seen).status, Status::Loading);

        drop(sub);
        assert!(pending.await.unwrap_err().is_aborted());
        let entry = client
            .store()
            .read(&CacheKey::Object(ObjectCacheKey::new("Todo", 1)))
            .unwrap();
        assert_eq!(entry.status, Status::Loaded);
        assert_eq!(entry.value.as_object().unwrap().get("status"), Some(&json!("open")));
    }

    #[tokio::test]
    async fn aborted_list_fetch_restores_init_status() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.pause();
        let all = WhereClause::all();
        let (listener, _) = recorder::<ListPayload>();
        let sub = client.observe_list("Todo", &all, Default::default(), listener).unwrap();
        let pending = client.list_query("Todo", &all, None).fetch(false);
        until_held(&backend, 1).await;

        drop(sub);
        assert!(pending.await.unwrap_err().is_aborted());
        backend.resume();

        let (listener, seen) = recorder::<ListPayload>();
        let offline = ObserveListOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _sub = client.observe_list("Todo", &all, offline, listener).unwrap();
        let payload = last(&seen);
        assert_eq!(payload.status, Status::Init);
        assert!(payload.objects.is_empty());
    }

    // ---------------------------------------------------------------------
    // Out-of-order completion
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn stale_object_fetch_finishing_last_is_discarded() {
        let (backend, client) = setup([todo(1, "open")]);
        backend.pause();
        backend.ignore_aborts();
        let (listener, seen) = recorder::<ObjectPayload>();
        let _sub = client.observe_object("Todo", 1, Default::default(), listener).unwrap();
        let query = client.object_query("Todo", 1);
        let stale = query.fetch(false);
        until_held(&backend, 1).await;

        backend.insert(todo(1, "done"));
        let newer = query.revalidate();
        until_held(&backend, 2).await;
        backend.release_newest();
        newer.await.unwrap();
        assert_eq!(last(&seen).object.unwrap().get("status"), Some(&json!("done")));

        backend.release(1);
        assert!(stale.await.unwrap_err().is_aborted());
        let payload = last(&seen);
        assert_eq!(payload.status, Status::Loaded);
        assert_eq!(payload.object.unwrap().get("status"), Some(&json!("done")));
        assert_eq!(backend.key_calls(), 2);
    }

    #[tokio::test]
    async fn stale_page_finishing_after_revalidate_is_discarded() {
        let (backend, client) = setup((1..=40).map(|i| todo(i, "open")));
        let all = WhereClause::all();
        let (listener, seen) = recorder::<ListPayload>();
        let _sub = client
            .observe_list("Todo", &all, list_options(Some(20), AutoFetchMore::Off), listener)
            .unwrap();
        let query = client.list_query("Todo", &all, None);
        query.fetch(false).await.unwrap();
        assert_eq!(last(&seen).objects.len(), 20);

        backend.pause();
        backend.ignore_aborts();
        let more = query.fetch_more();
        until_held(&backend, 1).await;

        for pk in 2..=40 {
            backend.remove("Todo", &PrimaryKey::Integer(pk));
        }
        let newer = query.revalidate();
        until_held(&backend, 2).await;
        backend.release_newest();
        newer.await.unwrap();

        backend.release(1);
        assert!(more.await.unwrap_err().is_aborted());
        let payload = last(&seen);
        assert_eq!(pks(&payload), vec![PrimaryKey::Integer(1)]);
        assert_eq!(payload.status, Status::Loaded);
        assert!(!payload.has_more);
        assert_eq!(backend.page_calls(), 3);
    }

    #[tokio::test]
    async fn invalidate_object_type_refetches_observed_queries() {
        let (backend, client) = setup([todo(1, "open")]);
        let (lo, _) = recorder::<ObjectPayload>();
        let (ll, _) = recorder::<ListPayload>();
        let _so = client.observe_object("Todo", 1, Default::default(), lo).unwrap();
        let _sl = client
            .observe_list("Todo", &WhereClause::all(), Default::default(), ll)
            .unwrap();
        client.object_query("Todo", 1).fetch(false).await.unwrap();
        client.list_query("Todo", &WhereClause::all(), None).fetch(false).await.unwrap();
        // never observed, so not refetched
        let _idle = client.object_query("Todo", 2);

        let fetches = client.invalidate_object_type("Todo");
        assert_eq!(fetches.len(), 2);
        for fetch in fetches {
            fetch.await.unwrap();
        }
        assert_eq!(backend.key_calls(), 2);
        assert_eq!(backend.page_calls(), 2);
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    fn collecting() -> ClientConfig {
        ClientConfig {
            keep_alive: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn gc_keeps_observed_keys_and_their_members() {
        let (_, client) = setup_with([todo(1, "open"), todo(2, "open")], collecting());
        let open = clause(json!({"status": "open"}));
        let (listener, _) = recorder::<ListPayload>();
        let _sub = client.observe_list("Todo", &open, Default::default(), listener).unwrap();
        client.list_query("Todo", &open, None).fetch(false).await.unwrap();

        assert!(client.gc().is_empty());
        let member = CacheKey::Object(ObjectCacheKey::new("Todo", 2));
        assert!(client.store().read(&member).is_some());
    }

    #[tokio::test]
    async fn gc_evicts_unobserved_list_and_its_query() {
        let (_, client) = setup_with([todo(1, "open"), todo(2, "open")], collecting());
        let open = clause(json!({"status": "open"}));
        let (listener, _) = recorder::<ListPayload>();
        let list_sub = client.observe_list("Todo", &open, Default::default(), listener).unwrap();
        let query = client.list_query("Todo", &open, None);
        query.fetch(false).await.unwrap();
        let (listener, _) = recorder::<ObjectPayload>();
        let offline = ObserveObjectOptions {
            mode: FetchMode::Offline,
            ..Default::default()
        };
        let _object_sub = client.observe_object("Todo", 1, offline, listener).unwrap();

        drop(list_sub);
        let list_key = CacheKey::List(query.key().clone());
        assert_eq!(client.gc(), vec![list_key.clone()]);
        // members the list held go idle once it is collected
        assert_eq!(
            client.gc(),
            vec![CacheKey::Object(ObjectCacheKey::new("Todo", 2))]
        );
        assert!(client
            .store()
            .read(&CacheKey::Object(ObjectCacheKey::new("Todo", 1)))
            .is_some());

        // the collected list no longer tracks matching writes
        client.update_object(todo(3, "open"));
        assert!(client.store().read(&list_key).is_none());
        assert!(!Arc::ptr_eq(&query, &client.list_query("Todo", &open, None)));
    }

    #[tokio::test]
    async fn gc_worker_collects_in_background() {
        let config = ClientConfig {
            gc_interval: Duration::from_millis(5),
            ..collecting()
        };
        let (_, client) = setup_with([], config);
        let client = Arc::new(client);
        client.update_object(todo(1, "open"));
        let key = CacheKey::Object(ObjectCacheKey::new("Todo", 1));

        let worker = client.start_gc();
        while client.store().read(&key).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.stop().await;
        assert_eq!(client.store().ref_count(&key), None);
    }

    #[tokio::test]
    async fn bulk_loading_batches_object_fetches() {
        let config = ClientConfig {
            bulk_load: Some(facet_query::BulkLoadConfig::default()),
            ..Default::default()
        };
        let (backend, client) = setup_with([todo(1, "open"), todo(2, "open")], config);
        let (l1, seen1) = recorder::<ObjectPayload>();
        let (l2, seen2) = recorder::<ObjectPayload>();
        let (l3, seen3) = recorder::<ObjectPayload>();
        let _s1 = client.observe_object("Todo", 1, Default::default(), l1).unwrap();
        let _s2 = client.observe_object("Todo", 2, Default::default(), l2).unwrap();
        let _s3 = client.observe_object("Todo", 3, Default::default(), l3).unwrap();

        for pk in 1..=3 {
            client.object_query("Todo", pk).fetch(false).await.unwrap();
        }
        assert_eq!(backend.bulk_calls(), 1);
        assert_eq!(backend.key_calls(), 0);
        assert!(last(&seen1).object.is_some());
        assert!(last(&seen2).object.is_some());
        assert!(last(&seen3).object.is_none());
        assert_eq!(last(&seen3).status, Status::Loaded);
    }
}
