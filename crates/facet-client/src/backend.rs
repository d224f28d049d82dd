//! In-memory [`ObjectBackend`] for tests and local development.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use facet_query::{evaluate, AbortSignal, FetchError, MatchResult, ObjectBackend, ObjectPage, PageRequest};
use facet_types::{DerivedProperty, ObjectInstance, PrimaryKey, RdpId};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// One request the backend served.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub object_type: String,
    /// `None` for key lookups.
    pub page_token: Option<String>,
    pub page_size: Option<u32>,
    /// Field names of the derived properties requested.
    pub derived_fields: BTreeSet<String>,
}

struct Gate {
    paused: bool,
    honor_aborts: bool,
    held: VecDeque<oneshot::Sender<()>>,
}

impl Gate {
    /// Drop senders whose fetch already gave up.
    fn prune(&mut self) {
        self.held.retain(|waiter| !waiter.is_closed());
    }
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<String, Vec<ObjectInstance>>,
    derived: HashMap<(String, PrimaryKey, String), Value>,
}

/// Object tables held in memory, served page by page.
///
/// Rows keep insertion order. Page tokens are row offsets. Filtering uses the
/// client-side evaluator; rows it cannot decide are returned. Derived
/// properties are looked up in values registered with
/// [`set_derived_value`](Self::set_derived_value) and come back as `null`
/// when none was set.
///
/// A response is computed when the request arrives. [`pause`](Self::pause)
/// then holds it until [`resume`](Self::resume), [`release`](Self::release)
/// or [`release_newest`](Self::release_newest), which lets tests pick the
/// order in which concurrent fetches complete.
pub struct InMemoryBackend {
    tables: Mutex<Tables>,
    page_calls: AtomicUsize,
    key_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
    failures: Mutex<VecDeque<FetchError>>,
    gate: Mutex<Gate>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            page_calls: AtomicUsize::new(0),
            key_calls: AtomicUsize::new(0),
            bulk_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gate: Mutex::new(Gate {
                paused: false,
                honor_aborts: true,
                held: VecDeque::new(),
            }),
        }
    }

    /// Insert `object`, replacing a row with the same primary key in place.
    pub fn insert(&self, object: ObjectInstance) {
        let mut tables = self.lock_tables();
        let rows = tables.rows.entry(object.object_type().to_string()).or_default();
        match rows.iter_mut().find(|r| r.primary_key() == object.primary_key()) {
            Some(row) => *row = object,
            None => rows.push(object),
        }
    }

    pub fn insert_all(&self, objects: impl IntoIterator<Item = ObjectInstance>) {
        for object in objects {
            self.insert(object);
        }
    }

    /// Delete a row. Returns `true` if it existed.
    pub fn remove(&self, object_type: &str, primary_key: &PrimaryKey) -> bool {
        let mut tables = self.lock_tables();
        let Some(rows) = tables.rows.get_mut(object_type) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|r| r.primary_key() != primary_key);
        before != rows.len()
    }

    /// Value served for derived field `name` of one object.
    pub fn set_derived_value(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
        name: &str,
        value: impl Into<Value>,
    ) {
        self.lock_tables().derived.insert(
            (object_type.to_string(), primary_key.into(), name.to_string()),
            value.into(),
        );
    }

    /// Make the next fetch fail with `error`. Queued failures are consumed in
    /// order, one per fetch.
    pub fn fail_next(&self, error: FetchError) {
        self.failures
            .lock()
            .expect("failure queue lock poisoned")
            .push_back(error);
    }

    /// Hold every fetch until it is released.
    pub fn pause(&self) {
        self.lock_gate().paused = true;
    }

    /// Let the `n` oldest held fetches through while staying paused.
    pub fn release(&self, n: usize) {
        let mut gate = self.lock_gate();
        gate.prune();
        let n = n.min(gate.held.len());
        for waiter in gate.held.drain(..n) {
            let _ = waiter.send(());
        }
    }

    /// Let the most recent held fetch through while staying paused.
    pub fn release_newest(&self) {
        let mut gate = self.lock_gate();
        gate.prune();
        if let Some(waiter) = gate.held.pop_back() {
            let _ = waiter.send(());
        }
    }

    /// Let every held and future fetch through.
    pub fn resume(&self) {
        let mut gate = self.lock_gate();
        gate.paused = false;
        for waiter in gate.held.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Number of fetches currently held.
    pub fn held(&self) -> usize {
        let mut gate = self.lock_gate();
        gate.prune();
        gate.held.len()
    }

    /// Keep serving aborted fetches like a backend that never sees the
    /// abort: a held fetch waits for its release and then returns its
    /// response.
    pub fn ignore_aborts(&self) {
        self.lock_gate().honor_aborts = false;
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn key_calls(&self) -> usize {
        self.key_calls.load(Ordering::SeqCst)
    }

    /// Number of batched by-key requests.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("request log lock poisoned").clone()
    }

    fn next_failure(&self) -> Option<FetchError> {
        self.failures
            .lock()
            .expect("failure queue lock poisoned")
            .pop_front()
    }

    /// Wait while paused, then hand back `response`.
    async fn hold<T>(&self, response: Result<T, FetchError>, signal: &AbortSignal) -> Result<T, FetchError> {
        let (honor_aborts, waiter) = {
            let mut gate = self.lock_gate();
            let waiter = if gate.paused {
                let (tx, rx) = oneshot::channel();
                gate.held.push_back(tx);
                Some(rx)
            } else {
                None
            };
            (gate.honor_aborts, waiter)
        };
        if let Some(waiter) = waiter {
            if honor_aborts {
                tokio::select! {
                    _ = waiter => {}
                    () = signal.aborted() => return Err(FetchError::Aborted),
                }
            } else {
                let _ = waiter.await;
            }
        }
        if honor_aborts {
            signal.check()?;
        }
        response
    }

    fn serve_page(&self, request: &PageRequest) -> Result<ObjectPage, FetchError> {
        let offset = match &request.page_token {
            Some(token) => token.parse::<usize>().map_err(|_| FetchError::Backend {
                code: "INVALID_PAGE_TOKEN".into(),
                message: format!("unknown page token `{token}`"),
            })?,
            None => 0,
        };

        let tables = self.lock_tables();
        let matching: Vec<&ObjectInstance> = tables
            .rows
            .get(&request.object_type)
            .map(|rows| {
                rows.iter()
                    .filter(|r| evaluate(request.where_clause.value(), r) != MatchResult::NoMatch)
                    .collect()
            })
            .unwrap_or_default();

        let end = match request.page_size {
            Some(size) => (offset + size as usize).min(matching.len()),
            None => matching.len(),
        };
        let objects: Vec<ObjectInstance> = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| Self::with_derived(&tables, r, &request.derived_properties))
            .collect();
        let next_page_token = (end < matching.len()).then(|| end.to_string());

        debug!(
            object_type = %request.object_type,
            offset,
            returned = objects.len(),
            has_more = next_page_token.is_some(),
            "page served"
        );
        Ok(ObjectPage {
            objects,
            next_page_token,
        })
    }

    fn serve_keys(
        &self,
        object_type: &str,
        primary_keys: &[PrimaryKey],
        derived: &BTreeMap<RdpId, DerivedProperty>,
    ) -> Vec<ObjectInstance> {
        let tables = self.lock_tables();
        let Some(rows) = tables.rows.get(object_type) else {
            return Vec::new();
        };
        primary_keys
            .iter()
            .filter_map(|pk| rows.iter().find(|r| r.primary_key() == pk))
            .map(|row| Self::with_derived(&tables, row, derived))
            .collect()
    }

    fn record(
        &self,
        object_type: &str,
        page_token: Option<String>,
        page_size: Option<u32>,
        derived: &BTreeMap<RdpId, DerivedProperty>,
    ) {
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .push(RecordedRequest {
                object_type: object_type.to_string(),
                page_token,
                page_size,
                derived_fields: derived.values().map(|p| p.name.clone()).collect(),
            });
    }

    fn with_derived(
        tables: &Tables,
        row: &ObjectInstance,
        derived: &BTreeMap<RdpId, DerivedProperty>,
    ) -> ObjectInstance {
        let mut object = row.clone();
        for property in derived.values() {
            let key = (
                row.object_type().to_string(),
                row.primary_key().clone(),
                property.name.clone(),
            );
            let value = tables.derived.get(&key).cloned().unwrap_or(Value::Null);
            object.set_derived(property.name.clone(), Some(value));
        }
        object
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("backend tables lock poisoned")
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().expect("gate lock poisoned")
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn fetch_object_page(
        &self,
        request: PageRequest,
        signal: &AbortSignal,
    ) -> Result<ObjectPage, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.record(
            &request.object_type,
            request.page_token.clone(),
            request.page_size,
            &request.derived_properties,
        );
        let response = match self.next_failure() {
            Some(error) => Err(error),
            None => self.serve_page(&request),
        };
        self.hold(response, signal).await
    }

    async fn fetch_object_by_key(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Option<ObjectInstance>, FetchError> {
        self.key_calls.fetch_add(1, Ordering::SeqCst);
        self.record(object_type, None, None, derived_properties);
        let response = match self.next_failure() {
            Some(error) => Err(error),
            None => Ok(self
                .serve_keys(object_type, std::slice::from_ref(primary_key), derived_properties)
                .pop()),
        };
        self.hold(response, signal).await
    }

    async fn fetch_objects_by_keys(
        &self,
        object_type: &str,
        primary_keys: &[PrimaryKey],
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Vec<ObjectInstance>, FetchError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.record(object_type, None, None, derived_properties);
        let response = match self.next_failure() {
            Some(error) => Err(error),
            None => Ok(self.serve_keys(object_type, primary_keys, derived_properties)),
        };
        debug!(object_type, requested = primary_keys.len(), "bulk keys served");
        self.hold(response, signal).await
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("page_calls", &self.page_calls())
            .field("key_calls", &self.key_calls())
            .field("bulk_calls", &self.bulk_calls())
            .finish_non_exhaustive()
    }
}
