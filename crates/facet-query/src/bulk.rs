//! Coalescing of by-key object fetches.
//!
//! Object queries fetch one key at a time. [`BulkLoader`] wraps a backend and
//! collects those calls for a short window, then issues one
//! [`fetch_objects_by_keys`](ObjectBackend::fetch_objects_by_keys) request
//! per object type and derived-property set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use facet_types::{DerivedProperty, ObjectInstance, PrimaryKey, RdpId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::abort::{AbortController, AbortSignal};
use crate::backend::{ObjectBackend, ObjectPage, PageRequest};
use crate::error::FetchError;
use crate::fetch::rdp_ids;

type Reply = oneshot::Sender<Result<Option<ObjectInstance>, FetchError>>;

/// When a pending batch is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkLoadConfig {
    /// How long the first key of a batch waits for company.
    pub window: Duration,
    /// A batch reaching this many keys is sent at once.
    pub max_entries: usize,
}

impl Default for BulkLoadConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(25),
            max_entries: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BatchKey {
    object_type: String,
    rdps: BTreeSet<RdpId>,
}

struct Batch {
    id: u64,
    derived: BTreeMap<RdpId, DerivedProperty>,
    waiters: Vec<(PrimaryKey, Reply)>,
}

struct Shared {
    inner: Arc<dyn ObjectBackend>,
    config: BulkLoadConfig,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    next_id: u64,
    batches: HashMap<BatchKey, Batch>,
}

/// Backend wrapper that batches by-key fetches. Page fetches pass through.
#[derive(Clone)]
pub struct BulkLoader {
    shared: Arc<Shared>,
}

impl BulkLoader {
    pub fn new(inner: Arc<dyn ObjectBackend>, config: BulkLoadConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner,
                config,
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    pub fn config(&self) -> BulkLoadConfig {
        self.shared.config
    }

    /// Add `primary_key` to the open batch for its type, starting one if
    /// needed. Must be called inside a Tokio runtime.
    fn enqueue(
        &self,
        object_type: &str,
        primary_key: PrimaryKey,
        derived: &BTreeMap<RdpId, DerivedProperty>,
    ) -> oneshot::Receiver<Result<Option<ObjectInstance>, FetchError>> {
        let (reply, receiver) = oneshot::channel();
        let key = BatchKey {
            object_type: object_type.to_string(),
            rdps: rdp_ids(derived),
        };

        let mut pending = self.shared.lock_pending();
        let full = {
            let Pending { next_id, batches } = &mut *pending;
            let batch = batches.entry(key.clone()).or_insert_with(|| {
                *next_id += 1;
                let id = *next_id;
                let shared = Arc::clone(&self.shared);
                let timed = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(shared.config.window).await;
                    let due = shared.take(&timed, id);
                    if let Some(batch) = due {
                        shared.flush(timed, batch).await;
                    }
                });
                Batch {
                    id,
                    derived: derived.clone(),
                    waiters: Vec::new(),
                }
            });
            batch.waiters.push((primary_key, reply));
            batch.waiters.len() >= self.shared.config.max_entries
        };
        if full {
            if let Some(batch) = pending.batches.remove(&key) {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.flush(key, batch).await });
            }
        }
        receiver
    }
}

impl Shared {
    /// Remove the batch for `key`, if it is still the one with `id`.
    fn take(&self, key: &BatchKey, id: u64) -> Option<Batch> {
        let mut pending = self.lock_pending();
        match pending.batches.get(key) {
            Some(batch) if batch.id == id => pending.batches.remove(key),
            _ => None,
        }
    }

    async fn flush(&self, key: BatchKey, batch: Batch) {
        let keys: Vec<PrimaryKey> = batch.waiters.iter().map(|(pk, _)| pk.clone()).collect();
        debug!(object_type = %key.object_type, entries = keys.len(), "bulk object load");

        // shared by every waiter, so it is never aborted
        let signal = AbortController::new().signal();
        let result = self
            .inner
            .fetch_objects_by_keys(&key.object_type, &keys, &batch.derived, &signal)
            .await;

        match result {
            Ok(objects) => {
                let found: HashMap<PrimaryKey, ObjectInstance> = objects
                    .into_iter()
                    .map(|object| (object.primary_key().clone(), object))
                    .collect();
                for (primary_key, reply) in batch.waiters {
                    let _ = reply.send(Ok(found.get(&primary_key).cloned()));
                }
            }
            Err(error) => {
                warn!(object_type = %key.object_type, %error, "bulk object load failed");
                for (_, reply) in batch.waiters {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().expect("bulk loader lock poisoned")
    }
}

#[async_trait]
impl ObjectBackend for BulkLoader {
    async fn fetch_object_page(
        &self,
        request: PageRequest,
        signal: &AbortSignal,
    ) -> Result<ObjectPage, FetchError> {
        self.shared.inner.fetch_object_page(request, signal).await
    }

    async fn fetch_object_by_key(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Option<ObjectInstance>, FetchError> {
        signal.check()?;
        let receiver = self.enqueue(object_type, primary_key.clone(), derived_properties);
        tokio::select! {
            result = receiver => result.unwrap_or_else(|_| {
                Err(FetchError::Network("bulk load dropped".into()))
            }),
            () = signal.aborted() => Err(FetchError::Aborted),
        }
    }

    async fn fetch_objects_by_keys(
        &self,
        object_type: &str,
        primary_keys: &[PrimaryKey],
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Vec<ObjectInstance>, FetchError> {
        self.shared
            .inner
            .fetch_objects_by_keys(object_type, primary_keys, derived_properties, signal)
            .await
    }
}

impl std::fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
