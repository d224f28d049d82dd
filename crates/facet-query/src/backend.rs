use std::collections::BTreeMap;

use async_trait::async_trait;
use facet_types::{Canonical, DerivedProperty, ObjectInstance, PrimaryKey, RdpId, WhereClause};

use crate::abort::AbortSignal;
use crate::error::FetchError;

/// One page request against the backend.
#[derive(Clone, Debug)]
pub struct PageRequest {
    pub object_type: String,
    pub where_clause: Canonical<WhereClause>,
    /// Derived properties the backend must compute for every returned object.
    pub derived_properties: BTreeMap<RdpId, DerivedProperty>,
    pub page_token: Option<String>,
    pub page_size: Option<u32>,
}

/// One page of results.
#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectInstance>,
    /// Present when more results follow.
    pub next_page_token: Option<String>,
}

/// The paginated network capability the cache fetches from.
///
/// Implementations should stop work and return [`FetchError::Aborted`] once
/// `signal` is aborted; the cache discards the result of an aborted fetch
/// either way.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn fetch_object_page(
        &self,
        request: PageRequest,
        signal: &AbortSignal,
    ) -> Result<ObjectPage, FetchError>;

    /// `Ok(None)` means the object does not exist.
    async fn fetch_object_by_key(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Option<ObjectInstance>, FetchError>;

    /// Fetch several objects of one type in one request. Objects that do not
    /// exist are absent from the result.
    ///
    /// The default issues one by-key fetch per key.
    async fn fetch_objects_by_keys(
        &self,
        object_type: &str,
        primary_keys: &[PrimaryKey],
        derived_properties: &BTreeMap<RdpId, DerivedProperty>,
        signal: &AbortSignal,
    ) -> Result<Vec<ObjectInstance>, FetchError> {
        let mut found = Vec::with_capacity(primary_keys.len());
        for primary_key in primary_keys {
            signal.check()?;
            if let Some(object) = self
                .fetch_object_by_key(object_type, primary_key, derived_properties, signal)
                .await?
            {
                found.push(object);
            }
        }
        Ok(found)
    }
}
