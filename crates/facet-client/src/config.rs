use std::time::Duration;

use facet_query::{BulkLoadConfig, QueryConfig};
use serde::{Deserialize, Serialize};

/// Configuration for an [`ObservableClient`](crate::ObservableClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Page size for list fetches that do not ask for one. `None` lets the
    /// backend decide.
    pub default_page_size: Option<u32>,
    /// A non-forced observe of a key loaded less than this long ago does not
    /// refetch.
    pub dedupe_interval: Duration,
    /// Abort a query's fetch when its last subscriber leaves.
    pub cancel_on_last_unsubscribe: bool,
    /// How long an unretained entry stays cached before collection.
    pub keep_alive: Duration,
    /// Period of the background collector started by
    /// [`start_gc`](crate::ObservableClient::start_gc).
    pub gc_interval: Duration,
    /// Batch by-key fetches when set.
    pub bulk_load: Option<BulkLoadConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_page_size: None,
            dedupe_interval: Duration::ZERO,
            cancel_on_last_unsubscribe: true,
            keep_alive: facet_store::DEFAULT_KEEP_ALIVE,
            gc_interval: Duration::from_secs(1),
            bulk_load: None,
        }
    }
}

impl ClientConfig {
    /// Keep loaded data for `interval` before an observe refetches it.
    pub fn cached_for(interval: Duration) -> Self {
        Self {
            dedupe_interval: interval,
            ..Default::default()
        }
    }

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            dedupe_interval: self.dedupe_interval,
            cancel_on_last_unsubscribe: self.cancel_on_last_unsubscribe,
            default_page_size: self.default_page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.default_page_size, None);
        assert_eq!(config.dedupe_interval, Duration::ZERO);
        assert!(config.cancel_on_last_unsubscribe);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.bulk_load, None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "default_page_size": 25 }"#).unwrap();
        assert_eq!(config.default_page_size, Some(25));
        assert!(config.cancel_on_last_unsubscribe);
        assert_eq!(config.gc_interval, Duration::from_secs(1));
    }

    #[test]
    fn bulk_load_fills_its_own_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "bulk_load": { "max_entries": 10 } }"#).unwrap();
        let bulk = config.bulk_load.unwrap();
        assert_eq!(bulk.max_entries, 10);
        assert_eq!(bulk.window, BulkLoadConfig::default().window);
    }

    #[test]
    fn query_config_carries_every_field() {
        let config = ClientConfig {
            default_page_size: Some(10),
            dedupe_interval: Duration::from_secs(5),
            cancel_on_last_unsubscribe: false,
            ..Default::default()
        };
        let query = config.query_config();
        assert_eq!(query.default_page_size, Some(10));
        assert_eq!(query.dedupe_interval, Duration::from_secs(5));
        assert!(!query.cancel_on_last_unsubscribe);
    }
}
