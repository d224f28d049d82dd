use std::time::Duration;

use facet_types::DerivedPropertySet;
use serde::{Deserialize, Serialize};

/// Whether an observe call may hit the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchMode {
    /// Fetch unless the cached value is fresh.
    #[default]
    Auto,
    /// Always fetch.
    Force,
    /// Never fetch; serve only what is cached.
    Offline,
}

/// How many pages a list fetch loads before stopping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoFetchMore {
    /// Stop after the first page.
    #[default]
    Off,
    /// Keep fetching until the backend has no next page.
    All,
    /// Keep fetching until at least this many items are loaded or the
    /// backend is exhausted.
    AtLeast(usize),
}

impl AutoFetchMore {
    /// Whether another page should follow once `loaded` items are present.
    pub fn wants_more(self, loaded: usize) -> bool {
        match self {
            Self::Off => false,
            Self::All => true,
            Self::AtLeast(n) => loaded < n,
        }
    }

    /// The more demanding of two policies.
    pub fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::AtLeast(a), Self::AtLeast(b)) => Self::AtLeast(a.max(b)),
            (Self::AtLeast(n), Self::Off) | (Self::Off, Self::AtLeast(n)) => Self::AtLeast(n),
            (Self::Off, Self::Off) => Self::Off,
        }
    }
}

/// Options for observing one object.
#[derive(Clone, Debug, Default)]
pub struct ObserveObjectOptions {
    pub mode: FetchMode,
    /// Derived properties to deliver alongside the object's own fields.
    pub derived_properties: DerivedPropertySet,
}

/// Options for observing a list.
#[derive(Clone, Debug, Default)]
pub struct ObserveListOptions {
    pub mode: FetchMode,
    /// Page size requested from the backend; the client default applies when
    /// `None`.
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
    pub derived_properties: DerivedPropertySet,
}

/// Fetch policy shared by every query of one client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    /// A non-forced observe of a key loaded less than this long ago does not
    /// refetch.
    pub dedupe_interval: Duration,
    /// Abort a query's in-flight fetch when its last subscriber leaves.
    pub cancel_on_last_unsubscribe: bool,
    /// Page size used when a list observe does not name one.
    pub default_page_size: Option<u32>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            dedupe_interval: Duration::ZERO,
            cancel_on_last_unsubscribe: true,
            default_page_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_fetch_more_policy() {
        assert!(!AutoFetchMore::Off.wants_more(0));
        assert!(AutoFetchMore::All.wants_more(1_000));
        assert!(AutoFetchMore::AtLeast(50).wants_more(40));
        assert!(!AutoFetchMore::AtLeast(50).wants_more(60));
    }

    #[test]
    fn max_prefers_more_demanding() {
        use AutoFetchMore::*;
        assert_eq!(Off.max(AtLeast(3)), AtLeast(3));
        assert_eq!(AtLeast(3).max(AtLeast(9)), AtLeast(9));
        assert_eq!(AtLeast(3).max(All), All);
        assert_eq!(Off.max(Off), Off);
    }
}
