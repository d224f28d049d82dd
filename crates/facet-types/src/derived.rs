//! Derived properties: server-computed fields defined by a selector over an
//! object's links and properties.
//!
//! Callers build definitions with [`DerivedPropertyBuilder`]. The result is
//! plain data, so two selectors written independently that describe the same
//! computation produce equal definitions and canonicalize to the same
//! [`RdpId`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::where_clause::WhereClause;

/// Aggregation applied over the objects reached by a link path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Aggregation {
    Count,
    ApproximateDistinct { property: String },
    ExactDistinct { property: String },
    Sum { property: String },
    Avg { property: String },
    Min { property: String },
    Max { property: String },
    CollectList { property: String, limit: u32 },
    CollectSet { property: String, limit: u32 },
}

/// Structural definition of one derived property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DerivedPropertyDefinition {
    /// Follow a single-valued link path and read one property.
    SelectProperty {
        link_path: Vec<String>,
        property: String,
    },
    /// Follow a link path and aggregate over the linked set, optionally
    /// filtered.
    Aggregate {
        link_path: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<WhereClause>,
        aggregation: Aggregation,
    },
}

impl DerivedPropertyDefinition {
    /// The link path the selector walks.
    pub fn link_path(&self) -> &[String] {
        match self {
            Self::SelectProperty { link_path, .. } | Self::Aggregate { link_path, .. } => link_path,
        }
    }
}

/// A derived property bound to the field name it is delivered under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedProperty {
    pub name: String,
    pub definition: DerivedPropertyDefinition,
}

impl DerivedProperty {
    pub fn new(name: impl Into<String>, definition: DerivedPropertyDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
        }
    }
}

/// A request for several derived properties, keyed by field name.
pub type DerivedPropertySet = BTreeMap<String, DerivedPropertyDefinition>;

/// Canonical identifier of one derived property: a namespace tag followed by
/// a fixed-length hex digest of its structure.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RdpId(String);

impl RdpId {
    /// Namespace tag every id starts with.
    pub const PREFIX: &'static str = "rdp:";
    /// Number of hex characters after the prefix.
    pub const DIGEST_LEN: usize = 32;

    /// Wrap an already-formatted id. Returns `None` if `s` is not
    /// `rdp:` followed by exactly [`Self::DIGEST_LEN`] lowercase hex digits.
    pub fn parse(s: &str) -> Option<Self> {
        let digest = s.strip_prefix(Self::PREFIX)?;
        let well_formed = digest.len() == Self::DIGEST_LEN
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }

    /// Build from a raw digest, truncated to [`Self::DIGEST_LEN`] hex chars.
    pub fn from_digest(digest: &[u8]) -> Self {
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{}{}", Self::PREFIX, &hex[..Self::DIGEST_LEN.min(hex.len())]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RdpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RdpId({})", self.0)
    }
}

impl fmt::Display for RdpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fluent selector for building derived property definitions.
///
/// ```
/// use facet_types::{Aggregation, DerivedPropertyBuilder};
///
/// let reports = DerivedPropertyBuilder::new()
///     .pivot_to("directReports")
///     .aggregate(Aggregation::Count);
/// let manager_name = DerivedPropertyBuilder::new()
///     .pivot_to("lead")
///     .select_property("fullName");
/// assert_ne!(reports, manager_name);
/// ```
#[derive(Clone, Debug, Default)]
pub struct DerivedPropertyBuilder {
    link_path: Vec<String>,
    filter: Option<WhereClause>,
}

impl DerivedPropertyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow a link.
    pub fn pivot_to(mut self, link: impl Into<String>) -> Self {
        self.link_path.push(link.into());
        self
    }

    /// Restrict the linked set before aggregating.
    pub fn filter(mut self, clause: WhereClause) -> Self {
        self.filter = Some(clause);
        self
    }

    /// Read one property of the linked object.
    pub fn select_property(self, property: impl Into<String>) -> DerivedPropertyDefinition {
        DerivedPropertyDefinition::SelectProperty {
            link_path: self.link_path,
            property: property.into(),
        }
    }

    /// Aggregate over the linked set.
    pub fn aggregate(self, aggregation: Aggregation) -> DerivedPropertyDefinition {
        DerivedPropertyDefinition::Aggregate {
            link_path: self.link_path,
            filter: self.filter,
            aggregation,
        }
    }
}
