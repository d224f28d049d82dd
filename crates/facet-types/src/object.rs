use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache_key::ObjectCacheKey;

/// Primary key of an object within its type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
}

impl PrimaryKey {
    /// The key as a JSON value, for comparisons against filter literals.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(i) => Value::from(*i),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// One object of the typed graph.
///
/// Properties are a flat map of field name to JSON value. A field that is
/// absent from the map is *not yet fetched*; an explicit `Value::Null` is a
/// real value. `derived_fields` lists which property names are server-computed
/// derived properties, whether or not a value for them is present.
///
/// Objects are immutable once handed to the store; every change produces a new
/// instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectInstance {
    object_type: String,
    primary_key: PrimaryKey,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
    #[serde(default)]
    derived_fields: BTreeSet<String>,
}

impl ObjectInstance {
    /// Create an object with no properties.
    pub fn new(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
            properties: BTreeMap::new(),
            derived_fields: BTreeSet::new(),
        }
    }

    /// Builder-style: set a base property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Builder-style: set a derived property value.
    pub fn with_derived(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        self.derived_fields.insert(name.clone());
        self.properties.insert(name, value.into());
        self
    }

    /// Builder-style: declare a derived field whose value is not yet fetched.
    pub fn with_unfetched_derived(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.properties.remove(&name);
        self.derived_fields.insert(name);
        self
    }

    /// The object type name.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// The primary key.
    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// The cache key owning this object's data.
    pub fn cache_key(&self) -> ObjectCacheKey {
        ObjectCacheKey::new(self.object_type.clone(), self.primary_key.clone())
    }

    /// Look up a property. `None` means not fetched.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// All present properties, base and derived.
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// Names of the derived fields this instance carries.
    pub fn derived_fields(&self) -> &BTreeSet<String> {
        &self.derived_fields
    }

    /// Returns `true` if `name` is a derived field on this instance.
    pub fn is_derived(&self, name: &str) -> bool {
        self.derived_fields.contains(name)
    }

    /// Set a base property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Set (or clear, with `None`) the value of a derived field.
    pub fn set_derived(&mut self, name: impl Into<String>, value: Option<Value>) {
        let name = name.into();
        match value {
            Some(v) => {
                self.properties.insert(name.clone(), v);
            }
            None => {
                self.properties.remove(&name);
            }
        }
        self.derived_fields.insert(name);
    }

    /// Remove a property entirely (base or derived).
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.derived_fields.remove(name);
        self.properties.remove(name)
    }

    /// Resolve a property for predicate evaluation. The primary key is
    /// addressable under `$primaryKey`.
    pub fn resolve(&self, field: &str) -> Option<Value> {
        if field == "$primaryKey" {
            return Some(self.primary_key.to_value());
        }
        self.properties.get(field).cloned()
    }
}
