//! Derived-property canonicalization.
//!
//! A derived property is identified by the structure of its definition and
//! the field name it is delivered under, never by the closure that built it.

use std::collections::BTreeMap;

use facet_types::{
    Canonical, CanonicalizationError, DerivedProperty, DerivedPropertyDefinition,
    DerivedPropertySet, RdpId, TypeResult,
};
use serde_json::{json, Value};

use crate::hasher::CanonicalHasher;
use crate::where_clause::normalize;

/// Stateless canonicalizer for derived properties.
#[derive(Clone, Copy, Debug, Default)]
pub struct RdpCanonicalizer;

impl RdpCanonicalizer {
    pub fn new() -> Self {
        Self
    }

    /// Canonical id of one named derived property.
    pub fn canonicalize(&self, property: &DerivedProperty) -> TypeResult<RdpId> {
        let value = json!({
            "name": property.name,
            "definition": definition_json(&property.definition)?,
        });
        Ok(CanonicalHasher::RDP.rdp_id(&value))
    }

    /// Canonical ids for every property in a request set.
    pub fn canonicalize_each(
        &self,
        set: &DerivedPropertySet,
    ) -> TypeResult<BTreeMap<RdpId, DerivedProperty>> {
        set.iter()
            .map(|(name, definition)| {
                let property = DerivedProperty::new(name.clone(), normalize_definition(definition));
                Ok((self.canonicalize(&property)?, property))
            })
            .collect()
    }

    /// Canonical identity of a whole request set. The form is
    /// `rdps:` followed by a 32-character digest.
    pub fn canonicalize_set(
        &self,
        set: &DerivedPropertySet,
    ) -> TypeResult<Canonical<DerivedPropertySet>> {
        let mut entries = serde_json::Map::new();
        let mut normalized = DerivedPropertySet::new();
        for (name, definition) in set {
            let definition = normalize_definition(definition);
            entries.insert(name.clone(), definition_json(&definition)?);
            normalized.insert(name.clone(), definition);
        }
        let digest = CanonicalHasher::RDP_SET.short_hex(&Value::Object(entries), RdpId::DIGEST_LEN);
        Ok(Canonical::from_parts(normalized, format!("rdps:{digest}")))
    }
}

fn normalize_definition(definition: &DerivedPropertyDefinition) -> DerivedPropertyDefinition {
    match definition {
        DerivedPropertyDefinition::Aggregate {
            link_path,
            filter,
            aggregation,
        } => DerivedPropertyDefinition::Aggregate {
            link_path: link_path.clone(),
            filter: filter.as_ref().map(normalize),
            aggregation: aggregation.clone(),
        },
        other => other.clone(),
    }
}

fn definition_json(definition: &DerivedPropertyDefinition) -> TypeResult<Value> {
    serde_json::to_value(normalize_definition(definition))
        .map_err(|e| CanonicalizationError::Serialization(e.to_string()))
}
