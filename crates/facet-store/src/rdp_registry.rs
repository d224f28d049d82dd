use std::collections::{BTreeMap, HashMap};

use facet_types::{CanonicalizationError, DerivedProperty, RdpId, TypeResult};

/// Per-type, append-only union of registered derived properties.
///
/// Once a derived property is registered for a type it stays registered for
/// the life of the registry.
#[derive(Debug, Default)]
pub struct RdpRegistry {
    by_type: HashMap<String, BTreeMap<RdpId, DerivedProperty>>,
}

impl RdpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `properties` into the union for `object_type`.
    ///
    /// Returns `true` if at least one id was new. Fails without registering
    /// anything if a field name is already bound to a different definition.
    pub fn register(
        &mut self,
        object_type: &str,
        properties: &BTreeMap<RdpId, DerivedProperty>,
    ) -> TypeResult<bool> {
        let existing = self.by_type.get(object_type);
        if let Some(existing) = existing {
            for (id, property) in properties {
                let conflict = existing
                    .iter()
                    .any(|(other_id, other)| other.name == property.name && other_id != id);
                if conflict {
                    return Err(CanonicalizationError::ConflictingDerivedProperty {
                        object_type: object_type.to_string(),
                        name: property.name.clone(),
                    });
                }
            }
        }

        let union = self.by_type.entry(object_type.to_string()).or_default();
        let mut added = false;
        for (id, property) in properties {
            if !union.contains_key(id) {
                union.insert(id.clone(), property.clone());
                added = true;
            }
        }
        Ok(added)
    }

    /// The current union for `object_type`.
    pub fn get(&self, object_type: &str) -> BTreeMap<RdpId, DerivedProperty> {
        self.by_type.get(object_type).cloned().unwrap_or_default()
    }
}
