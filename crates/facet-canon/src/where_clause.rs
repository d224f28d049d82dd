//! Where-clause canonicalization.
//!
//! Normalization rules, applied bottom-up:
//!
//! 1. Nested `And` inside `And` (and `Or` inside `Or`) are flattened.
//! 2. Children of `And`/`Or` are de-duplicated and sorted by canonical form.
//! 3. A single-child `And`/`Or` collapses to its child.
//! 4. `Not(Not(x))` collapses to `x`.
//! 5. Literals are normalized (`5.0` == `5`); `$in` lists are sorted and
//!    de-duplicated.
//!
//! The canonicalizer interns results so that equal inputs return handles to
//! the same allocation.

use std::collections::HashMap;
use std::sync::RwLock;

use facet_types::{Canonical, PropertyFilter, TypeResult, WhereClause};
use serde_json::Value;
use tracing::trace;

use crate::json::{canonical_json, normalize_value};

/// Interning canonicalizer for [`WhereClause`]s.
pub struct WhereClauseCanonicalizer {
    interned: RwLock<HashMap<String, Canonical<WhereClause>>>,
}

impl WhereClauseCanonicalizer {
    pub fn new() -> Self {
        Self {
            interned: RwLock::new(HashMap::new()),
        }
    }

    /// Canonicalize a typed clause.
    pub fn canonicalize(&self, clause: &WhereClause) -> Canonical<WhereClause> {
        let normalized = normalize(clause);
        let form = canonical_json(&normalized.to_json());

        if let Some(existing) = self
            .interned
            .read()
            .expect("canonicalizer lock poisoned")
            .get(&form)
        {
            return existing.clone();
        }

        let mut interned = self.interned.write().expect("canonicalizer lock poisoned");
        interned
            .entry(form.clone())
            .or_insert_with(|| {
                trace!(form = %form, "interned where clause");
                Canonical::from_parts(normalized, form.as_str())
            })
            .clone()
    }

    /// Parse and canonicalize the JSON object shape.
    pub fn canonicalize_json(&self, value: &Value) -> TypeResult<Canonical<WhereClause>> {
        Ok(self.canonicalize(&WhereClause::from_json(value)?))
    }

    /// Number of distinct canonical clauses seen so far.
    pub fn len(&self) -> usize {
        self.interned.read().expect("canonicalizer lock poisoned").len()
    }

    /// Returns `true` if nothing has been canonicalized yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WhereClauseCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WhereClauseCanonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhereClauseCanonicalizer")
            .field("interned", &self.len())
            .finish()
    }
}

/// Normalize a clause without interning it.
pub fn normalize(clause: &WhereClause) -> WhereClause {
    match clause {
        WhereClause::And { clauses } => {
            let children = flatten(clauses, |c| match c {
                WhereClause::And { clauses } => Some(clauses),
                _ => None,
            });
            collapse(children, |clauses| WhereClause::And { clauses })
        }
        WhereClause::Or { clauses } => {
            let children = flatten(clauses, |c| match c {
                WhereClause::Or { clauses } => Some(clauses),
                _ => None,
            });
            collapse(children, |clauses| WhereClause::Or { clauses })
        }
        WhereClause::Not { clause } => match normalize(clause) {
            WhereClause::Not { clause: inner } => *inner,
            other => WhereClause::Not {
                clause: Box::new(other),
            },
        },
        WhereClause::Property { field, filter } => WhereClause::Property {
            field: field.clone(),
            filter: normalize_filter(filter),
        },
    }
}

fn flatten<F>(clauses: &[WhereClause], same_kind: F) -> Vec<WhereClause>
where
    F: Fn(&WhereClause) -> Option<&Vec<WhereClause>>,
{
    let mut out = Vec::with_capacity(clauses.len());
    for child in clauses {
        let child = normalize(child);
        match same_kind(&child) {
            Some(grandchildren) => out.extend(grandchildren.iter().cloned()),
            None => out.push(child),
        }
    }
    out
}

fn collapse<F>(children: Vec<WhereClause>, rebuild: F) -> WhereClause
where
    F: Fn(Vec<WhereClause>) -> WhereClause,
{
    let mut keyed: Vec<(String, WhereClause)> = children
        .into_iter()
        .map(|c| (canonical_json(&c.to_json()), c))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    if keyed.len() == 1 {
        return keyed.pop().map(|(_, c)| c).unwrap_or_else(WhereClause::all);
    }
    rebuild(keyed.into_iter().map(|(_, c)| c).collect())
}

fn normalize_filter(filter: &PropertyFilter) -> PropertyFilter {
    match filter {
        PropertyFilter::Eq(v) => PropertyFilter::Eq(normalize_value(v)),
        PropertyFilter::Ne(v) => PropertyFilter::Ne(normalize_value(v)),
        PropertyFilter::Gt(v) => PropertyFilter::Gt(normalize_value(v)),
        PropertyFilter::Gte(v) => PropertyFilter::Gte(normalize_value(v)),
        PropertyFilter::Lt(v) => PropertyFilter::Lt(normalize_value(v)),
        PropertyFilter::Lte(v) => PropertyFilter::Lte(normalize_value(v)),
        PropertyFilter::Contains(v) => PropertyFilter::Contains(normalize_value(v)),
        PropertyFilter::In(values) => {
            let mut keyed: Vec<(String, Value)> = values
                .iter()
                .map(normalize_value)
                .map(|v| (canonical_json(&v), v))
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            keyed.dedup_by(|a, b| a.0 == b.0);
            PropertyFilter::In(keyed.into_iter().map(|(_, v)| v).collect())
        }
        PropertyFilter::Unsupported { operator, argument } => PropertyFilter::Unsupported {
            operator: operator.clone(),
            argument: normalize_value(argument),
        },
        other => other.clone(),
    }
}
