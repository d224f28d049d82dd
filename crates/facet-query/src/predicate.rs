//! Best-effort client-side evaluation of where-clauses.
//!
//! Evaluation is three-valued. Operators the client cannot evaluate safely
//! (text search, anything it does not recognize) and fields the object has
//! not fetched yield [`MatchResult::Unknown`]. Logical nodes combine with
//! Kleene logic, so an unknown branch only matters when the other branches do
//! not already decide the result.

use std::cmp::Ordering;

use facet_types::{ObjectInstance, PropertyFilter, WhereClause};
use serde_json::Value;

/// Outcome of evaluating a clause against one object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    NoMatch,
    Unknown,
}

impl MatchResult {
    fn from_bool(b: bool) -> Self {
        if b {
            Self::Match
        } else {
            Self::NoMatch
        }
    }

    fn negate(self) -> Self {
        match self {
            Self::Match => Self::NoMatch,
            Self::NoMatch => Self::Match,
            Self::Unknown => Self::Unknown,
        }
    }

    /// A conclusive match.
    pub fn is_strict(self) -> bool {
        self == Self::Match
    }

    /// Inconclusive: the object might match.
    pub fn is_sorta(self) -> bool {
        self == Self::Unknown
    }
}

/// Evaluate `clause` against `object`.
pub fn evaluate(clause: &WhereClause, object: &ObjectInstance) -> MatchResult {
    match clause {
        WhereClause::And { clauses } => {
            let mut result = MatchResult::Match;
            for c in clauses {
                match evaluate(c, object) {
                    MatchResult::NoMatch => return MatchResult::NoMatch,
                    MatchResult::Unknown => result = MatchResult::Unknown,
                    MatchResult::Match => {}
                }
            }
            result
        }
        WhereClause::Or { clauses } => {
            let mut result = MatchResult::NoMatch;
            for c in clauses {
                match evaluate(c, object) {
                    MatchResult::Match => return MatchResult::Match,
                    MatchResult::Unknown => result = MatchResult::Unknown,
                    MatchResult::NoMatch => {}
                }
            }
            result
        }
        WhereClause::Not { clause } => evaluate(clause, object).negate(),
        WhereClause::Property { field, filter } => {
            if !filter.is_client_evaluable() {
                return MatchResult::Unknown;
            }
            match object.resolve(field) {
                Some(value) => evaluate_filter(filter, &value),
                None => MatchResult::Unknown,
            }
        }
    }
}

fn evaluate_filter(filter: &PropertyFilter, value: &Value) -> MatchResult {
    use PropertyFilter as F;
    let ordered = |literal: &Value, accept: fn(Ordering) -> bool| match compare(value, literal) {
        Some(ord) => MatchResult::from_bool(accept(ord)),
        None => MatchResult::NoMatch,
    };
    match filter {
        F::Eq(literal) => MatchResult::from_bool(values_equal(value, literal)),
        F::Ne(literal) => MatchResult::from_bool(!values_equal(value, literal)),
        F::Gt(literal) => ordered(literal, |o| o == Ordering::Greater),
        F::Gte(literal) => ordered(literal, |o| o != Ordering::Less),
        F::Lt(literal) => ordered(literal, |o| o == Ordering::Less),
        F::Lte(literal) => ordered(literal, |o| o != Ordering::Greater),
        F::In(literals) => MatchResult::from_bool(literals.iter().any(|l| values_equal(value, l))),
        F::IsNull(expected) => MatchResult::from_bool(value.is_null() == *expected),
        F::StartsWith(prefix) => {
            MatchResult::from_bool(value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())))
        }
        F::Contains(literal) => MatchResult::from_bool(
            value
                .as_array()
                .is_some_and(|items| items.iter().any(|i| values_equal(i, literal))),
        ),
        F::ContainsAnyTerm(_)
        | F::ContainsAllTerms(_)
        | F::ContainsAllTermsInOrder(_)
        | F::Unsupported { .. } => MatchResult::Unknown,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
