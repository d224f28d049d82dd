//! Filter predicates for list queries.
//!
//! A [`WhereClause`] is a tagged-variant tree. It can be built directly or
//! parsed from the JSON object shape used on the wire:
//!
//! ```json
//! { "$and": [ { "status": "open" }, { "priority": { "$gte": 3 } } ] }
//! ```
//!
//! A bare value (`{"status": "open"}`) is an equality test; `{"field": null}`
//! is `$isNull: true`. Operators this crate does not know are kept as
//! [`PropertyFilter::Unsupported`] so they still participate in cache-key
//! identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CanonicalizationError, TypeResult};

/// A filter predicate over the properties of one object type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WhereClause {
    /// All children must match. An empty `And` matches everything.
    And { clauses: Vec<WhereClause> },
    /// At least one child must match.
    Or { clauses: Vec<WhereClause> },
    /// The child must not match.
    Not { clause: Box<WhereClause> },
    /// A single operator applied to one property.
    Property { field: String, filter: PropertyFilter },
}

/// Operator applied to a single property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum PropertyFilter {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    IsNull(bool),
    StartsWith(String),
    /// Array property contains the value.
    Contains(Value),
    /// Full-text search: any term matches.
    ContainsAnyTerm(String),
    /// Full-text search: all terms match.
    ContainsAllTerms(String),
    /// Full-text search: all terms match in order.
    ContainsAllTermsInOrder(String),
    /// An operator with no client-side meaning (geo, vector, ...).
    Unsupported { operator: String, argument: Value },
}

impl PropertyFilter {
    /// The `$op` name used on the wire.
    pub fn operator(&self) -> &str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::IsNull(_) => "$isNull",
            Self::StartsWith(_) => "$startsWith",
            Self::Contains(_) => "$contains",
            Self::ContainsAnyTerm(_) => "$containsAnyTerm",
            Self::ContainsAllTerms(_) => "$containsAllTerms",
            Self::ContainsAllTermsInOrder(_) => "$containsAllTermsInOrder",
            Self::Unsupported { operator, .. } => operator,
        }
    }

    /// The operator argument as JSON.
    pub fn argument(&self) -> Value {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                v.clone()
            }
            Self::Contains(v) => v.clone(),
            Self::In(vs) => Value::Array(vs.clone()),
            Self::IsNull(b) => Value::Bool(*b),
            Self::StartsWith(s)
            | Self::ContainsAnyTerm(s)
            | Self::ContainsAllTerms(s)
            | Self::ContainsAllTermsInOrder(s) => Value::String(s.clone()),
            Self::Unsupported { argument, .. } => argument.clone(),
        }
    }

    /// Returns `true` if the operator can be evaluated exactly on the client.
    ///
    /// Full-text search depends on server-side analyzers and is therefore
    /// not client-evaluable, nor is anything unsupported.
    pub fn is_client_evaluable(&self) -> bool {
        !matches!(
            self,
            Self::ContainsAnyTerm(_)
                | Self::ContainsAllTerms(_)
                | Self::ContainsAllTermsInOrder(_)
                | Self::Unsupported { .. }
        )
    }

    fn parse(operator: &str, argument: &Value, path: &str) -> TypeResult<Self> {
        let string_arg = |arg: &Value| -> TypeResult<String> {
            arg.as_str().map(str::to_string).ok_or_else(|| {
                CanonicalizationError::MalformedWhereClause {
                    path: path.to_string(),
                    reason: format!("`{operator}` expects a string"),
                }
            })
        };
        Ok(match operator {
            "$eq" => Self::Eq(argument.clone()),
            "$ne" => Self::Ne(argument.clone()),
            "$gt" => Self::Gt(argument.clone()),
            "$gte" => Self::Gte(argument.clone()),
            "$lt" => Self::Lt(argument.clone()),
            "$lte" => Self::Lte(argument.clone()),
            "$in" => match argument {
                Value::Array(values) => Self::In(values.clone()),
                _ => {
                    return Err(CanonicalizationError::MalformedWhereClause {
                        path: path.to_string(),
                        reason: "`$in` expects an array".into(),
                    })
                }
            },
            "$isNull" => match argument {
                Value::Bool(b) => Self::IsNull(*b),
                _ => {
                    return Err(CanonicalizationError::MalformedWhereClause {
                        path: path.to_string(),
                        reason: "`$isNull` expects a boolean".into(),
                    })
                }
            },
            "$startsWith" => Self::StartsWith(string_arg(argument)?),
            "$contains" => Self::Contains(argument.clone()),
            "$containsAnyTerm" => Self::ContainsAnyTerm(string_arg(argument)?),
            "$containsAllTerms" => Self::ContainsAllTerms(string_arg(argument)?),
            "$containsAllTermsInOrder" => Self::ContainsAllTermsInOrder(string_arg(argument)?),
            other => Self::Unsupported {
                operator: other.to_string(),
                argument: argument.clone(),
            },
        })
    }
}

impl WhereClause {
    /// A clause that matches every object.
    pub fn all() -> Self {
        Self::And { clauses: vec![] }
    }

    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(field, PropertyFilter::Eq(value.into()))
    }

    /// A single-property clause.
    pub fn property(field: impl Into<String>, filter: PropertyFilter) -> Self {
        Self::Property {
            field: field.into(),
            filter,
        }
    }

    /// Conjunction of `clauses`.
    pub fn and(clauses: Vec<WhereClause>) -> Self {
        Self::And { clauses }
    }

    /// Disjunction of `clauses`.
    pub fn or(clauses: Vec<WhereClause>) -> Self {
        Self::Or { clauses }
    }

    /// Negation of `clause`.
    pub fn not(clause: WhereClause) -> Self {
        Self::Not {
            clause: Box::new(clause),
        }
    }

    /// Parse the JSON object shape.
    pub fn from_json(value: &Value) -> TypeResult<Self> {
        Self::parse_clause(value, "$")
    }

    /// Render back to the JSON object shape. `$eq` is written as a bare
    /// value and multi-child `$and`s stay explicit.
    pub fn to_json(&self) -> Value {
        match self {
            Self::And { clauses } => {
                let mut map = Map::new();
                map.insert(
                    "$and".into(),
                    Value::Array(clauses.iter().map(Self::to_json).collect()),
                );
                Value::Object(map)
            }
            Self::Or { clauses } => {
                let mut map = Map::new();
                map.insert(
                    "$or".into(),
                    Value::Array(clauses.iter().map(Self::to_json).collect()),
                );
                Value::Object(map)
            }
            Self::Not { clause } => {
                let mut map = Map::new();
                map.insert("$not".into(), clause.to_json());
                Value::Object(map)
            }
            Self::Property { field, filter } => {
                let rendered = match filter {
                    PropertyFilter::Eq(v) if !v.is_object() && !v.is_null() => v.clone(),
                    other => {
                        let mut op = Map::new();
                        op.insert(other.operator().to_string(), other.argument());
                        Value::Object(op)
                    }
                };
                let mut map = Map::new();
                map.insert(field.clone(), rendered);
                Value::Object(map)
            }
        }
    }

    fn parse_clause(value: &Value, path: &str) -> TypeResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| CanonicalizationError::MalformedWhereClause {
                path: path.to_string(),
                reason: "expected an object".into(),
            })?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, child) in map {
            let child_path = format!("{path}.{key}");
            let clause = match key.as_str() {
                "$and" => Self::And {
                    clauses: Self::parse_list(child, &child_path)?,
                },
                "$or" => Self::Or {
                    clauses: Self::parse_list(child, &child_path)?,
                },
                "$not" => Self::Not {
                    clause: Box::new(Self::parse_clause(child, &child_path)?),
                },
                field if field.starts_with('$') && field != "$primaryKey" => {
                    return Err(CanonicalizationError::MalformedWhereClause {
                        path: child_path,
                        reason: format!("unknown logical operator `{field}`"),
                    })
                }
                field => Self::parse_property(field, child, &child_path)?,
            };
            clauses.push(clause);
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Self::And { clauses })
        }
    }

    fn parse_list(value: &Value, path: &str) -> TypeResult<Vec<Self>> {
        let items = value
            .as_array()
            .ok_or_else(|| CanonicalizationError::MalformedWhereClause {
                path: path.to_string(),
                reason: "expected an array".into(),
            })?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| Self::parse_clause(item, &format!("{path}[{i}]")))
            .collect()
    }

    fn parse_property(field: &str, value: &Value, path: &str) -> TypeResult<Self> {
        match value {
            Value::Null => Ok(Self::property(field, PropertyFilter::IsNull(true))),
            Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                let mut filters: Vec<Self> = ops
                    .iter()
                    .map(|(op, arg)| {
                        PropertyFilter::parse(op, arg, path).map(|f| Self::property(field, f))
                    })
                    .collect::<TypeResult<_>>()?;
                if filters.len() == 1 {
                    Ok(filters.remove(0))
                } else {
                    Ok(Self::And { clauses: filters })
                }
            }
            other => Ok(Self::property(field, PropertyFilter::Eq(other.clone()))),
        }
    }
}
