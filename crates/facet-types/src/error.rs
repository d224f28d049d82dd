use thiserror::Error;

/// Errors raised while building or canonicalizing query shapes.
///
/// These are programmer errors: a malformed predicate or derived-property
/// request. They are returned to the caller and never turned into a query
/// status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalizationError {
    /// The where-clause JSON does not have the expected shape.
    #[error("malformed where clause at `{path}`: {reason}")]
    MalformedWhereClause { path: String, reason: String },

    /// A derived property name was registered twice on one type with
    /// different definitions.
    #[error("derived property `{name}` on `{object_type}` already registered with a different definition")]
    ConflictingDerivedProperty { object_type: String, name: String },

    /// Serialization of a definition failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for type-level operations.
pub type TypeResult<T> = Result<T, CanonicalizationError>;
