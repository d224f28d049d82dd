use facet_query::QueryError;
use facet_store::StoreError;
use facet_types::CanonicalizationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("object type mismatch: list holds {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

pub type ClientResult<T> = Result<T, ClientError>;
