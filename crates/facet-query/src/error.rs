use facet_store::StoreError;
use thiserror::Error;

/// Failure reported by the backend capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },

    /// The fetch was superseded or its last subscriber left.
    #[error("fetch aborted")]
    Aborted,
}

impl FetchError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Errors from query operations.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The spawned fetch task panicked or was cancelled by the runtime.
    #[error("fetch task failed: {0}")]
    Task(String),
}

impl QueryError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Aborted))
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
