use facet_types::{CanonicalizationError, OptimisticId};

/// Errors from store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// No optimistic layer with this id is on the stack.
    #[error("no optimistic layer with id {0}")]
    UnknownLayer(OptimisticId),

    /// A derived-property request could not be canonicalized or registered.
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
