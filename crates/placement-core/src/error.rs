//! Common error types for the placement model.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while parsing or validating model objects.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A resource quantity string could not be parsed.
    #[error("invalid quantity {input:?}: {reason}")]
    InvalidQuantity {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A label or node selector is malformed.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}
