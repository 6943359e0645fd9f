//! Error types for storage drivers.

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No job with the given id.
    #[error("job not found: {0}")]
    NotFound(i64),

    /// No job with the given (func, name) key.
    #[error("job not found: {func}/{name}")]
    NameNotFound {
        func: String,
        name: String,
    },

    /// Job serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Backing database error.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true for both not-found variants.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NameNotFound { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
