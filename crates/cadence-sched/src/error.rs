//! Error types for the broker.

use thiserror::Error;

/// Broker errors.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Store driver error.
    #[error("store error: {0}")]
    Store(#[from] cadence_store::StoreError),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] cadence_proto::ProtocolError),

    /// Listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, SchedError>;
