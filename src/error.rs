//! Error types for the change fan-out.

use thiserror::Error;

/// Main error type for fan-out operations.
///
/// Dispatch itself never fails: listener panics and feed failures are
/// logged and reported through hooks. These variants cover the fallible
/// edges (configuration, table resolution, filters, payload decoding and
/// provider channel setup).
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed change payload: {0}")]
    Decode(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid row filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Subscription to {table} failed: {reason}")]
    SubscribeFailed { table: String, reason: String },
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        FanoutError::Serialization(e.to_string())
    }
}

/// Result type for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
