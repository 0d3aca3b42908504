//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors. Always fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the shared bucket store.
///
/// Every way the distributed backend can fail collapses into this type so the
/// limiter can recognise it and fail open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreUnavailable {
    /// A single store call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The store rejected the call or the connection failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Every conditional write lost to a concurrent writer.
    #[error("gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },
}

impl From<redis::RedisError> for StoreUnavailable {
    fn from(err: redis::RedisError) -> Self {
        StoreUnavailable::Backend(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
