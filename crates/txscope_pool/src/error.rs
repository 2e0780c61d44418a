//! Error types for connection sources.

use std::time::Duration;
use thiserror::Error;

/// Result type for connection source operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while acquiring, using or returning a connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available before the acquire timeout elapsed.
    #[error("connection pool exhausted: no connection available after {timeout:?}")]
    Exhausted {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The source has been shut down.
    #[error("connection source is closed")]
    Closed,

    /// The driver reported a failure.
    #[error("driver error: {0}")]
    Driver(String),

    /// A connection was returned to a source that did not hand it out.
    #[error("connection '{label}' does not belong to this source")]
    ForeignConnection {
        /// Label of the offending connection.
        label: String,
    },
}

impl PoolError {
    /// Creates a driver error.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(message.into())
    }
}
