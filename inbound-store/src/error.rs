//! Error types for the inbound-store crate.

use std::io;

use thiserror::Error;

/// Error returned by every storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure while moving bytes (including a failing source stream).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing service could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested change would break a store invariant.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Encoding a record failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let err: StoreError = io::Error::new(io::ErrorKind::BrokenPipe, "stream closed").into();

        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("stream closed"));
    }
}
