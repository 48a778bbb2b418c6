//! Cache error types

/// Boxed error type carried by backend and compute failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// Corruption of a cached payload is deliberately absent: a payload that
/// fails to decode is removed and recomputed, never surfaced. A lock-wait
/// timeout is likewise not an error; the engine degrades to its fallback
/// path instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[source] BoxError),

    #[error("Backend error: {0}")]
    Backend(#[source] BoxError),

    #[error("Compute error: {0}")]
    Compute(#[source] BoxError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(Box::new(err))
    }
}
