use std::time::Duration;

use thiserror::Error;

/// An error that happens while reading or writing a cache entry.
///
/// None of these reach the users of the [`CacheInterface`](super::CacheInterface): backends
/// log them and report a miss instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The entry does not exist in the backend.
    #[error("not found")]
    NotFound,
    /// The backend did not answer in time.
    #[error("cache request timed out after {0:?}")]
    Timeout(Duration),
    /// A networked backend failed to serve the request, like connection loss or a 5xx
    /// response.
    ///
    /// The attached string contains the backend's response.
    #[error("remote cache failed: {0}")]
    RemoteError(String),
    /// The entry was read, but its contents could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error, for example a failing filesystem.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::from_std_error(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        Self::RemoteError(err.to_string())
    }
}

impl CacheError {
    /// Logs the error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of reading a cache entry.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
