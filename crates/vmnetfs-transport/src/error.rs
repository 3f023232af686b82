//! Transport error taxonomy.

use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors a fetch can fail with. Mirrors the two-category split the
/// original engine uses to decide whether a failure is worth retrying.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Not worth retrying: bad URL, auth rejected, validator mismatch,
    /// unexpected status code.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// Worth retrying: connection refused, timeout, reset, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// The caller's cancellation predicate returned `true` mid-fetch.
    #[error("fetch interrupted")]
    Interrupted,
}

impl TransportError {
    /// Whether the retry loop should attempt this fetch again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}
