//! Store error taxonomy.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    /// A cache directory entry didn't parse as a chunk index, fell
    /// outside the image's chunk range, or lived in the wrong bucket.
    #[error("invalid cache entry: {0}")]
    InvalidCache(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
