//! The engine's caller-facing error type, composing the lower crates'
//! errors the way `warpgrid-state::StateError` composes its own.

use thiserror::Error;
use vmnetfs_store::StoreError;
use vmnetfs_transport::TransportError;

pub type IoResult<T> = Result<T, IoError>;

#[derive(Debug, Error)]
pub enum IoError {
    /// The requested range starts at or past the end of the image.
    #[error("end of file")]
    Eof,

    /// A write made zero progress because it started at or past the end
    /// of the image. Distinct from [`IoError::Eof`] so a caller can tell
    /// "nothing to write" apart from "out of room"; a POSIX-facing FUSE
    /// shim would surface this as `ENOSPC`.
    #[error("no space left on device")]
    NoSpace,

    /// A request was interrupted before it could take its chunk lock.
    #[error("operation interrupted")]
    Interrupted,

    /// A cache directory didn't match the image's chunk layout.
    #[error("invalid cache: {0}")]
    InvalidCache(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<StoreError> for IoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidCache(msg) => IoError::InvalidCache(msg),
            StoreError::Io(msg) => IoError::Store(msg),
        }
    }
}
