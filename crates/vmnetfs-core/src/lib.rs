//! The demand-paged chunk I/O engine: chunk locking, fetch-on-miss reads
//! through a local cache, and copy-on-write writes into a sparse overlay.
//!
//! `vmnetfs-bitmap` tracks which chunks exist where; `vmnetfs-transport`
//! fetches bytes from the origin; `vmnetfs-store` persists them to disk.
//! This crate is where those pieces meet an [`Image`].

pub mod config;
mod error;
mod image;
mod lock;
mod stats;

pub use config::{ImageConfig, OriginConfig};
pub use error::{IoError, IoResult};
pub use image::Image;
pub use lock::{ChunkGuard, ChunkLockTable};
pub use stats::{Counter, Stats};
