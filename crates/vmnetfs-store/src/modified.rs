//! Copy-on-write overlay: one sparse file holding every chunk a client has
//! written, at its chunk-aligned offset. A chunk's presence in this store
//! always wins over the pristine cache.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use vmnetfs_bitmap::{Bitmap, BitmapStream};

use crate::error::StoreResult;

pub struct ModifiedStore {
    file: File,
    chunk_size: u64,
    modified: Bitmap,
}

impl ModifiedStore {
    /// Open (creating if needed) the overlay file at `path`. Existing
    /// modified-chunk state is not recoverable across restarts (the
    /// original engine's overlay is also not scanned back into a bitmap,
    /// since a stale overlay without its sibling pristine cache is
    /// useless) — callers always start with an empty `modified` map.
    pub fn open(path: impl AsRef<Path>, chunk_size: u64) -> StoreResult<Self> {
        let path: &Path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            chunk_size,
            modified: Bitmap::new(),
        })
    }

    pub fn is_modified(&self, chunk: u64) -> bool {
        self.modified.test(chunk)
    }

    pub fn subscribe_modified(&self) -> BitmapStream {
        self.modified.subscribe()
    }

    pub fn close(&self) {
        self.modified.close();
    }

    fn chunk_offset(&self, chunk: u64) -> u64 {
        chunk * self.chunk_size
    }

    pub fn read_chunk(&self, chunk: u64, offset: u32, length: u32) -> StoreResult<Vec<u8>> {
        debug_assert!(u64::from(offset) < self.chunk_size);
        debug_assert!(u64::from(offset) + u64::from(length) <= self.chunk_size);

        let mut buf = vec![0u8; length as usize];
        self.file
            .read_exact_at(&mut buf, self.chunk_offset(chunk) + offset as u64)?;
        Ok(buf)
    }

    /// Write `data` at `offset` within `chunk` and mark the chunk
    /// modified. Writing past the current end of file grows it as a
    /// sparse hole, same as a positional write onto a fresh file.
    pub fn write_chunk(&self, chunk: u64, offset: u32, data: &[u8]) -> StoreResult<()> {
        debug_assert!(u64::from(offset) + data.len() as u64 <= self.chunk_size);

        self.file
            .write_all_at(data, self.chunk_offset(chunk) + offset as u64)?;
        self.modified.set(chunk);
        Ok(())
    }

    /// Copy an entire chunk's worth of data into the overlay without
    /// marking it modified — used when materializing a clean chunk from
    /// the pristine cache before applying a partial write on top of it.
    pub fn materialize_clean(&self, chunk: u64, data: &[u8]) -> StoreResult<()> {
        self.file.write_all_at(data, self.chunk_offset(chunk))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_overlay_has_nothing_modified() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModifiedStore::open(dir.path().join("overlay"), 4096).unwrap();
        assert!(!store.is_modified(0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModifiedStore::open(dir.path().join("overlay"), 4096).unwrap();
        store.write_chunk(2, 10, b"payload").unwrap();
        assert!(store.is_modified(2));
        assert_eq!(store.read_chunk(2, 10, 7).unwrap(), b"payload");
    }

    #[test]
    fn materialize_then_partial_write_preserves_untouched_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModifiedStore::open(dir.path().join("overlay"), 4096).unwrap();
        let clean = vec![0xAAu8; 4096];
        store.materialize_clean(0, &clean).unwrap();
        store.write_chunk(0, 100, b"XYZ").unwrap();

        let prefix = store.read_chunk(0, 0, 100).unwrap();
        assert!(prefix.iter().all(|&b| b == 0xAA));
        assert_eq!(store.read_chunk(0, 100, 3).unwrap(), b"XYZ");
        let suffix = store.read_chunk(0, 103, 50).unwrap();
        assert!(suffix.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn writes_to_distant_chunks_stay_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModifiedStore::open(dir.path().join("overlay"), 4096).unwrap();
        store.write_chunk(0, 0, b"first").unwrap();
        store.write_chunk(1000, 0, b"far").unwrap();
        assert!(store.is_modified(0));
        assert!(store.is_modified(1000));
        assert!(!store.is_modified(500));
    }
}
