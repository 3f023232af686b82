//! Read-through cache of chunks fetched from the origin, laid out as
//! `{cache_root}/{bucket}/{chunk}` where `bucket = chunk / 4096 * 4096`, so
//! no single directory holds more than 4096 entries.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use vmnetfs_bitmap::{Bitmap, BitmapStream};

use crate::error::{StoreError, StoreResult};

const CHUNKS_PER_DIR: u64 = 4096;

fn dir_num(chunk: u64) -> u64 {
    chunk / CHUNKS_PER_DIR * CHUNKS_PER_DIR
}

pub struct PristineStore {
    root: PathBuf,
    chunk_size: u64,
    total_chunks: u64,
    present: Bitmap,
}

impl PristineStore {
    /// Open (creating if needed) the cache directory at `root` and
    /// reconstruct its present-chunk bitmap by scanning the two-level
    /// bucket layout on disk.
    pub fn open(root: impl Into<PathBuf>, chunk_size: u64, total_chunks: u64) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let present = Bitmap::new();

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(bucket) = name.parse::<u64>() else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            set_present_from_bucket(&entry.path(), bucket, total_chunks, &present)?;
        }

        Ok(Self {
            root,
            chunk_size,
            total_chunks,
            present,
        })
    }

    pub fn is_present(&self, chunk: u64) -> bool {
        self.present.test(chunk)
    }

    pub fn subscribe_present(&self) -> BitmapStream {
        self.present.subscribe()
    }

    pub fn close(&self) {
        self.present.close();
    }

    fn file_path(&self, chunk: u64) -> PathBuf {
        self.root.join(dir_num(chunk).to_string()).join(chunk.to_string())
    }

    /// Read `length` bytes starting at `offset` within `chunk`'s cached
    /// file. The caller must have already checked `is_present`.
    pub fn read_chunk(&self, chunk: u64, offset: u32, length: u32) -> StoreResult<Vec<u8>> {
        debug_assert!(u64::from(offset) < self.chunk_size);
        debug_assert!(u64::from(offset) + u64::from(length) <= self.chunk_size);

        let path = self.file_path(chunk);
        let file = fs::File::open(&path)
            .map_err(|e| StoreError::Io(format!("couldn't open {}: {e}", path.display())))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact_at(&mut buf, offset as u64)
            .map_err(|e| StoreError::Io(format!("couldn't read {}: {e}", path.display())))?;
        Ok(buf)
    }

    /// Atomically write `data` as the full cached contents of `chunk` and
    /// mark it present. Write-then-rename matches the original engine's
    /// use of an atomic whole-file replace.
    pub fn write_chunk(&self, chunk: u64, data: &[u8]) -> StoreResult<()> {
        debug_assert!(data.len() as u64 <= self.chunk_size);

        let dir = self.root.join(dir_num(chunk).to_string());
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(chunk.to_string());
        let tmp_path = dir.join(format!(".{chunk}.tmp"));
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        self.present.set(chunk);
        Ok(())
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }
}

fn set_present_from_bucket(
    path: &Path,
    bucket: u64,
    total_chunks: u64,
    present: &Bitmap,
) -> StoreResult<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(StoreError::InvalidCache(format!(
                "non-UTF8 entry in {}",
                path.display()
            )));
        };
        let chunk: u64 = name.parse().map_err(|_| {
            StoreError::InvalidCache(format!("{}/{name} is not a chunk index", path.display()))
        })?;
        if chunk >= total_chunks || dir_num(chunk) != bucket {
            return Err(StoreError::InvalidCache(format!(
                "{}/{name} belongs to a different bucket or is out of range",
                path.display()
            )));
        }
        present.set(chunk);
    }
    Ok(())
}
