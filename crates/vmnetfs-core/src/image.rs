//! The demand-paged image: wires the chunk lock table, pristine/modified
//! stores, and transport together into the read/write surface an
//! external FUSE shim (or anything else) would call against.

use std::path::Path;

use vmnetfs_bitmap::{Bitmap, BitmapStream};
use vmnetfs_store::{ModifiedStore, PristineStore};
use vmnetfs_transport::{AuthConfig, ConnectionPool, FetchRequest, TransportError};

use crate::config::ImageConfig;
use crate::error::{IoError, IoResult};
use crate::lock::ChunkLockTable;
use crate::stats::Stats;

pub struct Image {
    name: String,
    url: String,
    fetch_offset: u64,
    segment_size: Option<u64>,
    cookies: Vec<String>,
    auth: Option<AuthConfig>,
    expected_etag: Option<String>,
    expected_last_modified: Option<i64>,
    chunk_size: u64,

    locks: ChunkLockTable,
    pristine: PristineStore,
    modified: ModifiedStore,
    transport: ConnectionPool,
    accessed: Bitmap,
    stats: Stats,
}

impl Image {
    /// Open an image from its config: creates the cache directory layout
    /// under `cache_root` if needed, reconstructs the pristine store's
    /// present-chunk bitmap from disk, and starts a fresh (empty)
    /// modified-chunk map and transport connection pool.
    pub fn open(config: &ImageConfig) -> IoResult<Self> {
        let cache_root = Path::new(&config.cache_root);
        let total_chunks = config.initial_size.div_ceil(config.chunk_size);

        let pristine = PristineStore::open(
            cache_root.join("pristine"),
            config.chunk_size,
            total_chunks,
        )?;
        let modified = ModifiedStore::open(cache_root.join("modified.bin"), config.chunk_size)?;
        let transport =
            ConnectionPool::new().map_err(|e| IoError::Transport(TransportError::Fatal(e.to_string())))?;

        let auth = build_auth(&config.origin);

        tracing::info!(
            name = %config.name,
            url = %config.origin.url,
            chunk_size = config.chunk_size,
            initial_size = config.initial_size,
            "image opened"
        );

        Ok(Self {
            name: config.name.clone(),
            url: config.origin.url.clone(),
            fetch_offset: config.origin.fetch_offset,
            segment_size: config.origin.segment_size,
            cookies: config.origin.cookies.clone(),
            auth,
            expected_etag: config.origin.etag.clone(),
            expected_last_modified: config.origin.last_modified,
            chunk_size: config.chunk_size,
            locks: ChunkLockTable::new(config.initial_size, config.chunk_size),
            pristine,
            modified,
            transport,
            accessed: Bitmap::new(),
            stats: Stats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_size(&self) -> u64 {
        self.locks.image_size()
    }

    /// Shrink the image's visible size. The image can only get smaller.
    /// Refused as `Interrupted` (this crate's open-question choice,
    /// picked to preserve liveness rather than block) if `new_size` is
    /// larger than the current size or would split a chunk that is
    /// currently locked.
    pub fn truncate(&self, new_size: u64) -> IoResult<()> {
        if self.locks.truncate(new_size) {
            Ok(())
        } else {
            Err(IoError::Interrupted)
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn accessed_stream(&self) -> BitmapStream {
        self.accessed.subscribe()
    }

    /// Close the image's change streams so outstanding subscribers see
    /// EOF; does not flush or discard any on-disk state.
    pub fn close(&self) {
        self.accessed.close();
        self.pristine.close();
        self.modified.close();
    }

    /// Read up to `count` bytes starting at `start`, decomposing the
    /// range into per-chunk reads. Returns fewer bytes than requested on
    /// reaching EOF or a mid-range chunk failure (a short read, not an
    /// error) unless the very first chunk fails, in which case that
    /// error is returned.
    pub fn read_range(
        &self,
        start: u64,
        count: u64,
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut pos = start;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = pos / self.chunk_size;
            let offset_in_chunk = (pos % self.chunk_size) as u32;
            let room = self.chunk_size - offset_in_chunk as u64;
            let want = remaining.min(room) as u32;

            match self.read_chunk(chunk, offset_in_chunk, want, should_abort) {
                Ok(data) => {
                    let got = data.len() as u64;
                    out.extend_from_slice(&data);
                    pos += got;
                    remaining -= got;
                    if got < want as u64 {
                        break;
                    }
                }
                Err(IoError::Eof) => break,
                Err(e) => {
                    if out.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        self.stats.bytes_read.increment(out.len() as u64);
        Ok(out)
    }

    /// Write `data` starting at `start`, decomposing into per-chunk
    /// writes. Returns the number of bytes actually written, which is
    /// short of `data.len()` if a later chunk hits EOF or fails (the
    /// bytes already written are not rolled back). A write that makes no
    /// progress at all because `start` is already at or past EOF returns
    /// `Err(IoError::NoSpace)` instead of `Ok(0)`, so a caller can tell
    /// "out of room" apart from a legitimate zero-length write.
    pub fn write_range(
        &self,
        start: u64,
        data: &[u8],
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<u64> {
        let mut pos = start;
        let mut written = 0u64;

        while (written as usize) < data.len() {
            let chunk = pos / self.chunk_size;
            let offset_in_chunk = (pos % self.chunk_size) as u32;
            let room = self.chunk_size - offset_in_chunk as u64;
            let slice_len = ((data.len() as u64 - written).min(room)) as usize;
            let slice = &data[written as usize..written as usize + slice_len];

            match self.write_chunk(chunk, offset_in_chunk, slice, should_abort) {
                Ok(()) => {
                    pos += slice_len as u64;
                    written += slice_len as u64;
                }
                Err(IoError::Eof) => {
                    if written == 0 {
                        return Err(IoError::NoSpace);
                    }
                    break;
                }
                Err(e) => {
                    if written == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        self.stats.bytes_written.increment(written);
        Ok(written)
    }

    fn read_chunk(
        &self,
        chunk: u64,
        offset: u32,
        length: u32,
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<Vec<u8>> {
        let guard = self
            .locks
            .lock(chunk, should_abort)
            .ok_or(IoError::Interrupted)?;
        let result = self.read_chunk_unlocked(guard.image_size, chunk, offset, length, should_abort);
        self.locks.unlock(chunk);
        self.note_outcome(&result);
        result
    }

    fn write_chunk(
        &self,
        chunk: u64,
        offset: u32,
        data: &[u8],
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        let guard = self
            .locks
            .lock(chunk, should_abort)
            .ok_or(IoError::Interrupted)?;
        let result = self.write_chunk_unlocked(guard.image_size, chunk, offset, data, should_abort);
        self.locks.unlock(chunk);
        self.note_outcome(&result);
        result
    }

    /// Must be called with `chunk`'s lock held.
    fn read_chunk_unlocked(
        &self,
        image_size: u64,
        chunk: u64,
        offset: u32,
        length: u32,
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<Vec<u8>> {
        let length = self.constrain_io(image_size, chunk, offset, length)?;
        self.accessed.set(chunk);

        if self.modified.is_modified(chunk) {
            return Ok(self.modified.read_chunk(chunk, offset, length)?);
        }

        if !self.pristine.is_present(chunk) {
            let start = chunk * self.chunk_size;
            let count = (image_size - start).min(self.chunk_size);
            self.stats.chunk_fetches.increment(1);
            tracing::debug!(chunk, "fetching chunk from origin");
            let fetched = self.fetch_bytes(start, count, should_abort)?;
            self.pristine.write_chunk(chunk, &fetched)?;
        }
        Ok(self.pristine.read_chunk(chunk, offset, length)?)
    }

    /// Must be called with `chunk`'s lock held.
    fn write_chunk_unlocked(
        &self,
        image_size: u64,
        chunk: u64,
        offset: u32,
        data: &[u8],
        should_abort: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        let length = self.constrain_io(image_size, chunk, offset, data.len() as u32)?;
        let data = &data[..length as usize];
        self.accessed.set(chunk);

        if !self.modified.is_modified(chunk) {
            let count = (image_size - chunk * self.chunk_size).min(self.chunk_size) as u32;
            self.stats.chunk_dirties.increment(1);
            tracing::debug!(chunk, "materializing chunk into overlay before write");
            let clean = self.read_chunk_unlocked(image_size, chunk, 0, count, should_abort)?;
            self.modified.materialize_clean(chunk, &clean)?;
        }
        self.modified.write_chunk(chunk, offset, data)?;
        Ok(())
    }

    fn constrain_io(&self, image_size: u64, chunk: u64, offset: u32, length: u32) -> IoResult<u32> {
        debug_assert!((offset as u64) < self.chunk_size);
        debug_assert!((offset as u64 + length as u64) <= self.chunk_size);

        if chunk * self.chunk_size + offset as u64 >= image_size {
            return Err(IoError::Eof);
        }
        let max = image_size - chunk * self.chunk_size;
        Ok((length as u64).min(max) as u32)
    }

    /// `start` is an offset within the image; the origin request's
    /// absolute offset additionally carries `fetch_offset` so an image
    /// can be fetched from partway into a larger origin object.
    fn fetch_bytes(&self, start: u64, count: u64, should_abort: &dyn Fn() -> bool) -> IoResult<Vec<u8>> {
        let req = FetchRequest {
            url: &self.url,
            offset: self.fetch_offset + start,
            length: count,
            segment_size: self.segment_size,
            cookies: &self.cookies,
            auth: self.auth.as_ref(),
            expected_etag: self.expected_etag.as_deref(),
            expected_last_modified: self.expected_last_modified,
        };
        match self.transport.fetch(&req, should_abort) {
            Ok(resp) if resp.data.len() as u64 != count => Err(IoError::from(TransportError::Fatal(
                format!(
                    "short read: requested {count} bytes, origin returned {}",
                    resp.data.len()
                ),
            ))),
            Ok(resp) => Ok(resp.data),
            Err(TransportError::Interrupted) => Err(IoError::Interrupted),
            Err(e) => Err(IoError::from(e)),
        }
    }

    fn note_outcome<T>(&self, result: &IoResult<T>) {
        if let Err(e) = result {
            if !matches!(e, IoError::Eof | IoError::Interrupted) {
                tracing::warn!(error = %e, "chunk I/O failed");
                self.stats.io_errors.increment(1);
            }
        }
    }
}

fn build_auth(origin: &crate::config::OriginConfig) -> Option<AuthConfig> {
    let username = origin.username.clone()?;
    let password = origin.password.clone().unwrap_or_default();
    match origin.auth_scheme.as_deref() {
        Some("digest") => Some(AuthConfig::Digest { username, password }),
        _ => Some(AuthConfig::Basic { username, password }),
    }
}
