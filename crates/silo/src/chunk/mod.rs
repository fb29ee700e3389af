//! Chunk file format and access.
//!
//! A chunk is a single file holding a contiguous run of records that share
//! one payload size, ordered by strictly increasing timestamp. All integers
//! are little-endian.
//!
//! ## File structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header                                                      │
//! │  - block_size: u32 (4 bytes)                                 │
//! │  - min_ts:     u64 (8 bytes, timestamp of the first record)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  First payload (block_size bytes)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Records, repeated                                           │
//! │  - timestamp: u64 (8 bytes)                                  │
//! │  - payload:   block_size bytes                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Normal layout only: reserved zeroes up to a page boundary,  │
//! │  then entries: u32 in the last 4 bytes of the file           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header's `min_ts` field is also the first record's timestamp, so a
//! record `i` has its timestamp at byte `4 + i * (8 + block_size)`.
//!
//! Two physical layouts share this read contract:
//!
//! - **Normal**: the file is preallocated one page ahead, making appends
//!   a pair of in-place writes; the live record count sits in the last 4
//!   bytes of the file.
//! - **Direct**: the file grows by exactly one record per append and
//!   carries no footer; the record count is derived from the file length.
//!   A direct chunk may additionally be gzip-framed.

mod gzip;
mod store;

use crate::error::{Result, SiloError};
use gzip::GzipStore;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tracing::{debug, warn};

pub(crate) use store::is_recoverable_map_error;
use store::ChunkStore;

/// Byte offset of the first record's timestamp (after the `block_size`
/// field).
const DATA_OFFSET: u64 = 4;

/// Byte length of one timestamp.
const TIMESTAMP_SIZE: u64 = 8;

/// Byte length of the normal-layout entry-count footer.
const FOOTER_SIZE: u64 = 4;

/// Physical layout of a chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Page-preallocated layout with a trailing entry-count footer.
    Normal,
    /// Append-exact layout without a footer.
    Direct,
    /// Append-exact layout, gzip-framed.
    DirectGzip,
}

impl ChunkKind {
    /// The filename extension used by this layout (appended to the
    /// chunk's `min_ts` stem).
    pub fn extension(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::Direct => ".direct",
            Self::DirectGzip => ".gz",
        }
    }

    /// Returns true for the direct layouts.
    pub fn is_direct(self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// Returns true for the gzip-framed layout.
    pub fn is_gzip(self) -> bool {
        matches!(self, Self::DirectGzip)
    }

    /// Parses a chunk filename into its `min_ts` stem and layout.
    ///
    /// Accepted shapes: `<digits>`, `<digits>.direct`, `<digits>.gz` and
    /// the legacy `<digits>.direct.gz`. Returns `None` for anything else.
    pub fn parse_file_name(name: &str) -> Option<(u64, ChunkKind)> {
        let (stem, kind) = if let Some(stem) = name
            .strip_suffix(".direct.gz")
            .or_else(|| name.strip_suffix(".gz"))
        {
            (stem, ChunkKind::DirectGzip)
        } else if let Some(stem) = name.strip_suffix(".direct") {
            (stem, ChunkKind::Direct)
        } else {
            (name, ChunkKind::Normal)
        };
        let min_ts = stem.parse::<u64>().ok()?;
        Some((min_ts, kind))
    }
}

/// Backing storage of an open chunk.
#[derive(Debug)]
enum Backend {
    /// Uncompressed file, memory-mapped or descriptor-based.
    Store(ChunkStore),
    /// Gzip-framed direct chunk.
    Gzip(GzipStore),
    /// The chunk has been closed; any access is an error.
    Closed,
}

/// Mutable interior of a chunk, guarded by the chunk's `RwLock`.
#[derive(Debug)]
struct ChunkInner {
    backend: Backend,
    /// Physical file length for uncompressed chunks; logical uncompressed
    /// length for gzip chunks.
    file_size: u64,
    entries: u32,
    max_ts: u64,
}

/// One open chunk file.
///
/// Reads may run concurrently; the single append path is serialized by the
/// owning series' write lock and takes this chunk's write lock, so readers
/// always observe a consistent record count. Record indices are validated
/// against that count; timestamps within a chunk are strictly increasing.
#[derive(Debug)]
pub struct Chunk {
    /// The chunk's name: the timestamp of its first record.
    name: u64,
    path: PathBuf,
    kind: ChunkKind,
    block_size: u32,
    page_size: u64,
    /// Count of outstanding readers (iterators and varlen entries).
    refs: AtomicU32,
    inner: RwLock<ChunkInner>,
}

impl Chunk {
    /// On-disk span of one record: timestamp plus payload.
    fn record_span(&self) -> u64 {
        TIMESTAMP_SIZE + u64::from(self.block_size)
    }

    /// Creates a new chunk file holding a single record.
    ///
    /// Fails with [`SiloError::AlreadyExists`] if the file exists and
    /// [`SiloError::InvalidArgument`] if `data` is empty. The payload
    /// length becomes the chunk's block size.
    pub fn create(
        path: &Path,
        timestamp: u64,
        data: &[u8],
        page_size: u64,
        kind: ChunkKind,
        gzip_level: u32,
        descriptor_based: bool,
    ) -> Result<Chunk> {
        if data.is_empty() {
            return Err(SiloError::invalid("chunk payload must not be empty"));
        }
        if path.exists() {
            return Err(SiloError::AlreadyExists(path.display().to_string()));
        }

        let block_size = data.len() as u32;
        let span = TIMESTAMP_SIZE + data.len() as u64;
        let content_len = DATA_OFFSET + span;

        let mut image = Vec::with_capacity(content_len as usize);
        image.extend_from_slice(&block_size.to_le_bytes());
        image.extend_from_slice(&timestamp.to_le_bytes());
        image.extend_from_slice(data);

        let (backend, file_size) = match kind {
            ChunkKind::Normal => {
                // Round up so there is always room for at least one more
                // record slot ahead of the footer.
                let file_size = (content_len + FOOTER_SIZE).div_ceil(page_size) * page_size;
                image.resize(file_size as usize, 0);
                let footer_at = (file_size - FOOTER_SIZE) as usize;
                image[footer_at..].copy_from_slice(&1u32.to_le_bytes());

                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)?;
                file.write_all(&image)?;
                (Self::store_for(file, descriptor_based, path)?, file_size)
            }
            ChunkKind::Direct => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)?;
                file.write_all(&image)?;
                (Self::store_for(file, descriptor_based, path)?, content_len)
            }
            ChunkKind::DirectGzip => {
                let gz = GzipStore::create(path, gzip_level)?;
                gz.write_append(&image)?;
                (Backend::Gzip(gz), content_len)
            }
        };

        Ok(Chunk {
            name: timestamp,
            path: path.to_path_buf(),
            kind,
            block_size,
            page_size,
            refs: AtomicU32::new(0),
            inner: RwLock::new(ChunkInner {
                backend,
                file_size,
                entries: 1,
                max_ts: timestamp,
            }),
        })
    }

    /// Opens an existing chunk file named `name` (its first timestamp).
    ///
    /// Reads the header, derives the record count (from the footer for the
    /// normal layout, from length arithmetic otherwise) and fails with
    /// [`SiloError::Corruption`] on any inconsistency.
    pub fn open(
        name: u64,
        kind: ChunkKind,
        path: &Path,
        page_size: u64,
        gzip_level: u32,
        descriptor_based: bool,
    ) -> Result<Chunk> {
        let (backend, file_size) = match kind {
            ChunkKind::DirectGzip => {
                let (gz, logical_len) = GzipStore::open(path, gzip_level)?;
                (Backend::Gzip(gz), logical_len)
            }
            _ => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                let file_size = file.metadata()?.len();
                (Self::store_for(file, descriptor_based, path)?, file_size)
            }
        };

        // Header: block_size then the first record's timestamp.
        let mut header = [0u8; 12];
        Self::backend_read(&backend, 0, &mut header)
            .map_err(|_| SiloError::corruption(format!("unreadable header in {}", path.display())))?;
        let block_size = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
        let min_ts = u64::from_le_bytes(header[4..12].try_into().expect("8-byte slice"));

        if block_size == 0 {
            return Err(SiloError::corruption(format!(
                "zero block size in {}",
                path.display()
            )));
        }
        if min_ts != name {
            return Err(SiloError::corruption(format!(
                "chunk {} declares min_ts {min_ts} but is named {name}",
                path.display()
            )));
        }

        let span = TIMESTAMP_SIZE + u64::from(block_size);
        let entries = match kind {
            ChunkKind::Normal => {
                if file_size < page_size || file_size % page_size != 0 {
                    return Err(SiloError::corruption(format!(
                        "normal chunk {} has length {file_size}, not a multiple of page size {page_size}",
                        path.display()
                    )));
                }
                let mut footer = [0u8; FOOTER_SIZE as usize];
                Self::backend_read(&backend, file_size - FOOTER_SIZE, &mut footer)?;
                let entries = u32::from_le_bytes(footer);
                let data_end = DATA_OFFSET + u64::from(entries) * span;
                if entries == 0 || data_end + FOOTER_SIZE > file_size {
                    return Err(SiloError::corruption(format!(
                        "normal chunk {} footer declares {entries} entries which do not fit in {file_size} bytes",
                        path.display()
                    )));
                }
                entries
            }
            ChunkKind::Direct | ChunkKind::DirectGzip => {
                let data_len = file_size.checked_sub(DATA_OFFSET).ok_or_else(|| {
                    SiloError::corruption(format!("direct chunk {} is truncated", path.display()))
                })?;
                if data_len == 0 || data_len % span != 0 {
                    return Err(SiloError::corruption(format!(
                        "direct chunk {} has {data_len} data bytes, not a multiple of the {span}-byte record span",
                        path.display()
                    )));
                }
                (data_len / span) as u32
            }
        };

        let chunk = Chunk {
            name,
            path: path.to_path_buf(),
            kind,
            block_size,
            page_size,
            refs: AtomicU32::new(0),
            inner: RwLock::new(ChunkInner {
                backend,
                file_size,
                entries,
                max_ts: 0,
            }),
        };
        let max_ts = chunk.timestamp_at(entries - 1)?;
        chunk.inner.write().max_ts = max_ts;
        Ok(chunk)
    }

    /// Builds the store for an uncompressed chunk, applying the silent
    /// mmap fallback chain.
    fn store_for(file: std::fs::File, descriptor_based: bool, path: &Path) -> Result<Backend> {
        if descriptor_based {
            return Ok(Backend::Store(ChunkStore::descriptor(file)));
        }
        match ChunkStore::try_mapped(file) {
            Ok(store) => Ok(Backend::Store(store)),
            Err((file, err)) if is_recoverable_map_error(&err) => {
                debug!(
                    "mapping {} failed ({err}), falling back to descriptor access",
                    path.display()
                );
                Ok(Backend::Store(ChunkStore::descriptor(file)))
            }
            Err((file, err)) => {
                drop(file);
                Err(SiloError::corruption(format!(
                    "cannot map {}: {err}",
                    path.display()
                )))
            }
        }
    }

    fn backend_read(backend: &Backend, offset: u64, buf: &mut [u8]) -> Result<()> {
        match backend {
            Backend::Store(store) => store.read_at(offset, buf),
            Backend::Gzip(gz) => gz.read_at(offset, buf),
            Backend::Closed => Err(SiloError::InvalidState("chunk is closed")),
        }
    }

    /// The chunk's name, which is the timestamp of its first record.
    pub fn name(&self) -> u64 {
        self.name
    }

    /// The timestamp of the first record.
    pub fn min_ts(&self) -> u64 {
        self.name
    }

    /// The timestamp of the last record.
    pub fn max_ts(&self) -> u64 {
        self.inner.read().max_ts
    }

    /// The payload size shared by every record in this chunk.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The physical layout of this chunk.
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// The number of records currently stored.
    pub fn entries(&self) -> u32 {
        self.inner.read().entries
    }

    /// The chunk's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File length for uncompressed chunks, logical length for gzip.
    pub fn file_size(&self) -> u64 {
        self.inner.read().file_size
    }

    /// Returns the file length when this chunk is backed by a live memory
    /// mapping and 0 otherwise.
    pub fn mmap_backed_size(&self) -> u64 {
        let inner = self.inner.read();
        match &inner.backend {
            Backend::Store(store) if store.is_mapped() => inner.file_size,
            _ => 0,
        }
    }

    fn check_index(&self, entries: u32, index: u32) -> Result<()> {
        if index >= entries {
            return Err(SiloError::invalid(format!(
                "record index {index} out of range (chunk holds {entries})"
            )));
        }
        Ok(())
    }

    /// Returns the timestamp of record `index`.
    pub fn timestamp_at(&self, index: u32) -> Result<u64> {
        let inner = self.inner.read();
        self.check_index(inner.entries, index)?;
        self.timestamp_at_locked(&inner, index)
    }

    fn timestamp_at_locked(&self, inner: &ChunkInner, index: u32) -> Result<u64> {
        let mut buf = [0u8; TIMESTAMP_SIZE as usize];
        let offset = DATA_OFFSET + u64::from(index) * self.record_span();
        Self::backend_read(&inner.backend, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Returns the payload of record `index`.
    pub fn value_at(&self, index: u32) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        self.check_index(inner.entries, index)?;
        let mut buf = vec![0u8; self.block_size as usize];
        let offset = DATA_OFFSET + u64::from(index) * self.record_span() + TIMESTAMP_SIZE;
        Self::backend_read(&inner.backend, offset, &mut buf)?;
        Ok(buf)
    }

    /// Returns record `index` as a `(timestamp, payload)` pair.
    pub fn piece_at(&self, index: u32) -> Result<(u64, Vec<u8>)> {
        let inner = self.inner.read();
        self.check_index(inner.entries, index)?;
        let mut buf = vec![0u8; self.record_span() as usize];
        let offset = DATA_OFFSET + u64::from(index) * self.record_span();
        Self::backend_read(&inner.backend, offset, &mut buf)?;
        let ts = u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        buf.drain(..8);
        Ok((ts, buf))
    }

    /// Returns payload bytes `[start, stop)` of record `index`, with
    /// `stop` clamped to the block size.
    pub fn slice_at(&self, index: u32, start: u32, stop: u32) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        self.check_index(inner.entries, index)?;
        let stop = stop.min(self.block_size);
        if start > stop {
            return Err(SiloError::invalid(format!(
                "slice start {start} is beyond stop {stop}"
            )));
        }
        let mut buf = vec![0u8; (stop - start) as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        let offset = DATA_OFFSET
            + u64::from(index) * self.record_span()
            + TIMESTAMP_SIZE
            + u64::from(start);
        Self::backend_read(&inner.backend, offset, &mut buf)?;
        Ok(buf)
    }

    /// Returns payload byte `position` of record `index`.
    pub fn byte_of_piece(&self, index: u32, position: u32) -> Result<u8> {
        let inner = self.inner.read();
        self.check_index(inner.entries, index)?;
        if position >= self.block_size {
            return Err(SiloError::invalid(format!(
                "byte position {position} out of range (block size {})",
                self.block_size
            )));
        }
        let mut buf = [0u8; 1];
        let offset = DATA_OFFSET
            + u64::from(index) * self.record_span()
            + TIMESTAMP_SIZE
            + u64::from(position);
        Self::backend_read(&inner.backend, offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Lower bound: the smallest index whose timestamp is `>= timestamp`,
    /// or `entries` if every record is older.
    pub fn find_left(&self, timestamp: u64) -> Result<u32> {
        let inner = self.inner.read();
        let (mut lo, mut hi) = (0u32, inner.entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp_at_locked(&inner, mid)? < timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Upper bound: the smallest index whose timestamp is `> timestamp`.
    pub fn find_right(&self, timestamp: u64) -> Result<u32> {
        let inner = self.inner.read();
        let (mut lo, mut hi) = (0u32, inner.entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp_at_locked(&inner, mid)? <= timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Appends one record. The owning series guarantees that `data` is
    /// exactly one block and that `timestamp` is greater than [`max_ts`].
    ///
    /// [`max_ts`]: Chunk::max_ts
    pub fn append(&self, timestamp: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.block_size as usize);
        let mut inner = self.inner.write();
        if matches!(inner.backend, Backend::Closed) {
            return Err(SiloError::InvalidState("chunk is closed"));
        }
        debug_assert!(timestamp > inner.max_ts);

        let span = self.record_span();
        let mut record = Vec::with_capacity(span as usize);
        record.extend_from_slice(&timestamp.to_le_bytes());
        record.extend_from_slice(data);

        match self.kind {
            ChunkKind::Normal => {
                let write_offset = DATA_OFFSET + u64::from(inner.entries) * span;
                if write_offset + span + FOOTER_SIZE > inner.file_size {
                    let new_size = inner.file_size + self.page_size;
                    self.resize_store(&mut inner, new_size)?;
                    // Re-establish the footer at the new tail before any
                    // record lands in the fresh page; a concurrent reader
                    // sees either count, never garbage.
                    let entries = inner.entries;
                    self.write_footer(&mut inner, entries)?;
                }
                self.store_write(&mut inner, write_offset, &record)?;
                inner.entries += 1;
                let entries = inner.entries;
                self.write_footer(&mut inner, entries)?;
            }
            ChunkKind::Direct => {
                let write_offset = inner.file_size;
                let new_size = inner.file_size + span;
                self.resize_store(&mut inner, new_size)?;
                self.store_write(&mut inner, write_offset, &record)?;
                inner.entries += 1;
            }
            ChunkKind::DirectGzip => {
                match &inner.backend {
                    Backend::Gzip(gz) => gz.write_append(&record)?,
                    _ => return Err(SiloError::InvalidState("gzip chunk lost its store")),
                }
                inner.file_size += span;
                inner.entries += 1;
            }
        }
        inner.max_ts = timestamp;
        Ok(())
    }

    fn store_write(&self, inner: &mut ChunkInner, offset: u64, data: &[u8]) -> Result<()> {
        match &mut inner.backend {
            Backend::Store(store) => store.write_at(offset, data),
            Backend::Gzip(_) => Err(SiloError::InvalidState(
                "gzip chunks only support tail appends",
            )),
            Backend::Closed => Err(SiloError::InvalidState("chunk is closed")),
        }
    }

    fn write_footer(&self, inner: &mut ChunkInner, entries: u32) -> Result<()> {
        let offset = inner.file_size - FOOTER_SIZE;
        self.store_write(inner, offset, &entries.to_le_bytes())
    }

    /// Grows the file to `new_size`, remapping as needed. A remap that
    /// fails with a recoverable error silently degrades to descriptor
    /// access and the resize is retried there.
    fn resize_store(&self, inner: &mut ChunkInner, new_size: u64) -> Result<()> {
        let backend = std::mem::replace(&mut inner.backend, Backend::Closed);
        let backend = match backend {
            Backend::Store(ChunkStore::Mapped { file, map }) => {
                map.flush()?;
                drop(map);
                file.set_len(new_size)?;
                match ChunkStore::try_mapped(file) {
                    Ok(store) => Backend::Store(store),
                    Err((file, err)) if is_recoverable_map_error(&err) => {
                        debug!(
                            "remapping {} at {new_size} bytes failed ({err}), switching to descriptor access",
                            self.path.display()
                        );
                        Backend::Store(ChunkStore::descriptor(file))
                    }
                    Err((file, err)) => {
                        drop(file);
                        return Err(SiloError::corruption(format!(
                            "cannot remap {}: {err}",
                            self.path.display()
                        )));
                    }
                }
            }
            Backend::Store(store) => {
                // Descriptor variant: plain ftruncate.
                if let ChunkStore::Descriptor { file } = &store {
                    file.lock().set_len(new_size)?;
                }
                Backend::Store(store)
            }
            other => other,
        };
        inner.backend = backend;
        inner.file_size = new_size;
        Ok(())
    }

    /// Switches this chunk to descriptor-based access. A no-op for gzip
    /// chunks and chunks already in descriptor mode.
    pub fn switch_to_descriptor_based_access(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let backend = std::mem::replace(&mut inner.backend, Backend::Closed);
        inner.backend = match backend {
            Backend::Store(ChunkStore::Mapped { file, map }) => {
                map.flush()?;
                drop(map);
                Backend::Store(ChunkStore::descriptor(file))
            }
            Backend::Closed => return Err(SiloError::InvalidState("chunk is closed")),
            other => other,
        };
        Ok(())
    }

    /// Switches this chunk to memory-mapped access. A no-op when mapping
    /// fails with a recoverable error; gzip chunks cannot be mapped.
    pub fn switch_to_mmap_based_access(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if matches!(inner.backend, Backend::Gzip(_)) {
            return Err(SiloError::invalid("gzip chunks cannot be memory mapped"));
        }
        let backend = std::mem::replace(&mut inner.backend, Backend::Closed);
        inner.backend = match backend {
            Backend::Store(ChunkStore::Descriptor { file }) => {
                let file = file.into_inner();
                match ChunkStore::try_mapped(file) {
                    Ok(store) => Backend::Store(store),
                    Err((file, err)) if is_recoverable_map_error(&err) => {
                        debug!(
                            "mapping {} failed ({err}), staying on descriptor access",
                            self.path.display()
                        );
                        Backend::Store(ChunkStore::descriptor(file))
                    }
                    Err((file, err)) => {
                        drop(file);
                        return Err(SiloError::corruption(format!(
                            "cannot map {}: {err}",
                            self.path.display()
                        )));
                    }
                }
            }
            Backend::Closed => return Err(SiloError::InvalidState("chunk is closed")),
            other => other,
        };
        Ok(())
    }

    /// Increments the outstanding-reader count.
    pub(crate) fn incref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the outstanding-reader count.
    pub(crate) fn decref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "chunk reference count underflow");
    }

    /// The number of outstanding readers (iterators and varlen entries).
    pub fn references(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Flushes buffered writes to disk without closing.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        match &inner.backend {
            Backend::Store(store) => store.flush(),
            Backend::Gzip(gz) => gz.flush(),
            Backend::Closed => Ok(()),
        }
    }

    /// Closes the chunk, releasing its mapping or descriptor.
    ///
    /// Refuses with [`SiloError::StillOpen`] while readers hold
    /// references, unless `force` is set. Closing twice is a no-op.
    pub fn close(&self, force: bool) -> Result<()> {
        let refs = self.references();
        if refs > 0 && !force {
            return Err(SiloError::StillOpen(refs));
        }
        if refs > 0 {
            warn!(
                "force-closing chunk {} with {refs} outstanding reference(s)",
                self.path.display()
            );
        }
        let mut inner = self.inner.write();
        match std::mem::replace(&mut inner.backend, Backend::Closed) {
            Backend::Store(store) => {
                store.flush()?;
                drop(store.into_file()?);
            }
            Backend::Gzip(gz) => gz.close()?,
            Backend::Closed => {}
        }
        Ok(())
    }

    /// Closes the chunk unconditionally and unlinks its file.
    pub fn delete(&self) -> Result<()> {
        self.close(true)?;
        std::fs::remove_file(&self.path)?;
        debug!("deleted chunk {}", self.path.display());
        Ok(())
    }
}

/// RAII reference to an open chunk.
///
/// Creating a guard increments the chunk's reader count; dropping it
/// decrements. Iterators and varlen entries hold guards for every chunk
/// they may still touch, which is what keeps those chunks out of the
/// eviction sweep.
#[derive(Debug)]
pub(crate) struct ChunkGuard {
    chunk: Arc<Chunk>,
}

impl ChunkGuard {
    /// Takes a reference on `chunk`.
    pub(crate) fn new(chunk: Arc<Chunk>) -> Self {
        chunk.incref();
        Self { chunk }
    }
}

impl Clone for ChunkGuard {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.chunk))
    }
}

impl std::ops::Deref for ChunkGuard {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Drop for ChunkGuard {
    fn drop(&mut self) {
        self.chunk.decref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: u64 = 4096;

    fn create_normal(dir: &TempDir, descriptor: bool) -> Chunk {
        let path = dir.path().join("0");
        Chunk::create(&path, 0, b"ala ", PAGE, ChunkKind::Normal, 0, descriptor).unwrap()
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            ChunkKind::parse_file_name("1500"),
            Some((1500, ChunkKind::Normal))
        );
        assert_eq!(
            ChunkKind::parse_file_name("1500.direct"),
            Some((1500, ChunkKind::Direct))
        );
        assert_eq!(
            ChunkKind::parse_file_name("1500.gz"),
            Some((1500, ChunkKind::DirectGzip))
        );
        assert_eq!(
            ChunkKind::parse_file_name("1500.direct.gz"),
            Some((1500, ChunkKind::DirectGzip))
        );
        assert_eq!(ChunkKind::parse_file_name("metadata"), None);
        assert_eq!(ChunkKind::parse_file_name("15x0"), None);
        assert_eq!(ChunkKind::parse_file_name(".direct"), None);
    }

    #[test]
    fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let chunk = create_normal(&dir, false);
        chunk.append(1, b"ma  ").unwrap();
        chunk.append(4, b"kota").unwrap();

        assert_eq!(chunk.min_ts(), 0);
        assert_eq!(chunk.max_ts(), 4);
        assert_eq!(chunk.block_size(), 4);
        assert_eq!(chunk.entries(), 3);
        assert_eq!(chunk.piece_at(0).unwrap(), (0, b"ala ".to_vec()));
        assert_eq!(chunk.piece_at(1).unwrap(), (1, b"ma  ".to_vec()));
        assert_eq!(chunk.piece_at(2).unwrap(), (4, b"kota".to_vec()));
        assert_eq!(chunk.value_at(2).unwrap(), b"kota");
        assert_eq!(chunk.timestamp_at(1).unwrap(), 1);
        assert_eq!(chunk.slice_at(0, 1, 3).unwrap(), b"la");
        assert_eq!(chunk.byte_of_piece(2, 0).unwrap(), b'k');

        chunk.close(false).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("0")).unwrap().len(), PAGE);
    }

    #[test]
    fn test_descriptor_access_matches_mmap() {
        let dir = TempDir::new().unwrap();
        {
            let chunk = create_normal(&dir, false);
            chunk.close(false).unwrap();
        }
        let path = dir.path().join("0");
        let chunk = Chunk::open(0, ChunkKind::Normal, &path, PAGE, 0, true).unwrap();
        chunk.append(1, b"ma  ").unwrap();
        chunk.append(4, b"kota").unwrap();
        assert_eq!(chunk.entries(), 3);
        assert_eq!(chunk.piece_at(2).unwrap(), (4, b"kota".to_vec()));
        chunk.close(false).unwrap();
    }

    #[test]
    fn test_bisection_grid() {
        let dir = TempDir::new().unwrap();
        let chunk = create_normal(&dir, false);
        chunk.append(1, b"ma  ").unwrap();
        chunk.append(4, b"kota").unwrap();
        chunk.append(5, b"test").unwrap();

        for (ts, left, right) in [
            (0, 0, 1),
            (1, 1, 2),
            (2, 2, 2),
            (3, 2, 2),
            (4, 2, 3),
            (5, 3, 4),
            (6, 4, 4),
        ] {
            assert_eq!(chunk.find_left(ts).unwrap(), left, "find_left({ts})");
            assert_eq!(chunk.find_right(ts).unwrap(), right, "find_right({ts})");
        }
        chunk.close(false).unwrap();
    }

    #[test]
    fn test_page_extension_keeps_footer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("100");
        // One record spans 8 + 2048 bytes; the second append must extend
        // the file by a page.
        let payload = vec![0xABu8; 2048];
        let chunk = Chunk::create(&path, 100, &payload, PAGE, ChunkKind::Normal, 0, false).unwrap();
        chunk.append(200, &vec![0xCDu8; 2048]).unwrap();
        chunk.append(300, &vec![0xEFu8; 2048]).unwrap();
        assert_eq!(chunk.entries(), 3);
        assert_eq!(chunk.file_size() % PAGE, 0);
        chunk.close(false).unwrap();

        let reopened = Chunk::open(100, ChunkKind::Normal, &path, PAGE, 0, false).unwrap();
        assert_eq!(reopened.entries(), 3);
        assert_eq!(reopened.max_ts(), 300);
        assert_eq!(reopened.value_at(2).unwrap(), vec![0xEFu8; 2048]);
        reopened.close(false).unwrap();
    }

    #[test]
    fn test_direct_chunk_grows_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("10.direct");
        let chunk = Chunk::create(&path, 10, b"abcd", PAGE, ChunkKind::Direct, 0, false).unwrap();
        chunk.append(20, b"efgh").unwrap();
        chunk.close(false).unwrap();
        // 4-byte header shared with the first timestamp, two 12-byte records.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 + 2 * 12);

        let reopened = Chunk::open(10, ChunkKind::Direct, &path, PAGE, 0, false).unwrap();
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.piece_at(1).unwrap(), (20, b"efgh".to_vec()));
        reopened.close(false).unwrap();
    }

    #[test]
    fn test_gzip_chunk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7.gz");
        let chunk = Chunk::create(&path, 7, b"abcd", PAGE, ChunkKind::DirectGzip, 6, false).unwrap();
        chunk.append(8, b"efgh").unwrap();
        assert_eq!(chunk.piece_at(0).unwrap(), (7, b"abcd".to_vec()));
        assert_eq!(chunk.piece_at(1).unwrap(), (8, b"efgh".to_vec()));
        chunk.close(false).unwrap();

        let reopened = Chunk::open(7, ChunkKind::DirectGzip, &path, PAGE, 6, false).unwrap();
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.max_ts(), 8);
        assert_eq!(reopened.value_at(0).unwrap(), b"abcd");
        reopened.close(false).unwrap();
    }

    #[test]
    fn test_close_refuses_while_referenced() {
        let dir = TempDir::new().unwrap();
        let chunk = Arc::new(create_normal(&dir, false));
        let guard = ChunkGuard::new(Arc::clone(&chunk));

        match chunk.close(false) {
            Err(SiloError::StillOpen(1)) => {}
            other => panic!("expected StillOpen(1), got {other:?}"),
        }
        drop(guard);
        chunk.close(false).unwrap();
        // Idempotent.
        chunk.close(false).unwrap();
    }

    #[test]
    fn test_truncated_footer_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0");
        {
            let chunk = create_normal(&dir, false);
            chunk.close(false).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let err = Chunk::open(0, ChunkKind::Normal, &path, PAGE, 0, false).unwrap_err();
        assert!(matches!(err, SiloError::Corruption(_)));
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        {
            let chunk = create_normal(&dir, false);
            chunk.close(false).unwrap();
        }
        let err = Chunk::create(
            &dir.path().join("0"),
            0,
            b"ala ",
            PAGE,
            ChunkKind::Normal,
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SiloError::AlreadyExists(_)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let err = Chunk::create(
            &dir.path().join("0"),
            0,
            b"",
            PAGE,
            ChunkKind::Normal,
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SiloError::InvalidArgument(_)));
    }

    #[test]
    fn test_access_mode_switching() {
        let dir = TempDir::new().unwrap();
        let chunk = create_normal(&dir, false);
        assert!(chunk.mmap_backed_size() > 0);

        chunk.switch_to_descriptor_based_access().unwrap();
        assert_eq!(chunk.mmap_backed_size(), 0);
        chunk.append(1, b"ma  ").unwrap();

        chunk.switch_to_mmap_based_access().unwrap();
        assert_eq!(chunk.mmap_backed_size(), PAGE);
        assert_eq!(chunk.piece_at(1).unwrap(), (1, b"ma  ".to_vec()));
        chunk.close(false).unwrap();
    }

    #[test]
    fn test_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let chunk = create_normal(&dir, false);
        assert!(chunk.timestamp_at(1).is_err());
        assert!(chunk.value_at(99).is_err());
        assert!(chunk.byte_of_piece(0, 4).is_err());
        chunk.close(false).unwrap();
    }
}
