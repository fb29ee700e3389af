//! Fixed-length time series: an ordered collection of chunks.
//!
//! A series is a directory holding one metadata document and one file per
//! chunk, each named by the timestamp of its first record. Appends are
//! routed to the newest chunk and roll over to a fresh chunk at a
//! configured entry cap; reads bisect to the first relevant chunk and
//! stream across chunk boundaries.
//!
//! # Concurrency
//!
//! A series is shared freely across threads:
//!
//! - the *write lock* serializes appends and metadata mutation;
//! - the *open-chunk lock* guards the chunk table and the open-chunk
//!   cache, and makes iterator construction (open + reference a span of
//!   chunks) atomic;
//! - chunks themselves allow concurrent readers against the single
//!   writer.
//!
//! Lock order is fixed: write lock first, open-chunk lock second.
//!
//! # Open-chunk cache
//!
//! Chunks are opened on demand and kept in a cache keyed by their first
//! timestamp. Every iterator holds a reference on each chunk it may still
//! visit; [`TimeSeries::close_chunks`] evicts only unreferenced chunks and
//! never the newest one, which stays open for appends as long as the
//! series is open.

mod iterator;

pub use iterator::RangeIterator;

use crate::chunk::{Chunk, ChunkGuard, ChunkKind};
use crate::error::{Result, SiloError};
use crate::metadata::{self, MetadataCodec, SeriesMetadata};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default allocation granularity for normal chunks.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Tunables for creating or opening a series.
#[derive(Debug, Clone)]
pub struct SeriesOptions {
    /// Allocation granularity for normal chunks. Default: 4096.
    pub page_size: u64,
    /// Gzip level for newly created chunks; 0 disables compression and
    /// makes new chunks use the normal layout. Default: 0.
    pub gzip_level: u32,
    /// Start every chunk in descriptor-based access mode instead of
    /// attempting to map it. Default: false.
    pub descriptor_based_access: bool,
    /// Free-form user tags persisted with the series metadata.
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            gzip_level: 0,
            descriptor_based_access: false,
            metadata: None,
        }
    }
}

/// State guarded by the series' write lock.
#[derive(Debug)]
struct WriteState {
    last_entry_synced: u64,
    user_metadata: Option<BTreeMap<String, String>>,
    /// Varlen root extras, preserved verbatim across metadata rewrites.
    size_field: Option<u8>,
    length_profile: Option<Vec<u32>>,
}

/// State guarded by the series' open-chunk lock.
#[derive(Debug)]
struct OpenState {
    /// Every chunk of the series, sorted ascending by first timestamp.
    chunks: Vec<(u64, ChunkKind)>,
    /// Chunks currently held open, keyed by first timestamp.
    open_chunks: BTreeMap<u64, Arc<Chunk>>,
    /// The newest chunk; appends go here. Also present in `open_chunks`
    /// and holding one baseline reference while the series is open.
    last_chunk: Option<Arc<Chunk>>,
}

/// An append-only series of fixed-size records keyed by strictly
/// increasing `u64` timestamps.
#[derive(Debug)]
pub struct TimeSeries {
    path: PathBuf,
    name: String,
    block_size: u32,
    max_entries_per_chunk: u32,
    page_size: u64,
    gzip_level: u32,
    codec: MetadataCodec,
    descriptor_based: AtomicBool,
    closed: AtomicBool,
    last_entry_ts: AtomicU64,
    write: Mutex<WriteState>,
    open: Mutex<OpenState>,
}

impl TimeSeries {
    /// Creates a new series directory at `path`.
    ///
    /// The directory must not exist. `block_size` is the payload size of
    /// every record; a chunk rolls over after `max_entries_per_chunk`
    /// records.
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        block_size: u32,
        max_entries_per_chunk: u32,
        options: SeriesOptions,
    ) -> Result<TimeSeries> {
        let meta = SeriesMetadata {
            block_size,
            max_entries_per_chunk,
            last_entry_synced: 0,
            page_size: options.page_size,
            gzip_level: (options.gzip_level > 0).then_some(options.gzip_level),
            metadata: options.metadata,
            size_field: None,
            length_profile: None,
        };
        Self::create_inner(path.as_ref(), name, meta, options.descriptor_based_access)
    }

    /// Creates a series from a fully-formed metadata document; shared
    /// with the varlen layer so the root sub-series can carry its extra
    /// keys.
    pub(crate) fn create_inner(
        path: &Path,
        name: &str,
        meta: SeriesMetadata,
        descriptor_based: bool,
    ) -> Result<TimeSeries> {
        if meta.block_size == 0 {
            return Err(SiloError::invalid("block size must be positive"));
        }
        if meta.max_entries_per_chunk == 0 {
            return Err(SiloError::invalid(
                "a chunk must be allowed at least one entry",
            ));
        }
        if meta.page_size == 0 {
            return Err(SiloError::invalid("page size must be positive"));
        }
        if meta.gzip_level.unwrap_or(0) > 9 {
            return Err(SiloError::invalid("gzip level must be within 0..=9"));
        }
        if path.exists() {
            return Err(SiloError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir(path)?;
        let codec = MetadataCodec::preferred();
        metadata::write_series_metadata(path, &meta, codec)?;
        debug!("created series {name} at {}", path.display());

        Ok(TimeSeries {
            path: path.to_path_buf(),
            name: name.to_string(),
            block_size: meta.block_size,
            max_entries_per_chunk: meta.max_entries_per_chunk,
            page_size: meta.page_size,
            gzip_level: meta.gzip_level.unwrap_or(0),
            codec,
            descriptor_based: AtomicBool::new(descriptor_based),
            closed: AtomicBool::new(false),
            last_entry_ts: AtomicU64::new(0),
            write: Mutex::new(WriteState {
                last_entry_synced: meta.last_entry_synced,
                user_metadata: meta.metadata,
                size_field: meta.size_field,
                length_profile: meta.length_profile,
            }),
            open: Mutex::new(OpenState {
                chunks: Vec::new(),
                open_chunks: BTreeMap::new(),
                last_chunk: None,
            }),
        })
    }

    /// Opens an existing series directory.
    ///
    /// Enumerates the directory: every non-metadata filename must parse
    /// as a chunk name, the newest chunk is opened eagerly, and the
    /// series' high-water timestamp is taken from it.
    pub fn open(path: impl AsRef<Path>, name: &str, descriptor_based: bool) -> Result<TimeSeries> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(SiloError::DoesNotExist(path.display().to_string()));
        }
        let (meta, codec) = metadata::read_series_metadata(path)?;

        let mut chunks: Vec<(u64, ChunkKind)> = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name == metadata::METADATA_FILE || file_name == metadata::METADATA_BIN_FILE {
                continue;
            }
            if file_name.starts_with(metadata::METADATA_FILE) && file_name.ends_with(".tmp") {
                // Stale leftover of an interrupted metadata replacement.
                let _ = fs::remove_file(entry.path());
                continue;
            }
            match ChunkKind::parse_file_name(&file_name) {
                Some(parsed) => chunks.push(parsed),
                None => {
                    return Err(SiloError::corruption(format!(
                        "unexpected file {file_name} in series directory {}",
                        path.display()
                    )))
                }
            }
        }
        chunks.sort_by_key(|(min_ts, _)| *min_ts);
        if chunks.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(SiloError::corruption(format!(
                "duplicate chunk names in {}",
                path.display()
            )));
        }

        let series = TimeSeries {
            path: path.to_path_buf(),
            name: name.to_string(),
            block_size: meta.block_size,
            max_entries_per_chunk: meta.max_entries_per_chunk,
            page_size: meta.page_size,
            gzip_level: meta.gzip_level.unwrap_or(0),
            codec,
            descriptor_based: AtomicBool::new(descriptor_based),
            closed: AtomicBool::new(false),
            last_entry_ts: AtomicU64::new(0),
            write: Mutex::new(WriteState {
                last_entry_synced: meta.last_entry_synced,
                user_metadata: meta.metadata,
                size_field: meta.size_field,
                length_profile: meta.length_profile,
            }),
            open: Mutex::new(OpenState {
                chunks,
                open_chunks: BTreeMap::new(),
                last_chunk: None,
            }),
        };

        {
            let mut open = series.open.lock();
            if let Some(&(last_name, _)) = open.chunks.last() {
                let index = open.chunks.len() - 1;
                let last = series.open_chunk_at(&mut open, index)?;
                last.incref();
                series
                    .last_entry_ts
                    .store(last.max_ts(), Ordering::Release);
                open.last_chunk = Some(last);
                debug_assert!(open.open_chunks.contains_key(&last_name));
            }
        }
        Ok(series)
    }

    /// The series' name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The series' directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Payload size of every record.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Record count at which a chunk rolls over.
    pub fn max_entries_per_chunk(&self) -> u32 {
        self.max_entries_per_chunk
    }

    /// Allocation granularity for normal chunks.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Gzip level applied to newly created chunks; 0 means uncompressed.
    pub fn gzip_level(&self) -> u32 {
        self.gzip_level
    }

    /// The timestamp of the most recent record, or 0 for an empty series.
    pub fn last_entry_ts(&self) -> u64 {
        self.last_entry_ts.load(Ordering::Acquire)
    }

    /// The highest timestamp marked as synchronized upstream.
    pub fn last_entry_synced(&self) -> u64 {
        self.write.lock().last_entry_synced
    }

    /// Free-form user tags stored with the series.
    pub fn metadata(&self) -> Option<BTreeMap<String, String>> {
        self.write.lock().user_metadata.clone()
    }

    /// Replaces the user tags and persists the metadata document.
    pub fn set_metadata(&self, map: Option<BTreeMap<String, String>>) -> Result<()> {
        self.check_open()?;
        let mut state = self.write.lock();
        state.user_metadata = map;
        self.write_metadata(&state)
    }

    /// Varlen root extras stored in this series' metadata, if any.
    pub(crate) fn varlen_extras(&self) -> (Option<u8>, Option<Vec<u32>>) {
        let state = self.write.lock();
        (state.size_field, state.length_profile.clone())
    }

    /// True once the series has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SiloError::InvalidState("series is closed"));
        }
        Ok(())
    }

    fn chunk_path(&self, name: u64, kind: ChunkKind) -> PathBuf {
        self.path.join(format!("{name}{}", kind.extension()))
    }

    /// Returns the open handle for chunk `index`, opening and caching it
    /// if needed. Must be called with the open-chunk lock held.
    fn open_chunk_at(&self, open: &mut OpenState, index: usize) -> Result<Arc<Chunk>> {
        let (name, kind) = open.chunks[index];
        if let Some(chunk) = open.open_chunks.get(&name) {
            return Ok(Arc::clone(chunk));
        }
        let chunk = Chunk::open(
            name,
            kind,
            &self.chunk_path(name, kind),
            self.page_size,
            self.gzip_level,
            self.descriptor_based.load(Ordering::Acquire),
        )?;
        if chunk.block_size() != self.block_size {
            return Err(SiloError::corruption(format!(
                "chunk {name} has block size {}, series {} expects {}",
                chunk.block_size(),
                self.name,
                self.block_size
            )));
        }
        let chunk = Arc::new(chunk);
        open.open_chunks.insert(name, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Appends one record.
    ///
    /// `data` must be exactly one block long and `timestamp` must exceed
    /// every timestamp already stored. Rolls over to a new chunk named by
    /// `timestamp` when the newest chunk has reached the entry cap.
    pub fn append(&self, timestamp: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if data.len() != self.block_size as usize {
            return Err(SiloError::invalid(format!(
                "payload is {} bytes, series {} stores {}-byte blocks",
                data.len(),
                self.name,
                self.block_size
            )));
        }

        let _write = self.write.lock();
        let last = self.last_entry_ts.load(Ordering::Acquire);
        if last > 0 && timestamp <= last {
            return Err(SiloError::invalid(format!(
                "timestamp {timestamp} is not greater than the last entry {last}"
            )));
        }

        let mut open = self.open.lock();
        let needs_rollover = match &open.last_chunk {
            Some(chunk) => chunk.entries() >= self.max_entries_per_chunk,
            None => true,
        };
        if needs_rollover {
            let kind = if self.gzip_level > 0 {
                ChunkKind::DirectGzip
            } else {
                ChunkKind::Normal
            };
            let chunk = Chunk::create(
                &self.chunk_path(timestamp, kind),
                timestamp,
                data,
                self.page_size,
                kind,
                self.gzip_level,
                self.descriptor_based.load(Ordering::Acquire),
            )?;
            let chunk = Arc::new(chunk);
            chunk.incref();
            if let Some(previous) = open.last_chunk.replace(Arc::clone(&chunk)) {
                previous.decref();
            }
            open.open_chunks.insert(timestamp, Arc::clone(&chunk));
            open.chunks.push((timestamp, kind));
            debug!(
                "series {} rolled over to chunk {timestamp} ({kind:?})",
                self.name
            );
        } else {
            let chunk = open.last_chunk.as_ref().expect("rollover handled above");
            chunk.append(timestamp, data)?;
        }
        drop(open);

        self.last_entry_ts.store(timestamp, Ordering::Release);
        Ok(())
    }

    /// Appends a record shorter than one block, right-padding it with
    /// zero bytes. Longer payloads are rejected.
    pub fn append_padded(&self, timestamp: u64, data: &[u8]) -> Result<()> {
        if data.len() > self.block_size as usize {
            return Err(SiloError::invalid(format!(
                "payload is {} bytes, larger than the {}-byte block",
                data.len(),
                self.block_size
            )));
        }
        if data.len() == self.block_size as usize {
            return self.append(timestamp, data);
        }
        let mut padded = Vec::with_capacity(self.block_size as usize);
        padded.extend_from_slice(data);
        padded.resize(self.block_size as usize, 0);
        self.append(timestamp, &padded)
    }

    /// Index of the chunk that may contain `timestamp`: the last chunk
    /// whose first timestamp is not greater than it (the first chunk when
    /// `timestamp` precedes everything).
    fn chunk_index_for(chunks: &[(u64, ChunkKind)], timestamp: u64) -> usize {
        chunks
            .partition_point(|&(min_ts, _)| min_ts <= timestamp)
            .saturating_sub(1)
    }

    /// Returns an iterator over all records with timestamps in
    /// `[start, stop]` (both inclusive).
    ///
    /// Every chunk the scan may touch is opened and referenced up front,
    /// so concurrent cache eviction cannot pull a chunk out from under
    /// the iterator.
    pub fn iterate_range(&self, start: u64, stop: u64) -> Result<RangeIterator> {
        self.check_open()?;
        if start > stop {
            return Err(SiloError::invalid(format!(
                "range start {start} is beyond stop {stop}"
            )));
        }

        let mut open = self.open.lock();
        if open.chunks.is_empty() {
            return Ok(RangeIterator::empty());
        }
        let start = start.max(open.chunks[0].0);
        let stop = stop.min(self.last_entry_ts.load(Ordering::Acquire));
        if start > stop {
            return Ok(RangeIterator::empty());
        }

        let first = Self::chunk_index_for(&open.chunks, start);
        let last = Self::chunk_index_for(&open.chunks, stop);
        let mut queue = VecDeque::with_capacity(last - first + 1);
        for index in first..=last {
            let chunk = self.open_chunk_at(&mut open, index)?;
            queue.push_back(ChunkGuard::new(chunk));
        }
        Ok(RangeIterator::new(start, stop, queue))
    }

    /// Returns the most recent record.
    ///
    /// Fails with [`SiloError::InvalidArgument`] when the series holds no
    /// data yet.
    pub fn get_current_value(&self) -> Result<(u64, Vec<u8>)> {
        self.check_open()?;
        let open = self.open.lock();
        let last = open
            .last_chunk
            .as_ref()
            .ok_or_else(|| SiloError::invalid(format!("series {} has no data", self.name)))?;
        last.piece_at(last.entries() - 1)
    }

    /// Evicts every unreferenced open chunk except the newest.
    ///
    /// This is the operation a low-memory pressure hook consumes; chunks
    /// under iteration hold references and survive the sweep.
    pub fn close_chunks(&self) {
        let mut open = self.open.lock();
        let last_name = open.last_chunk.as_ref().map(|chunk| chunk.name());
        let mut evicted = 0usize;
        let names: Vec<u64> = open.open_chunks.keys().copied().collect();
        for name in names {
            if Some(name) == last_name {
                continue;
            }
            let chunk = &open.open_chunks[&name];
            if chunk.references() > 0 {
                continue;
            }
            match chunk.close(false) {
                Ok(()) => {
                    open.open_chunks.remove(&name);
                    evicted += 1;
                }
                Err(err) => warn!(
                    "evicting chunk {name} of series {} failed: {err}",
                    self.name
                ),
            }
        }
        if evicted > 0 {
            debug!("series {} evicted {evicted} open chunk(s)", self.name);
        }
    }

    /// Deletes whole chunks whose successor starts before `threshold_ts`,
    /// oldest first.
    ///
    /// Stops at the first chunk with outstanding references; such data
    /// survives until eviction. The newest chunk is never deleted, so
    /// entries at and after the last chunk's first timestamp always
    /// survive.
    pub fn trim(&self, threshold_ts: u64) -> Result<()> {
        self.check_open()?;
        let _write = self.write.lock();
        let mut open = self.open.lock();
        loop {
            if open.chunks.len() < 2 || open.chunks[1].0 >= threshold_ts {
                return Ok(());
            }
            let (name, kind) = open.chunks[0];
            if let Some(chunk) = open.open_chunks.get(&name) {
                if chunk.references() > 0 {
                    debug!(
                        "trim of series {} stopped at referenced chunk {name}",
                        self.name
                    );
                    return Ok(());
                }
                chunk.delete()?;
                open.open_chunks.remove(&name);
            } else {
                fs::remove_file(self.chunk_path(name, kind))?;
            }
            open.chunks.remove(0);
            debug!("series {} trimmed chunk {name}", self.name);
        }
    }

    fn write_metadata(&self, state: &WriteState) -> Result<()> {
        let meta = SeriesMetadata {
            block_size: self.block_size,
            max_entries_per_chunk: self.max_entries_per_chunk,
            last_entry_synced: state.last_entry_synced,
            page_size: self.page_size,
            gzip_level: (self.gzip_level > 0).then_some(self.gzip_level),
            metadata: state.user_metadata.clone(),
            size_field: state.size_field,
            length_profile: state.length_profile.clone(),
        };
        metadata::write_series_metadata(&self.path, &meta, self.codec)
    }

    /// Persists the metadata document and flushes the newest chunk.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let state = self.write.lock();
        self.write_metadata(&state)?;
        let open = self.open.lock();
        if let Some(last) = &open.last_chunk {
            last.flush()?;
        }
        Ok(())
    }

    /// Records that every entry up to `timestamp` has been synchronized
    /// upstream, and persists the metadata document.
    pub fn mark_synced_up_to(&self, timestamp: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.write.lock();
        state.last_entry_synced = timestamp;
        self.write_metadata(&state)
    }

    /// The number of chunks currently held open (the newest included).
    pub fn open_chunk_count(&self) -> usize {
        self.open.lock().open_chunks.len()
    }

    /// Sum of the file sizes of open chunks that are currently backed by
    /// a memory mapping.
    pub fn open_chunks_mmap_size(&self) -> u64 {
        let open = self.open.lock();
        open
            .open_chunks
            .values()
            .map(|chunk| chunk.mmap_backed_size())
            .sum()
    }

    /// Switches every open chunk (and all chunks opened later) to
    /// descriptor-based access.
    pub fn disable_mmap(&self) -> Result<()> {
        self.descriptor_based.store(true, Ordering::Release);
        let open = self.open.lock();
        for chunk in open.open_chunks.values() {
            chunk.switch_to_descriptor_based_access()?;
        }
        Ok(())
    }

    /// Switches every open, non-gzip chunk (and all chunks opened later)
    /// to memory-mapped access where the platform allows it.
    pub fn enable_mmap(&self) -> Result<()> {
        self.descriptor_based.store(false, Ordering::Release);
        let open = self.open.lock();
        for chunk in open.open_chunks.values() {
            if chunk.kind().is_gzip() {
                continue;
            }
            chunk.switch_to_mmap_based_access()?;
        }
        Ok(())
    }

    /// Closes the series: persists metadata and force-closes every open
    /// chunk. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let state = self.write.lock();
            self.write_metadata(&state)?;
        }
        let mut open = self.open.lock();
        if let Some(last) = open.last_chunk.take() {
            last.decref();
        }
        for (name, chunk) in std::mem::take(&mut open.open_chunks) {
            if let Err(err) = chunk.close(true) {
                warn!("closing chunk {name} of series {} failed: {err}", self.name);
            }
        }
        debug!("closed series {}", self.name);
        Ok(())
    }

    /// Closes the series and removes its directory recursively.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.path)?;
        debug!("deleted series {} at {}", self.name, self.path.display());
        Ok(())
    }
}

impl Drop for TimeSeries {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!("series {} dropped while failing to close: {err}", self.name);
            }
        }
    }
}
