//! Variable-length series built on top of fixed-length sub-series.
//!
//! A varlen series is a directory of fixed-length series: `root/` holds a
//! length prefix plus the head of every record, and numbered sub-series
//! `1/`, `2/`, … hold the tail, sliced according to a *length profile*.
//! The profile is an array of per-sub-series record sizes whose last
//! element repeats, so capacity grows without bound: a record that does
//! not fit in the existing sub-series simply causes new ones to be
//! created.
//!
//! Every sub-series stores its slice of a logical record under the same
//! timestamp, which is what lets the read side reassemble records by
//! aligning sub-series iterators on timestamps.

mod entry;
mod iterator;

pub use entry::VarlenEntry;
pub use iterator::VarlenIterator;

use crate::error::{Result, SiloError};
use crate::metadata::SeriesMetadata;
use crate::series::{SeriesOptions, TimeSeries};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the root sub-series directory.
const ROOT_SERIES: &str = "root";

/// Per-sub-series record sizes of a varlen series.
///
/// Index 0 sizes the payload head stored in `root`; indices past the end
/// repeat the last element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthProfile {
    sizes: Vec<u32>,
}

impl LengthProfile {
    /// Builds a profile from a non-empty array of positive sizes.
    pub fn new(sizes: Vec<u32>) -> Result<Self> {
        if sizes.is_empty() {
            return Err(SiloError::invalid("length profile must not be empty"));
        }
        if sizes.iter().any(|&size| size == 0) {
            return Err(SiloError::invalid(
                "length profile entries must be positive",
            ));
        }
        Ok(Self { sizes })
    }

    /// The record size of sub-series `index` (0 is the root's payload
    /// head); the last element repeats indefinitely.
    pub fn size_of(&self, index: usize) -> u32 {
        *self
            .sizes
            .get(index)
            .unwrap_or_else(|| self.sizes.last().expect("profile is non-empty"))
    }

    /// The raw profile array.
    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    /// Total payload capacity of a varlen series with `series_count`
    /// sub-series (root included).
    fn capacity(&self, series_count: usize) -> u64 {
        (0..series_count)
            .map(|index| u64::from(self.size_of(index)))
            .sum()
    }
}

/// Largest payload length encodable with a `size_field`-byte prefix.
fn max_length_for(size_field: u8) -> u64 {
    (1u64 << (8 * u32::from(size_field))) - 1
}

/// Packs `length` into the low `size_field` bytes of a little-endian u32.
fn encode_length(size_field: u8, length: u64) -> Vec<u8> {
    let word = (length as u32).to_le_bytes();
    word[..usize::from(size_field)].to_vec()
}

/// A series of records of variable length, up to the limit of its length
/// prefix, composed of fixed-length sub-series.
#[derive(Debug)]
pub struct VarlenSeries {
    path: PathBuf,
    name: String,
    size_field: u8,
    profile: LengthProfile,
    max_entries_per_chunk: u32,
    page_size: u64,
    gzip_level: u32,
    descriptor_based: bool,
    root: TimeSeries,
    /// Numbered sub-series, in order; grown on demand by appends.
    subs: RwLock<Vec<TimeSeries>>,
    /// Live iterators and entries over this series.
    references: Arc<AtomicU32>,
    closed: AtomicBool,
    append_lock: Mutex<()>,
}

impl VarlenSeries {
    /// Creates a new varlen series directory at `path`.
    ///
    /// `size_field` (1..=4) is the byte width of the per-record length
    /// prefix; `length_profile` sizes the sub-series as described on
    /// [`LengthProfile`].
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        size_field: u8,
        length_profile: Vec<u32>,
        max_entries_per_chunk: u32,
        options: SeriesOptions,
    ) -> Result<VarlenSeries> {
        let path = path.as_ref();
        if !(1..=4).contains(&size_field) {
            return Err(SiloError::invalid(format!(
                "size field must be within 1..=4, got {size_field}"
            )));
        }
        let profile = LengthProfile::new(length_profile)?;
        if path.exists() {
            return Err(SiloError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir(path)?;

        let root_meta = SeriesMetadata {
            block_size: u32::from(size_field) + profile.size_of(0),
            max_entries_per_chunk,
            last_entry_synced: 0,
            page_size: options.page_size,
            gzip_level: (options.gzip_level > 0).then_some(options.gzip_level),
            metadata: options.metadata.clone(),
            size_field: Some(size_field),
            length_profile: Some(profile.sizes.clone()),
        };
        let root = TimeSeries::create_inner(
            &path.join(ROOT_SERIES),
            ROOT_SERIES,
            root_meta,
            options.descriptor_based_access,
        )?;
        debug!("created varlen series {name} at {}", path.display());

        Ok(VarlenSeries {
            path: path.to_path_buf(),
            name: name.to_string(),
            size_field,
            profile,
            max_entries_per_chunk,
            page_size: options.page_size,
            gzip_level: options.gzip_level,
            descriptor_based: options.descriptor_based_access,
            root,
            subs: RwLock::new(Vec::new()),
            references: Arc::new(AtomicU32::new(0)),
            closed: AtomicBool::new(false),
            append_lock: Mutex::new(()),
        })
    }

    /// Opens an existing varlen series directory.
    ///
    /// The root sub-series must carry the `size_field` and
    /// `length_profile` metadata keys; numbered sub-series must form a
    /// contiguous run `1..=n` with block sizes matching the profile.
    pub fn open(path: impl AsRef<Path>, name: &str, descriptor_based: bool) -> Result<VarlenSeries> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(SiloError::DoesNotExist(path.display().to_string()));
        }
        let root = TimeSeries::open(path.join(ROOT_SERIES), ROOT_SERIES, descriptor_based)?;
        let (size_field, profile_sizes) = root.varlen_extras();
        let size_field = size_field.ok_or_else(|| {
            SiloError::corruption(format!(
                "varlen root at {} lacks a size_field key",
                path.display()
            ))
        })?;
        if !(1..=4).contains(&size_field) {
            return Err(SiloError::corruption(format!(
                "varlen root at {} declares size_field {size_field}",
                path.display()
            )));
        }
        let profile = LengthProfile::new(profile_sizes.ok_or_else(|| {
            SiloError::corruption(format!(
                "varlen root at {} lacks a length_profile key",
                path.display()
            ))
        })?)?;

        let mut numbers: Vec<u64> = Vec::new();
        for dir_entry in fs::read_dir(path)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name == ROOT_SERIES {
                continue;
            }
            match file_name.parse::<u64>() {
                Ok(number) if number >= 1 && dir_entry.path().is_dir() => numbers.push(number),
                _ => {
                    return Err(SiloError::corruption(format!(
                        "unexpected entry {file_name} in varlen series {}",
                        path.display()
                    )))
                }
            }
        }
        numbers.sort_unstable();
        if numbers
            .iter()
            .enumerate()
            .any(|(index, &number)| number != index as u64 + 1)
        {
            return Err(SiloError::corruption(format!(
                "varlen series {} has gaps in its sub-series run",
                path.display()
            )));
        }

        let mut subs = Vec::with_capacity(numbers.len());
        for &number in &numbers {
            let sub_name = number.to_string();
            let sub = TimeSeries::open(path.join(&sub_name), &sub_name, descriptor_based)?;
            let expected = profile.size_of(number as usize);
            if sub.block_size() != expected {
                return Err(SiloError::corruption(format!(
                    "sub-series {sub_name} of {} has block size {}, profile expects {expected}",
                    path.display(),
                    sub.block_size()
                )));
            }
            subs.push(sub);
        }

        Ok(VarlenSeries {
            path: path.to_path_buf(),
            name: name.to_string(),
            size_field,
            max_entries_per_chunk: root.max_entries_per_chunk(),
            page_size: root.page_size(),
            gzip_level: root.gzip_level(),
            descriptor_based,
            profile,
            root,
            subs: RwLock::new(subs),
            references: Arc::new(AtomicU32::new(0)),
            closed: AtomicBool::new(false),
            append_lock: Mutex::new(()),
        })
    }

    /// The series' name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The series' directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte width of the per-record length prefix.
    pub fn size_field(&self) -> u8 {
        self.size_field
    }

    /// The series' length profile.
    pub fn length_profile(&self) -> &LengthProfile {
        &self.profile
    }

    /// Largest record this series can store.
    pub fn max_length(&self) -> u64 {
        max_length_for(self.size_field)
    }

    /// The timestamp of the most recent record, or 0 for an empty series.
    pub fn last_entry_ts(&self) -> u64 {
        self.root.last_entry_ts()
    }

    /// The number of live iterators and entries over this series.
    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    /// True once the series has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SiloError::InvalidState("varlen series is closed"));
        }
        Ok(())
    }

    /// Appends one record of `data.len()` bytes under `timestamp`.
    ///
    /// The length prefix and the first profile-sized slice go to the
    /// root; remaining bytes are sharded across numbered sub-series,
    /// creating new ones when the current capacity does not cover the
    /// record. Every touched sub-series stores its slice under the same
    /// timestamp.
    pub fn append(&self, timestamp: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if data.is_empty() {
            return Err(SiloError::invalid("varlen payload must not be empty"));
        }
        if data.len() as u64 > self.max_length() {
            return Err(SiloError::invalid(format!(
                "payload of {} bytes exceeds the {}-byte limit of a {}-byte length prefix",
                data.len(),
                self.max_length(),
                self.size_field
            )));
        }

        let _append = self.append_lock.lock();

        // Grow the sub-series run until the record fits.
        {
            let mut subs = self.subs.write();
            while self.profile.capacity(1 + subs.len()) < data.len() as u64 {
                let number = subs.len() + 1;
                let sub_name = number.to_string();
                let meta = SeriesMetadata {
                    block_size: self.profile.size_of(number),
                    max_entries_per_chunk: self.max_entries_per_chunk,
                    last_entry_synced: 0,
                    page_size: self.page_size,
                    gzip_level: (self.gzip_level > 0).then_some(self.gzip_level),
                    metadata: None,
                    size_field: None,
                    length_profile: None,
                };
                let sub = TimeSeries::create_inner(
                    &self.path.join(&sub_name),
                    &sub_name,
                    meta,
                    self.descriptor_based,
                )?;
                debug!(
                    "varlen series {} grew sub-series {sub_name} ({} bytes/record)",
                    self.name,
                    sub.block_size()
                );
                subs.push(sub);
            }
        }

        let head_len = (self.profile.size_of(0) as usize).min(data.len());
        let mut head = encode_length(self.size_field, data.len() as u64);
        head.extend_from_slice(&data[..head_len]);
        self.root.append_padded(timestamp, &head)?;

        let subs = self.subs.read();
        let mut offset = self.profile.size_of(0) as usize;
        let mut number = 1usize;
        while offset < data.len() {
            let take = (self.profile.size_of(number) as usize).min(data.len() - offset);
            subs[number - 1].append_padded(timestamp, &data[offset..offset + take])?;
            offset += take;
            number += 1;
        }
        Ok(())
    }

    /// Returns an iterator over logical records with timestamps in
    /// `[start, stop]` (both inclusive).
    pub fn iterate_range(&self, start: u64, stop: u64) -> Result<VarlenIterator> {
        self.check_open()?;
        let subs = self.subs.read();
        let mut iterators = Vec::with_capacity(1 + subs.len());
        iterators.push(self.root.iterate_range(start, stop)?);
        for sub in subs.iter() {
            iterators.push(sub.iterate_range(start, stop)?);
        }
        Ok(VarlenIterator::new(
            self.size_field,
            self.profile.clone(),
            iterators,
            Arc::clone(&self.references),
        ))
    }

    /// Returns the most recent record as owned bytes.
    ///
    /// Fails with [`SiloError::InvalidArgument`] when the series holds no
    /// data yet.
    pub fn get_current_value(&self) -> Result<(u64, Vec<u8>)> {
        self.check_open()?;
        let (timestamp, _) = self.root.get_current_value()?;
        let mut iterator = self.iterate_range(timestamp, timestamp)?;
        let entry = iterator.next_entry()?.ok_or_else(|| {
            SiloError::corruption(format!(
                "record at {timestamp} vanished from varlen series {}",
                self.name
            ))
        })?;
        let bytes = entry.to_bytes()?;
        entry.close();
        iterator.close();
        Ok((timestamp, bytes))
    }

    /// Evicts unreferenced open chunks of every sub-series.
    pub fn close_chunks(&self) {
        self.root.close_chunks();
        for sub in self.subs.read().iter() {
            sub.close_chunks();
        }
    }

    /// Persists metadata and flushes the newest chunk of every
    /// sub-series.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.root.sync()?;
        for sub in self.subs.read().iter() {
            sub.sync()?;
        }
        Ok(())
    }

    /// Closes the series and every sub-series.
    ///
    /// Refuses with [`SiloError::StillOpen`] while iterators or entries
    /// reference this series, unless `force` is set. Closing twice is a
    /// no-op.
    pub fn close(&self, force: bool) -> Result<()> {
        let references = self.references();
        if references > 0 && !force {
            return Err(SiloError::StillOpen(references));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if references > 0 {
            warn!(
                "force-closing varlen series {} with {references} outstanding reference(s)",
                self.name
            );
        }
        self.root.close()?;
        for sub in self.subs.read().iter() {
            sub.close()?;
        }
        debug!("closed varlen series {}", self.name);
        Ok(())
    }

    /// Closes the series unconditionally and removes its directory
    /// recursively.
    pub fn delete(&self) -> Result<()> {
        self.close(true)?;
        fs::remove_dir_all(&self.path)?;
        debug!("deleted varlen series {} at {}", self.name, self.path.display());
        Ok(())
    }

    /// Free-form user tags stored with the root sub-series.
    pub fn metadata(&self) -> Option<BTreeMap<String, String>> {
        self.root.metadata()
    }
}

impl Drop for VarlenSeries {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close(true) {
                warn!(
                    "varlen series {} dropped while failing to close: {err}",
                    self.name
                );
            }
        }
    }
}
