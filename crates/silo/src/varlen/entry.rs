//! Lazy view over one variable-length record.

use crate::chunk::ChunkGuard;
use crate::error::{Result, SiloError};
use crate::varlen::LengthProfile;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One logical record of a variable-length series.
///
/// The entry does not own the payload: it holds a referenced `(chunk,
/// index)` pair per sub-series the record spans, and reassembles bytes on
/// demand. Prefix and suffix checks read only the bytes they need. The
/// chunk references (and the hold on the owning series) are released when
/// the entry is dropped or explicitly closed.
#[derive(Debug)]
pub struct VarlenEntry {
    timestamp: u64,
    size_field: u8,
    profile: LengthProfile,
    /// Per sub-series: the referenced chunk and the record index within
    /// it. Position 0 is the root sub-series.
    segments: Vec<(ChunkGuard, u32)>,
    series_refs: Option<Arc<AtomicU32>>,
}

impl VarlenEntry {
    pub(crate) fn new(
        timestamp: u64,
        size_field: u8,
        profile: LengthProfile,
        segments: Vec<(ChunkGuard, u32)>,
        series_refs: Arc<AtomicU32>,
    ) -> Self {
        series_refs.fetch_add(1, Ordering::AcqRel);
        Self {
            timestamp,
            size_field,
            profile,
            segments,
            series_refs: Some(series_refs),
        }
    }

    /// The record's timestamp.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The payload length, decoded from the length prefix stored in the
    /// root sub-series.
    pub fn len(&self) -> Result<u64> {
        let (root, index) = &self.segments[0];
        let prefix = root.slice_at(*index, 0, u32::from(self.size_field))?;
        let mut word = [0u8; 4];
        word[..prefix.len()].copy_from_slice(&prefix);
        Ok(u64::from(u32::from_le_bytes(word)))
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads payload bytes `[start, stop)`, gathering across however many
    /// sub-series the range spans.
    pub fn slice(&self, start: u64, stop: u64) -> Result<Vec<u8>> {
        let total = self.len()?;
        if start > stop || stop > total {
            return Err(SiloError::invalid(format!(
                "slice [{start}, {stop}) out of range for a {total}-byte record"
            )));
        }
        let mut out = Vec::with_capacity((stop - start) as usize);
        let mut segment_start = 0u64;
        for (position, (chunk, index)) in self.segments.iter().enumerate() {
            let capacity = u64::from(self.profile.size_of(position));
            let segment_end = segment_start + capacity;
            if stop <= segment_start {
                break;
            }
            if start < segment_end {
                let from = start.max(segment_start) - segment_start;
                let to = stop.min(segment_end) - segment_start;
                // The root record's payload begins after the length
                // prefix; numbered sub-series store raw payload bytes.
                let base = if position == 0 {
                    u32::from(self.size_field)
                } else {
                    0
                };
                out.extend(chunk.slice_at(*index, base + from as u32, base + to as u32)?);
            }
            segment_start = segment_end;
        }
        if out.len() as u64 != stop - start {
            return Err(SiloError::corruption(format!(
                "record at {} is missing sub-series segments",
                self.timestamp
            )));
        }
        Ok(out)
    }

    /// Reads a single payload byte.
    pub fn byte_at(&self, position: u64) -> Result<u8> {
        let byte = self.slice(position, position + 1)?;
        Ok(byte[0])
    }

    /// Reassembles the whole payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = self.len()?;
        self.slice(0, total)
    }

    /// True when the payload begins with `prefix`; reads only
    /// `prefix.len()` bytes.
    pub fn starts_with(&self, prefix: &[u8]) -> Result<bool> {
        let total = self.len()?;
        if (prefix.len() as u64) > total {
            return Ok(false);
        }
        Ok(self.slice(0, prefix.len() as u64)? == prefix)
    }

    /// True when the payload ends with `suffix`; reads only
    /// `suffix.len()` bytes.
    pub fn ends_with(&self, suffix: &[u8]) -> Result<bool> {
        let total = self.len()?;
        if (suffix.len() as u64) > total {
            return Ok(false);
        }
        Ok(self.slice(total - suffix.len() as u64, total)? == suffix)
    }

    /// Compares the payload with a raw byte sequence.
    pub fn eq_bytes(&self, other: &[u8]) -> Result<bool> {
        if self.len()? != other.len() as u64 {
            return Ok(false);
        }
        Ok(self.to_bytes()? == other)
    }

    /// Orders the payload against a raw byte sequence,
    /// lexicographically.
    pub fn cmp_bytes(&self, other: &[u8]) -> Result<std::cmp::Ordering> {
        Ok(self.to_bytes()?.as_slice().cmp(other))
    }

    /// Feeds the reassembled payload into `state`, so that two entries
    /// (or an entry and a raw byte sequence) that compare equal through
    /// [`eq_bytes`] hash identically.
    ///
    /// [`eq_bytes`]: VarlenEntry::eq_bytes
    pub fn hash_payload<H: Hasher>(&self, state: &mut H) -> Result<()> {
        self.to_bytes()?.hash(state);
        Ok(())
    }

    /// Releases the chunk references held by this entry. Dropping the
    /// entry has the same effect.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.segments.clear();
        if let Some(refs) = self.series_refs.take() {
            refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for VarlenEntry {
    fn drop(&mut self) {
        self.release();
    }
}
