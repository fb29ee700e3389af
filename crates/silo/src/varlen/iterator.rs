//! Timestamp-aligned join over the sub-series of a varlen series.

use crate::chunk::ChunkGuard;
use crate::error::Result;
use crate::series::RangeIterator;
use crate::varlen::{LengthProfile, VarlenEntry};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Iterator over the logical records of a variable-length series.
///
/// One bounded iterator runs per sub-series; each keeps a pending
/// `(timestamp, index, chunk)` slot. A logical record is emitted by
/// taking the root slot's timestamp, gathering the slot of every
/// sub-series pending at that same timestamp, and advancing those slots.
/// Iteration ends when the root is exhausted.
#[derive(Debug)]
pub struct VarlenIterator {
    size_field: u8,
    profile: LengthProfile,
    /// Per-sub-series iterators; position 0 is the root.
    iterators: Vec<RangeIterator>,
    /// Pending position per sub-series, `None` when exhausted.
    slots: Vec<Option<(u64, u32, ChunkGuard)>>,
    primed: bool,
    series_refs: Option<Arc<AtomicU32>>,
}

impl VarlenIterator {
    pub(crate) fn new(
        size_field: u8,
        profile: LengthProfile,
        iterators: Vec<RangeIterator>,
        series_refs: Arc<AtomicU32>,
    ) -> Self {
        series_refs.fetch_add(1, Ordering::AcqRel);
        let slots = iterators.iter().map(|_| None).collect();
        Self {
            size_field,
            profile,
            iterators,
            slots,
            primed: false,
            series_refs: Some(series_refs),
        }
    }

    /// Returns the next logical record, or `None` when the root
    /// sub-series is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<VarlenEntry>> {
        if self.series_refs.is_none() {
            // Already closed.
            return Ok(None);
        }
        if !self.primed {
            for (iterator, slot) in self.iterators.iter_mut().zip(self.slots.iter_mut()) {
                *slot = iterator.next_position()?;
            }
            self.primed = true;
        }

        let Some(&(timestamp, _, _)) = self.slots[0].as_ref() else {
            return Ok(None);
        };

        let mut segments = Vec::new();
        for (iterator, slot) in self.iterators.iter_mut().zip(self.slots.iter_mut()) {
            let pending = matches!(slot, Some((ts, _, _)) if *ts == timestamp);
            if pending {
                let (_, index, guard) = slot.take().expect("slot checked above");
                segments.push((guard, index));
                *slot = iterator.next_position()?;
            }
        }

        let refs = self
            .series_refs
            .as_ref()
            .expect("iterator still open")
            .clone();
        Ok(Some(VarlenEntry::new(
            timestamp,
            self.size_field,
            self.profile.clone(),
            segments,
            refs,
        )))
    }

    /// Releases every pending chunk reference and the hold on the owning
    /// series. Dropping the iterator has the same effect.
    pub fn close(&mut self) {
        self.slots.clear();
        for iterator in &mut self.iterators {
            iterator.close();
        }
        self.iterators.clear();
        if let Some(refs) = self.series_refs.take() {
            refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Iterator for VarlenIterator {
    type Item = Result<VarlenEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl Drop for VarlenIterator {
    fn drop(&mut self) {
        self.close();
    }
}
