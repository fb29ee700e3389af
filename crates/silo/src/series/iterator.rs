//! Bounded-scan iteration across a cascade of referenced chunks.

use crate::chunk::ChunkGuard;
use crate::error::Result;
use std::collections::VecDeque;

/// Iterator over the records of a series within `[start, stop]`.
///
/// The iterator is handed every chunk it may visit, each behind a
/// reference guard, at construction time; chunks under iteration can
/// therefore not be evicted from the series' open-chunk cache. References
/// are released one by one as the scan leaves each chunk, and the rest are
/// dropped when the iterator is closed or dropped.
///
/// Within the first chunk the cursor starts at the lower bound of
/// `start`; within the last chunk it stops at the upper bound of `stop`;
/// middle chunks are scanned in full.
#[derive(Debug)]
pub struct RangeIterator {
    start: u64,
    stop: u64,
    queue: VecDeque<ChunkGuard>,
    current: Option<ChunkGuard>,
    /// Cursor within the current chunk.
    index: u32,
    /// First index past the scan within the current chunk.
    limit: u32,
    /// True until the first chunk has been entered.
    at_first: bool,
}

impl RangeIterator {
    /// Builds an iterator over `chunks` (ordered, already referenced)
    /// bounded by the clamped `[start, stop]` range.
    pub(crate) fn new(start: u64, stop: u64, chunks: VecDeque<ChunkGuard>) -> Self {
        Self {
            start,
            stop,
            queue: chunks,
            current: None,
            index: 0,
            limit: 0,
            at_first: true,
        }
    }

    /// Builds an iterator that yields nothing.
    pub(crate) fn empty() -> Self {
        Self::new(0, 0, VecDeque::new())
    }

    /// Moves the cursor into the next queued chunk, releasing the
    /// reference on the one being left. Returns false when the queue is
    /// exhausted.
    fn advance_chunk(&mut self) -> Result<bool> {
        self.current = None;
        let Some(guard) = self.queue.pop_front() else {
            return Ok(false);
        };

        let is_first = self.at_first;
        self.at_first = false;
        let is_last = self.queue.is_empty();

        self.index = if is_first {
            guard.find_left(self.start)?
        } else {
            0
        };
        self.limit = if is_last {
            guard.find_right(self.stop)?
        } else {
            guard.entries()
        };
        self.current = Some(guard);
        Ok(true)
    }

    /// Returns the next `(timestamp, payload)` pair, or `None` when the
    /// range is exhausted.
    pub fn next_item(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        loop {
            match &self.current {
                Some(guard) if self.index < self.limit => {
                    let piece = guard.piece_at(self.index)?;
                    self.index += 1;
                    return Ok(Some(piece));
                }
                _ => {
                    if !self.advance_chunk()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Returns the position of the next record as
    /// `(timestamp, index, chunk)` without reading the payload, advancing
    /// the cursor. The returned guard is an independent reference that the
    /// caller may outlive this iterator with.
    pub(crate) fn next_position(&mut self) -> Result<Option<(u64, u32, ChunkGuard)>> {
        loop {
            match &self.current {
                Some(guard) if self.index < self.limit => {
                    let ts = guard.timestamp_at(self.index)?;
                    let position = (ts, self.index, guard.clone());
                    self.index += 1;
                    return Ok(Some(position));
                }
                _ => {
                    if !self.advance_chunk()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Releases every remaining chunk reference. Dropping the iterator
    /// has the same effect.
    pub fn close(&mut self) {
        self.current = None;
        self.queue.clear();
    }
}

impl Iterator for RangeIterator {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // Lower bound: what is left of the current chunk; upper bound is
        // unknown without opening the queued chunks.
        let current_remaining = (self.limit - self.index) as usize;
        (current_remaining, None)
    }
}
