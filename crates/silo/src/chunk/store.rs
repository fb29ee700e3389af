//! Byte-level access to a chunk file: memory-mapped or descriptor-based.
//!
//! A [`ChunkStore`] is a sum type over the two physical access strategies:
//!
//! - `Mapped`: the whole file is mapped read/write; reads copy out of the
//!   mapping and writes copy into it. No lock is needed because the chunk
//!   serializes writers above this layer and all mutations are monotonic
//!   tail appends.
//! - `Descriptor`: a portable fallback going through explicit
//!   `seek` + `read`/`write` on the file descriptor, serialized by a
//!   per-chunk lock.
//!
//! Mapping failures that merely reflect resource pressure (out of memory,
//! address space exhausted, too many open maps) or a filesystem that does
//! not support mapping degrade silently to descriptor access. Anything
//! else is treated as corruption by the caller.

use crate::error::Result;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Errno values that make an mmap failure recoverable by falling back to
/// descriptor-based access.
#[cfg(unix)]
const RECOVERABLE_ERRNOS: &[i32] = &[
    11, // EAGAIN: kernel ran out of memory for bookkeeping
    12, // ENOMEM: address space or memory exhausted
    19, // ENODEV: filesystem does not support memory mapping
    23, // ENFILE: system-wide limit on open maps/files
    24, // EMFILE: per-process limit on open maps/files
    95, // EOPNOTSUPP: mapping not supported on this file
];

/// Returns true if a failed mapping attempt should silently degrade to
/// descriptor-based access rather than surface as corruption.
pub(crate) fn is_recoverable_map_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::OutOfMemory | io::ErrorKind::Unsupported
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(errno) = err.raw_os_error() {
            return RECOVERABLE_ERRNOS.contains(&errno);
        }
    }
    false
}

/// Physical access to one chunk file.
#[derive(Debug)]
pub(crate) enum ChunkStore {
    /// Read/write memory mapping of the whole file.
    Mapped {
        /// Keeps the descriptor alive for resizes and remaps.
        file: File,
        /// The live mapping; always spans the full file length.
        map: MmapMut,
    },
    /// Descriptor-based access; the lock serializes every read and write.
    Descriptor {
        /// The file, guarded because `seek` moves shared cursor state.
        file: Mutex<File>,
    },
}

impl ChunkStore {
    /// Attempts to map `file` read/write. On failure the file is handed
    /// back together with the mapping error so the caller can classify it.
    pub(crate) fn try_mapped(file: File) -> std::result::Result<Self, (File, io::Error)> {
        // Safety: the mapping is dropped before (or together with) the file,
        // and the single-writer discipline above this layer prevents
        // concurrent mutation of a byte range that is being read.
        match unsafe { MmapOptions::new().map_mut(&file) } {
            Ok(map) => Ok(Self::Mapped { file, map }),
            Err(err) => Err((file, err)),
        }
    }

    /// Wraps `file` in the portable descriptor-based variant.
    pub(crate) fn descriptor(file: File) -> Self {
        debug!("chunk store using descriptor-based access");
        Self::Descriptor {
            file: Mutex::new(file),
        }
    }

    /// Returns true when this store is backed by a live mapping.
    pub(crate) fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    ///
    /// The caller guarantees the range lies within the file.
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Mapped { map, .. } => {
                let start = offset as usize;
                buf.copy_from_slice(&map[start..start + buf.len()]);
                Ok(())
            }
            Self::Descriptor { file } => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
                Ok(())
            }
        }
    }

    /// Writes `data` starting at `offset`.
    ///
    /// The caller guarantees the range lies within the file.
    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Mapped { map, .. } => {
                let start = offset as usize;
                map[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Self::Descriptor { file } => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                Ok(())
            }
        }
    }

    /// Flushes written data to the underlying file.
    pub(crate) fn flush(&self) -> Result<()> {
        match self {
            Self::Mapped { map, .. } => {
                map.flush()?;
                Ok(())
            }
            Self::Descriptor { file } => {
                let file = file.lock();
                file.sync_data()?;
                Ok(())
            }
        }
    }

    /// Consumes the store, returning the owned file descriptor.
    ///
    /// Any live mapping is flushed and dropped first.
    pub(crate) fn into_file(self) -> Result<File> {
        match self {
            Self::Mapped { file, map } => {
                map.flush()?;
                drop(map);
                Ok(file)
            }
            Self::Descriptor { file } => Ok(file.into_inner()),
        }
    }
}
