//! Gzip-framed byte store for direct chunks.
//!
//! A gzip chunk is an append-only file made of concatenated gzip members:
//! every writer session appends one member, and the reader joins them with
//! a multi-member decoder. The store keeps a logical (uncompressed) byte
//! address space on top of the compressed file:
//!
//! - appends go through a live encoder opened in file-append mode;
//! - reads walk a decoder positioned at some logical offset, skipping
//!   forward as needed;
//! - after any unflushed write the decoder is stale and is re-opened at
//!   logical offset 0, then skipped forward. This makes a read that
//!   follows a write expensive; gzip chunks trade read latency for
//!   storage, which is the right trade for cold telemetry.
//!
//! Gzip access is mutually exclusive with memory mapping.

use crate::error::{Result, SiloError};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scratch size used when skipping the decoder forward.
const SKIP_BUF_SIZE: usize = 8192;

/// Read-side decoder together with its logical position.
struct GzipReader {
    decoder: MultiGzDecoder<BufReader<File>>,
    pos: u64,
}

/// Mutable state of a gzip store: at most one live encoder (the current
/// member) and at most one decoder.
struct GzipState {
    writer: Option<GzEncoder<File>>,
    reader: Option<GzipReader>,
    /// Set on every append; a read must flush the encoder and rebuild the
    /// decoder before it can observe the appended bytes.
    needs_flush_before_read: bool,
}

/// Append-only gzip-compressed byte store with logical-offset reads.
pub(crate) struct GzipStore {
    path: PathBuf,
    level: Compression,
    state: Mutex<GzipState>,
}

impl std::fmt::Debug for GzipStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipStore")
            .field("path", &self.path)
            .field("level", &self.level.level())
            .finish()
    }
}

impl GzipStore {
    /// Creates a new, empty gzip store at `path`.
    ///
    /// The caller guarantees the file does not exist yet.
    pub(crate) fn create(path: &Path, level: u32) -> Result<Self> {
        OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            level: Compression::new(level),
            state: Mutex::new(GzipState {
                writer: None,
                reader: None,
                needs_flush_before_read: false,
            }),
        })
    }

    /// Opens an existing gzip store and returns it together with the
    /// logical (uncompressed) length of its contents.
    ///
    /// The length is computed by streaming every member through the
    /// decoder once; this is the price of opening a compressed chunk.
    pub(crate) fn open(path: &Path, level: u32) -> Result<(Self, u64)> {
        let compressed_len = std::fs::metadata(path)?.len();
        let logical_len = if compressed_len == 0 {
            0
        } else {
            let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(path)?));
            let mut scratch = [0u8; SKIP_BUF_SIZE];
            let mut total = 0u64;
            loop {
                let n = decoder.read(&mut scratch).map_err(|err| {
                    SiloError::corruption(format!(
                        "gzip chunk {} is not decodable: {err}",
                        path.display()
                    ))
                })?;
                if n == 0 {
                    break;
                }
                total += n as u64;
            }
            total
        };
        Ok((
            Self {
                path: path.to_path_buf(),
                level: Compression::new(level),
                state: Mutex::new(GzipState {
                    writer: None,
                    reader: None,
                    needs_flush_before_read: false,
                }),
            },
            logical_len,
        ))
    }

    /// Appends `data` to the logical stream.
    pub(crate) fn write_append(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.writer.is_none() {
            // First append of this session starts a fresh gzip member.
            let file = OpenOptions::new().append(true).open(&self.path)?;
            state.writer = Some(GzEncoder::new(file, self.level));
        }
        state
            .writer
            .as_mut()
            .expect("writer was just installed")
            .write_all(data)?;
        state.needs_flush_before_read = true;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at logical `offset`.
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();

        if state.needs_flush_before_read {
            if let Some(writer) = state.writer.as_mut() {
                writer.flush()?;
            }
            state.reader = None;
            state.needs_flush_before_read = false;
        }

        let must_reopen = match state.reader.as_ref() {
            Some(reader) => reader.pos > offset,
            None => true,
        };
        if must_reopen {
            state.reader = Some(GzipReader {
                decoder: MultiGzDecoder::new(BufReader::new(File::open(&self.path)?)),
                pos: 0,
            });
        }

        let reader = state.reader.as_mut().expect("reader was just installed");

        // Skip forward to the requested offset.
        let mut scratch = [0u8; SKIP_BUF_SIZE];
        while reader.pos < offset {
            let want = ((offset - reader.pos) as usize).min(SKIP_BUF_SIZE);
            reader.decoder.read_exact(&mut scratch[..want]).map_err(|err| {
                SiloError::corruption(format!(
                    "gzip chunk {} ended before offset {offset}: {err}",
                    self.path.display()
                ))
            })?;
            reader.pos += want as u64;
        }

        reader.decoder.read_exact(buf).map_err(|err| {
            SiloError::corruption(format!(
                "gzip chunk {} truncated at offset {offset}: {err}",
                self.path.display()
            ))
        })?;
        reader.pos += buf.len() as u64;
        Ok(())
    }

    /// Flushes the current encoder so appended bytes reach the file.
    pub(crate) fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Finishes the current gzip member (writing its trailer) and drops
    /// both sides of the store.
    pub(crate) fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.take() {
            let file = writer.finish()?;
            file.sync_all()?;
            debug!("gzip chunk {} member finished", self.path.display());
        }
        state.reader = None;
        Ok(())
    }
}
