//! Silo - embedded append-only time-series store.
//!
//! This crate provides local, file-backed storage for telemetry on
//! devices that buffer data before uplink. A database is a directory;
//! inside it live named series mapping strictly increasing `u64`
//! timestamps to fixed-size byte records, or to variable-length records
//! composed out of several fixed-length series.
//!
//! # Components
//!
//! - [`Database`]: directory-level multiplexing of named series
//! - [`TimeSeries`]: an ordered collection of chunks with a
//!   reference-counted open-chunk cache and bounded range scans
//! - [`VarlenSeries`]: variable-length records sliced across sub-series
//!   per a length profile
//! - [`Chunk`]: one page-aligned file of equal-sized records, accessed
//!   through memory mapping with transparent degradation to descriptor
//!   reads and optional gzip compression
//!
//! # Example
//!
//! ```rust,ignore
//! use silo::{Database, SeriesOptions};
//!
//! let db = Database::create("/var/lib/telemetry")?;
//! let series = db.create_series("engine-temp", 4, 65536, SeriesOptions::default())?;
//!
//! series.append(1_700_000_000, &25.5f32.to_le_bytes())?;
//!
//! let mut scan = series.iterate_range(0, u64::MAX)?;
//! while let Some((ts, value)) = scan.next_item()? {
//!     println!("{ts}: {value:?}");
//! }
//! scan.close();
//! db.close()?;
//! ```

#![deny(missing_docs)]

pub mod chunk;
pub mod database;
pub mod error;
pub mod metadata;
pub mod series;
pub mod varlen;

pub use chunk::{Chunk, ChunkKind};
pub use database::{Database, RESERVED_SERIES_NAMES};
pub use error::{Result, SiloError};
pub use metadata::{MetadataCodec, SeriesMetadata};
pub use series::{RangeIterator, SeriesOptions, TimeSeries, DEFAULT_PAGE_SIZE};
pub use varlen::{LengthProfile, VarlenEntry, VarlenIterator, VarlenSeries};
