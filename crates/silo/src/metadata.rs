//! Metadata documents for series and databases.
//!
//! Every series directory carries exactly one metadata document, in one of
//! two interchangeable codecs:
//!
//! - a textual JSON document stored as `metadata`;
//! - a compact binary document stored as `metadata.bin`.
//!
//! Readers accept whichever single codec is present; writers keep using
//! the codec that already exists on disk, and fresh creations prefer the
//! compact form. A directory carrying both documents is ambiguous and is
//! reported as an environment error.
//!
//! Documents are replaced atomically: the new contents are written to a
//! temporary file, synced, and renamed over the old document.

use crate::error::{Result, SiloError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Filename of the textual metadata document.
pub const METADATA_FILE: &str = "metadata";

/// Filename of the compact metadata document.
pub const METADATA_BIN_FILE: &str = "metadata.bin";

/// The codec a metadata document is stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCodec {
    /// JSON, stored as `metadata`.
    Textual,
    /// Compact binary, stored as `metadata.bin`.
    Compact,
}

impl MetadataCodec {
    /// The filename this codec writes to.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Textual => METADATA_FILE,
            Self::Compact => METADATA_BIN_FILE,
        }
    }

    /// The codec preferred when creating a fresh document.
    pub fn preferred() -> Self {
        Self::Compact
    }
}

/// The metadata document of a fixed-length series.
///
/// The `size_field` and `length_profile` keys are present only on the
/// `root` sub-series of a variable-length series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    /// Payload size of every record in the series.
    pub block_size: u32,
    /// Record count at which a chunk rolls over.
    pub max_entries_per_chunk: u32,
    /// Highest timestamp the caller has marked as synchronized upstream.
    pub last_entry_synced: u64,
    /// Allocation granularity for normal chunks.
    pub page_size: u64,
    /// Gzip level for newly created chunks; `None` or 0 disables gzip.
    #[serde(default)]
    pub gzip_level: Option<u32>,
    /// Free-form user tags attached to the series.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    /// Varlen root only: width of the length prefix, in bytes (1..=4).
    #[serde(default)]
    pub size_field: Option<u8>,
    /// Varlen root only: per-sub-series record sizes; the last repeats.
    #[serde(default)]
    pub length_profile: Option<Vec<u32>>,
}

/// Determines which codec is present in `dir`, if any.
///
/// Both documents present is an environment error: the layout no longer
/// says which one is authoritative.
pub(crate) fn detect_codec(dir: &Path) -> Result<Option<MetadataCodec>> {
    let textual = dir.join(METADATA_FILE).is_file();
    let compact = dir.join(METADATA_BIN_FILE).is_file();
    match (textual, compact) {
        (true, true) => Err(SiloError::Environment(format!(
            "{} carries both {METADATA_FILE} and {METADATA_BIN_FILE}",
            dir.display()
        ))),
        (true, false) => Ok(Some(MetadataCodec::Textual)),
        (false, true) => Ok(Some(MetadataCodec::Compact)),
        (false, false) => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(codec: MetadataCodec, bytes: &[u8], dir: &Path) -> Result<T> {
    match codec {
        MetadataCodec::Textual => serde_json::from_slice(bytes).map_err(|err| {
            SiloError::corruption(format!("bad metadata in {}: {err}", dir.display()))
        }),
        MetadataCodec::Compact => bincode::deserialize(bytes).map_err(|err| {
            SiloError::corruption(format!("bad metadata in {}: {err}", dir.display()))
        }),
    }
}

fn encode<T: Serialize>(codec: MetadataCodec, value: &T) -> Result<Vec<u8>> {
    match codec {
        MetadataCodec::Textual => serde_json::to_vec_pretty(value)
            .map_err(|err| SiloError::Environment(format!("cannot encode metadata: {err}"))),
        MetadataCodec::Compact => bincode::serialize(value)
            .map_err(|err| SiloError::Environment(format!("cannot encode metadata: {err}"))),
    }
}

fn read_document<T: DeserializeOwned>(dir: &Path) -> Result<Option<(T, MetadataCodec)>> {
    let Some(codec) = detect_codec(dir)? else {
        return Ok(None);
    };
    let bytes = fs::read(dir.join(codec.file_name()))?;
    Ok(Some((decode(codec, &bytes, dir)?, codec)))
}

fn write_document<T: Serialize>(dir: &Path, value: &T, codec: MetadataCodec) -> Result<()> {
    let bytes = encode(codec, value)?;
    let final_path = dir.join(codec.file_name());
    let tmp_path = dir.join(format!("{}.tmp", codec.file_name()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

/// Reads the series metadata document from `dir`.
///
/// Fails with [`SiloError::Corruption`] if the document is absent or
/// undecodable, and with [`SiloError::Environment`] if both codecs are
/// present.
pub(crate) fn read_series_metadata(dir: &Path) -> Result<(SeriesMetadata, MetadataCodec)> {
    read_document(dir)?.ok_or_else(|| {
        SiloError::corruption(format!("{} has no metadata document", dir.display()))
    })
}

/// Writes the series metadata document to `dir` with the given codec.
pub(crate) fn write_series_metadata(
    dir: &Path,
    meta: &SeriesMetadata,
    codec: MetadataCodec,
) -> Result<()> {
    write_document(dir, meta, codec)
}

/// Reads database-level metadata from `dir`; an absent document means an
/// empty map stored with the preferred codec.
pub(crate) fn read_db_metadata(dir: &Path) -> Result<(BTreeMap<String, String>, MetadataCodec)> {
    match read_document(dir)? {
        Some((map, codec)) => Ok((map, codec)),
        None => Ok((BTreeMap::new(), MetadataCodec::preferred())),
    }
}

/// Writes database-level metadata to `dir` with the given codec.
pub(crate) fn write_db_metadata(
    dir: &Path,
    map: &BTreeMap<String, String>,
    codec: MetadataCodec,
) -> Result<()> {
    write_document(dir, map, codec)
}
