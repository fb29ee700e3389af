//! Database: a directory multiplexing named series.
//!
//! A database is a directory holding one sub-directory per fixed-length
//! series, a `varlen/` directory of variable-length series, and an
//! optional database-level metadata document:
//!
//! ```text
//! <root>/
//!   metadata           (or metadata.bin; optional)
//!   varlen/
//!     <name>/          (variable-length series)
//!   <name>/            (fixed-length series)
//! ```
//!
//! The database keeps a registry of open series, hands out shared handles
//! and closes everything on [`Database::close`]. Series names matching
//! the reserved layout entries are rejected.

use crate::error::{Result, SiloError};
use crate::metadata::{self, MetadataCodec};
use crate::series::{SeriesOptions, TimeSeries};
use crate::varlen::VarlenSeries;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Directory holding the variable-length series of a database.
const VARLEN_DIR: &str = "varlen";

/// Names that cannot be used for series because the database layout
/// claims them.
pub const RESERVED_SERIES_NAMES: [&str; 3] = [
    VARLEN_DIR,
    metadata::METADATA_FILE,
    metadata::METADATA_BIN_FILE,
];

/// Handle to a database directory.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    codec: MetadataCodec,
    metadata: Mutex<BTreeMap<String, String>>,
    open_series: Mutex<HashMap<String, Arc<TimeSeries>>>,
    open_varlen: Mutex<HashMap<String, Arc<VarlenSeries>>>,
    closed: AtomicBool,
}

fn validate_series_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SiloError::invalid("series name must not be empty"));
    }
    if RESERVED_SERIES_NAMES.contains(&name) {
        return Err(SiloError::invalid(format!(
            "series name {name} is reserved"
        )));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(SiloError::invalid(format!(
            "series name {name} must not traverse directories"
        )));
    }
    Ok(())
}

impl Database {
    /// Creates a new database directory at `path`.
    ///
    /// Fails with [`SiloError::AlreadyExists`] if the directory exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Database> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SiloError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(path)?;
        fs::create_dir(path.join(VARLEN_DIR))?;
        debug!("created database at {}", path.display());

        Ok(Database {
            path: path.to_path_buf(),
            codec: MetadataCodec::preferred(),
            metadata: Mutex::new(BTreeMap::new()),
            open_series: Mutex::new(HashMap::new()),
            open_varlen: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens an existing database directory.
    ///
    /// Fails with [`SiloError::DoesNotExist`] if the directory is absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(SiloError::DoesNotExist(path.display().to_string()));
        }
        let (map, codec) = metadata::read_db_metadata(path)?;
        let varlen_dir = path.join(VARLEN_DIR);
        if !varlen_dir.is_dir() {
            fs::create_dir(&varlen_dir)?;
        }

        Ok(Database {
            path: path.to_path_buf(),
            codec,
            metadata: Mutex::new(map),
            open_series: Mutex::new(HashMap::new()),
            open_varlen: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SiloError::InvalidState("database is closed"));
        }
        Ok(())
    }

    /// Database-level metadata.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.lock().clone()
    }

    /// Replaces the database-level metadata and persists it.
    pub fn set_metadata(&self, map: BTreeMap<String, String>) -> Result<()> {
        self.check_open()?;
        metadata::write_db_metadata(&self.path, &map, self.codec)?;
        *self.metadata.lock() = map;
        Ok(())
    }

    /// Re-reads the database-level metadata from disk.
    pub fn reload_metadata(&self) -> Result<()> {
        self.check_open()?;
        let (map, _) = metadata::read_db_metadata(&self.path)?;
        *self.metadata.lock() = map;
        Ok(())
    }

    /// Creates a new fixed-length series and returns an open handle.
    pub fn create_series(
        &self,
        name: &str,
        block_size: u32,
        max_entries_per_chunk: u32,
        options: SeriesOptions,
    ) -> Result<Arc<TimeSeries>> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_series.lock();
        if open.contains_key(name) {
            return Err(SiloError::AlreadyExists(name.to_string()));
        }
        let series = TimeSeries::create(
            self.path.join(name),
            name,
            block_size,
            max_entries_per_chunk,
            options,
        )?;
        let series = Arc::new(series);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    /// Returns a handle to the named fixed-length series, opening it if
    /// needed. A series that is already open is shared, not re-opened.
    pub fn get_series(&self, name: &str) -> Result<Arc<TimeSeries>> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_series.lock();
        if let Some(series) = open.get(name) {
            // A handle the caller closed underneath the registry is
            // dropped and the series re-opened from disk.
            if !series.is_closed() {
                return Ok(Arc::clone(series));
            }
            open.remove(name);
        }
        let dir = self.path.join(name);
        if !dir.is_dir() {
            return Err(SiloError::DoesNotExist(name.to_string()));
        }
        let series = Arc::new(TimeSeries::open(dir, name, false)?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    /// Deletes the named fixed-length series and its data.
    pub fn delete_series(&self, name: &str) -> Result<()> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_series.lock();
        if let Some(series) = open.remove(name) {
            series.delete()?;
            return Ok(());
        }
        let dir = self.path.join(name);
        if !dir.is_dir() {
            return Err(SiloError::DoesNotExist(name.to_string()));
        }
        let series = TimeSeries::open(dir, name, false)?;
        series.delete()
    }

    /// Creates a new variable-length series and returns an open handle.
    pub fn create_varlen_series(
        &self,
        name: &str,
        length_profile: Vec<u32>,
        size_field: u8,
        max_entries_per_chunk: u32,
        options: SeriesOptions,
    ) -> Result<Arc<VarlenSeries>> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_varlen.lock();
        if open.contains_key(name) {
            return Err(SiloError::AlreadyExists(name.to_string()));
        }
        let series = VarlenSeries::create(
            self.path.join(VARLEN_DIR).join(name),
            name,
            size_field,
            length_profile,
            max_entries_per_chunk,
            options,
        )?;
        let series = Arc::new(series);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    /// Returns a handle to the named variable-length series, opening it
    /// if needed.
    pub fn get_varlen_series(&self, name: &str) -> Result<Arc<VarlenSeries>> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_varlen.lock();
        if let Some(series) = open.get(name) {
            if !series.is_closed() {
                return Ok(Arc::clone(series));
            }
            open.remove(name);
        }
        let dir = self.path.join(VARLEN_DIR).join(name);
        if !dir.is_dir() {
            return Err(SiloError::DoesNotExist(name.to_string()));
        }
        let series = Arc::new(VarlenSeries::open(dir, name, false)?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    /// Deletes the named variable-length series and its data.
    pub fn delete_varlen_series(&self, name: &str) -> Result<()> {
        self.check_open()?;
        validate_series_name(name)?;
        let mut open = self.open_varlen.lock();
        if let Some(series) = open.remove(name) {
            series.delete()?;
            return Ok(());
        }
        let dir = self.path.join(VARLEN_DIR).join(name);
        if !dir.is_dir() {
            return Err(SiloError::DoesNotExist(name.to_string()));
        }
        let series = VarlenSeries::open(dir, name, false)?;
        series.delete()
    }

    /// Names of every series currently held open, fixed-length and
    /// variable-length alike.
    pub fn get_open_series(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open_series.lock().keys().cloned().collect();
        names.extend(self.open_varlen.lock().keys().cloned());
        names.sort();
        names
    }

    /// Closes every open series and empties the registry.
    pub fn close_all_open_series(&self) -> Result<()> {
        let mut open = self.open_series.lock();
        for (name, series) in open.drain() {
            if let Err(err) = series.close() {
                warn!("closing series {name} failed: {err}");
            }
        }
        drop(open);
        let mut open = self.open_varlen.lock();
        for (name, series) in open.drain() {
            if let Err(err) = series.close(true) {
                warn!("closing varlen series {name} failed: {err}");
            }
        }
        Ok(())
    }

    /// Syncs every open series: metadata documents and newest chunks.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        for series in self.open_series.lock().values() {
            series.sync()?;
        }
        for series in self.open_varlen.lock().values() {
            series.sync()?;
        }
        Ok(())
    }

    /// Evicts unreferenced open chunks across every open series.
    ///
    /// This is the sweep a low-memory pressure hook is expected to call.
    pub fn evict_open_chunks(&self) {
        for series in self.open_series.lock().values() {
            series.close_chunks();
        }
        for series in self.open_varlen.lock().values() {
            series.close_chunks();
        }
    }

    /// Maintenance point: syncs every open series, then evicts
    /// unreferenced open chunks.
    pub fn checkpoint(&self) -> Result<()> {
        self.sync()?;
        self.evict_open_chunks();
        Ok(())
    }

    /// Closes the database and every open series. Closing twice is a
    /// no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_all_open_series()?;
        debug!("closed database at {}", self.path.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(
                    "database at {} dropped while failing to close: {err}",
                    self.path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let db = Database::create(&path).unwrap();
            db.close().unwrap();
        }
        assert!(matches!(
            Database::create(&path),
            Err(SiloError::AlreadyExists(_))
        ));
        let db = Database::open(&path).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_open_missing_database() {
        let dir = TempDir::new().unwrap();
        let err = Database::open(dir.path().join("does-not-exist")).unwrap_err();
        assert!(matches!(err, SiloError::DoesNotExist(_)));
    }

    #[test]
    fn test_reserved_and_malformed_names() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();
        for name in ["varlen", "metadata", "metadata.bin", "", "a/b", ".."] {
            assert!(
                matches!(
                    db.create_series(name, 1, 10, SeriesOptions::default()),
                    Err(SiloError::InvalidArgument(_))
                ),
                "name {name:?} should be rejected"
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();
        assert!(db.metadata().is_empty());

        let map = BTreeMap::from([("hello".to_string(), "world".to_string())]);
        db.set_metadata(map.clone()).unwrap();
        db.reload_metadata().unwrap();
        assert_eq!(db.metadata(), map);
        db.close().unwrap();
    }

    #[test]
    fn test_series_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();

        let series = db
            .create_series("hello-world", 1, 10, SeriesOptions::default())
            .unwrap();
        series.append(10, &[0]).unwrap();
        series.append(20, &[0]).unwrap();
        series.close().unwrap();

        let series = db.get_series("hello-world").unwrap();
        assert_eq!(series.get_current_value().unwrap(), (20, vec![0]));
        assert_eq!(series.last_entry_ts(), 20);
        series.close().unwrap();

        db.delete_series("hello-world").unwrap();
        assert!(matches!(
            db.get_series("hello-world"),
            Err(SiloError::DoesNotExist(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn test_varlen_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();

        let series = db
            .create_varlen_series("hello-world", vec![10, 20], 1, 20, SeriesOptions::default())
            .unwrap();
        series.append(10, &[0]).unwrap();
        series.append(20, &[0, 0, 0]).unwrap();
        series.close(false).unwrap();

        let series = db.get_varlen_series("hello-world").unwrap();
        assert_eq!(series.get_current_value().unwrap(), (20, vec![0, 0, 0]));
        series.close(false).unwrap();

        db.delete_varlen_series("hello-world").unwrap();
        assert!(matches!(
            db.get_varlen_series("hello-world"),
            Err(SiloError::DoesNotExist(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn test_open_series_registry() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();
        db.create_series("test4", 2, 20, SeriesOptions::default())
            .unwrap();
        db.create_series("test5", 2, 20, SeriesOptions::default())
            .unwrap();
        db.create_varlen_series("test5", vec![10, 20, 10], 2, 20, SeriesOptions::default())
            .unwrap();
        db.create_varlen_series("test6", vec![10, 20, 10], 2, 20, SeriesOptions::default())
            .unwrap();

        assert!(db.get_open_series().len() >= 2);
        db.checkpoint().unwrap();
        db.close_all_open_series().unwrap();
        assert_eq!(db.get_open_series().len(), 0);
        db.close().unwrap();
    }

    #[test]
    fn test_get_series_shares_open_handle() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();
        let first = db
            .create_series("shared", 4, 10, SeriesOptions::default())
            .unwrap();
        first.append(1, &[0u8; 4]).unwrap();

        let second = db.get_series("shared").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        db.close().unwrap();
    }
}
