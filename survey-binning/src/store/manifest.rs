/// Store manifest, the single-writer lock and shared reader locks
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use constants::store::{
    LOCK_FILE, MANIFEST_FILE, READ_LOCK_PREFIX, READ_LOCK_SUFFIX, STORE_FORMAT_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::grid::BinGrid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreState {
    /// A run holds the write lock
    Writing,
    /// Cancelled at a committed boundary; can be resumed
    Suspended,
    /// Read-only and queryable
    Complete,
    /// Aborted by a fatal error; never queryable
    Incomplete { reason: String },
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::Writing => write!(f, "writing"),
            StoreState::Suspended => write!(f, "suspended"),
            StoreState::Complete => write!(f, "complete"),
            StoreState::Incomplete { reason } => write!(f, "incomplete: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub version: u32,
    /// Identity of the geometry, configuration and edits that produced the store
    pub fingerprint: String,
    pub state: StoreState,
    /// Bumped every time the directory is rewritten from scratch
    #[serde(default)]
    pub generation: u64,
    /// Records committed so far
    pub record_count: u64,
    pub chunk_records: u64,
    pub chunk_count: u32,
    pub grid: BinGrid,
}

impl StoreManifest {
    pub fn new(fingerprint: &str, grid: BinGrid, chunk_records: u64) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            fingerprint: fingerprint.to_string(),
            state: StoreState::Writing,
            generation: 0,
            record_count: 0,
            chunk_records,
            chunk_count: 0,
            grid,
        }
    }

    pub fn chunks_for(record_count: u64, chunk_records: u64) -> u32 {
        record_count.div_ceil(chunk_records) as u32
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn read(dir: &Path) -> Result<Self, StoreError> {
        let path = Self::path(dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: StoreManifest = serde_json::from_str(&text)?;
        if manifest.version != STORE_FORMAT_VERSION {
            return Err(StoreError::Version {
                found: manifest.version,
                expected: STORE_FORMAT_VERSION,
            });
        }
        if manifest.chunk_records == 0 {
            return Err(StoreError::IndexCorrupt("manifest has zero chunk size".into()));
        }
        Ok(manifest)
    }

    /// Replace the manifest atomically
    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Exclusive write access to a store directory, released on drop.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }

    pub fn is_held(dir: &Path) -> bool {
        dir.join(LOCK_FILE).exists()
    }

    /// Remove a lock left behind by a process that died
    pub fn break_stale(dir: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(dir.join(LOCK_FILE)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

static READ_LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Shared read access to a store directory, released on drop.
///
/// A reader creates its lock file before checking for a writer and a writer
/// takes its lock before counting readers, so one of the two always sees
/// the other.
#[derive(Debug)]
pub struct ReadLock {
    path: PathBuf,
}

impl ReadLock {
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let name = format!(
            "{}{}-{}{}",
            READ_LOCK_PREFIX,
            std::process::id(),
            READ_LOCK_SEQ.fetch_add(1, Ordering::Relaxed),
            READ_LOCK_SUFFIX
        );
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }
        let lock = Self { path };
        if WriteLock::is_held(dir) {
            return Err(StoreError::Locked(dir.to_path_buf()));
        }
        Ok(lock)
    }

    /// Reader lock files currently present in `dir`
    pub fn holders(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut holders = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name
                .to_str()
                .is_some_and(|n| n.starts_with(READ_LOCK_PREFIX) && n.ends_with(READ_LOCK_SUFFIX))
            {
                holders.push(entry.path());
            }
        }
        Ok(holders)
    }

    /// Fail with [`StoreError::InUse`] while any reader holds `dir`
    pub fn ensure_none(dir: &Path) -> Result<(), StoreError> {
        let readers = Self::holders(dir)?.len();
        if readers > 0 {
            return Err(StoreError::InUse {
                path: dir.to_path_buf(),
                readers,
            });
        }
        Ok(())
    }

    /// Remove reader locks left behind by processes that died
    pub fn break_stale(dir: &Path) -> Result<usize, StoreError> {
        let holders = Self::holders(dir)?;
        for path in &holders {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(holders.len())
    }
}

impl Drop for ReadLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to release reader lock");
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Rect;

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let grid = BinGrid::covering(&Rect::new(0.0, 0.0, 100.0, 100.0), 25.0, 25.0);
        let mut manifest = StoreManifest::new("abc", grid, 64);
        manifest.state = StoreState::Incomplete {
            reason: "disk full".into(),
        };
        manifest.write(dir.path()).unwrap();
        assert_eq!(StoreManifest::read(dir.path()).unwrap(), manifest);
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StoreManifest::read(dir.path()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WriteLock::acquire(dir.path()).unwrap();
        assert!(WriteLock::is_held(dir.path()));
        assert!(matches!(
            WriteLock::acquire(dir.path()),
            Err(StoreError::Locked(_))
        ));
        drop(lock);
        assert!(!WriteLock::is_held(dir.path()));
        assert!(WriteLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_reader_locks_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let first = ReadLock::acquire(dir.path()).unwrap();
        let second = ReadLock::acquire(dir.path()).unwrap();
        assert_eq!(ReadLock::holders(dir.path()).unwrap().len(), 2);
        assert!(matches!(
            ReadLock::ensure_none(dir.path()),
            Err(StoreError::InUse { readers: 2, .. })
        ));

        drop(first);
        drop(second);
        assert!(ReadLock::ensure_none(dir.path()).is_ok());
        // The write lock is not mistaken for a reader.
        let _writer = WriteLock::acquire(dir.path()).unwrap();
        assert!(ReadLock::holders(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_reader_refused_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WriteLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            ReadLock::acquire(dir.path()),
            Err(StoreError::Locked(_))
        ));
        // A refused reader leaves no lock file behind.
        assert!(ReadLock::holders(dir.path()).unwrap().is_empty());
        drop(writer);
        assert!(ReadLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_reader_lock_in_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReadLock::acquire(&dir.path().join("absent")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_break_stale_reader_locks() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ReadLock::acquire(dir.path()).unwrap();
        assert_eq!(ReadLock::break_stale(dir.path()).unwrap(), 1);
        assert!(ReadLock::ensure_none(dir.path()).is_ok());
        drop(lock);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(StoreManifest::chunks_for(0, 8), 0);
        assert_eq!(StoreManifest::chunks_for(8, 8), 1);
        assert_eq!(StoreManifest::chunks_for(9, 8), 2);
    }
}
