//! Chunked, memory-mapped columnar store of trace records.
//!
//! A store directory holds a manifest, numbered chunk files, the persisted
//! bin index and, while a run is writing, a lock file. Only one
//! [`StoreWriter`] may exist per directory. [`AnalysisStore`] readers open
//! complete stores only and hold a shared reader lock, so a new run cannot
//! replace the chunks underneath them. Every query also re-checks the
//! manifest generation and fails with [`StoreError::Changed`] if the store
//! was rewritten anyway.

mod chunk;
mod index;
mod manifest;

use std::fs;
use std::path::{Path, PathBuf};

use constants::store::{CHECKPOINT_FILE, INDEX_FILE, chunk_file_name};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::grid::{BinAddress, BinGrid};
use crate::trace::TraceRecord;

use chunk::{ChunkReader, ChunkWriter, ColumnLayout};

pub use chunk::RECORD_BYTES;
pub use index::BinIndex;
pub use manifest::{ReadLock, StoreManifest, StoreState, WriteLock};

/// Append side of a store, held by exactly one binning run.
pub struct StoreWriter {
    dir: PathBuf,
    manifest: StoreManifest,
    layout: ColumnLayout,
    current: Option<ChunkWriter>,
    index: BinIndex,
    record_count: u64,
    _lock: WriteLock,
}

impl StoreWriter {
    /// Start a fresh store in `dir`, discarding any previous contents.
    /// Refuses while readers have the previous store open.
    pub fn create(
        dir: &Path,
        fingerprint: &str,
        grid: BinGrid,
        chunk_records: u64,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let lock = WriteLock::acquire(dir)?;
        ReadLock::ensure_none(dir)?;

        let previous = StoreManifest::read(dir).ok();
        if let Some(previous) = &previous {
            info!(
                dir = %dir.display(),
                state = %previous.state,
                records = previous.record_count,
                "replacing existing analysis store"
            );
        }
        remove_chunks_from(dir, 0)?;
        remove_if_exists(&dir.join(INDEX_FILE))?;
        remove_if_exists(&dir.join(CHECKPOINT_FILE))?;

        let mut manifest = StoreManifest::new(fingerprint, grid, chunk_records);
        manifest.generation = previous.map_or(1, |p| p.generation + 1);
        manifest.write(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            layout: ColumnLayout::new(chunk_records),
            manifest,
            current: None,
            index: BinIndex::new(),
            record_count: 0,
            _lock: lock,
        })
    }

    /// Reopen a suspended store, keeping the first `committed` records
    pub fn resume(dir: &Path, fingerprint: &str, committed: u64) -> Result<Self, StoreError> {
        let lock = WriteLock::acquire(dir)?;
        ReadLock::ensure_none(dir)?;
        let mut manifest = StoreManifest::read(dir)?;

        if manifest.fingerprint != fingerprint {
            return Err(StoreError::Stale {
                expected: fingerprint.to_string(),
                found: manifest.fingerprint,
            });
        }
        match &manifest.state {
            StoreState::Writing | StoreState::Suspended => {}
            StoreState::Complete => {
                return Err(StoreError::Resume("store is already complete".into()));
            }
            StoreState::Incomplete { reason } => {
                return Err(StoreError::Resume(format!("store was aborted: {reason}")));
            }
        }
        if committed > manifest.record_count {
            return Err(StoreError::Resume(format!(
                "checkpoint expects {committed} records, store committed {}",
                manifest.record_count
            )));
        }

        let layout = ColumnLayout::new(manifest.chunk_records);
        let keep_chunks = StoreManifest::chunks_for(committed, manifest.chunk_records);
        remove_chunks_from(dir, keep_chunks)?;
        remove_if_exists(&dir.join(INDEX_FILE))?;

        let mut index = BinIndex::new();
        for number in 0..keep_chunks {
            let len = rows_in_chunk(committed, manifest.chunk_records, number);
            let reader = ChunkReader::open(&dir.join(chunk_file_name(number)), layout, len)?;
            for row in 0..reader.len() {
                index.insert(manifest.grid.linear(reader.bin(row)), number);
            }
        }

        let tail = committed % manifest.chunk_records;
        let current = if tail > 0 {
            let number = keep_chunks - 1;
            Some(ChunkWriter::reopen(
                &dir.join(chunk_file_name(number)),
                number,
                layout,
                tail,
            )?)
        } else {
            None
        };

        manifest.record_count = committed;
        manifest.chunk_count = keep_chunks;
        manifest.state = StoreState::Writing;
        manifest.write(dir)?;
        info!(dir = %dir.display(), records = committed, "resumed analysis store");

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            layout,
            current,
            index,
            record_count: committed,
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fingerprint(&self) -> &str {
        &self.manifest.fingerprint
    }

    /// Records appended, committed or not
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn committed(&self) -> u64 {
        self.manifest.record_count
    }

    pub fn append(&mut self, record: &TraceRecord) -> Result<(), StoreError> {
        let grid = self.manifest.grid;
        if !grid.contains(record.bin) {
            return Err(StoreError::BinOutOfRange {
                inline: record.bin.inline,
                crossline: record.bin.crossline,
                nx: grid.nx,
                ny: grid.ny,
            });
        }

        if self.current.as_ref().is_some_and(ChunkWriter::is_full) {
            if let Some(full) = self.current.take() {
                full.flush()?;
            }
        }
        let chunk = match self.current.take() {
            Some(chunk) => chunk,
            None => {
                let number = (self.record_count / self.layout.capacity) as u32;
                debug!(chunk = number, "allocating store chunk");
                ChunkWriter::create(&self.dir.join(chunk_file_name(number)), number, self.layout)?
            }
        };
        let chunk = self.current.insert(chunk);

        chunk.push(record);
        self.index.insert(grid.linear(record.bin), chunk.number);
        self.record_count += 1;
        Ok(())
    }

    /// Make every appended record durable and visible to resumption
    pub fn commit(&mut self) -> Result<u64, StoreError> {
        if let Some(chunk) = &self.current {
            chunk.flush()?;
        }
        self.manifest.record_count = self.record_count;
        self.manifest.chunk_count =
            StoreManifest::chunks_for(self.record_count, self.manifest.chunk_records);
        self.manifest.write(&self.dir)?;
        debug!(records = self.record_count, "committed store");
        Ok(self.record_count)
    }

    /// Commit and leave the store resumable
    pub fn suspend(mut self) -> Result<u64, StoreError> {
        let committed = self.commit()?;
        self.manifest.state = StoreState::Suspended;
        self.manifest.write(&self.dir)?;
        info!(records = committed, "suspended analysis store");
        Ok(committed)
    }

    /// Commit, persist the bin index and mark the store read-only
    pub fn finish(mut self) -> Result<StoreManifest, StoreError> {
        self.commit()?;
        self.index.write(&self.dir.join(INDEX_FILE))?;
        remove_if_exists(&self.dir.join(CHECKPOINT_FILE))?;
        self.manifest.state = StoreState::Complete;
        self.manifest.write(&self.dir)?;
        info!(
            records = self.manifest.record_count,
            chunks = self.manifest.chunk_count,
            bins = self.index.bin_count(),
            "analysis store complete"
        );
        Ok(self.manifest)
    }

    /// Mark the store incomplete; committed records stay on disk
    pub fn abort(mut self, reason: &str) {
        error!(dir = %self.dir.display(), reason, "aborting analysis store");
        self.manifest.state = StoreState::Incomplete {
            reason: reason.to_string(),
        };
        if let Err(e) = self.manifest.write(&self.dir) {
            error!(error = %e, "failed to mark analysis store incomplete");
        }
    }
}

/// Read-only access to a complete store.
#[derive(Debug)]
pub struct AnalysisStore {
    dir: PathBuf,
    manifest: StoreManifest,
    layout: ColumnLayout,
    index: BinIndex,
    _lock: ReadLock,
}

impl AnalysisStore {
    /// Open a complete store with a valid persisted index
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let lock = ReadLock::acquire(dir)?;
        let manifest = Self::complete_manifest(dir)?;
        let index = BinIndex::read(
            &dir.join(INDEX_FILE),
            manifest.record_count,
            manifest.chunk_count,
        )?;
        Ok(Self {
            dir: dir.to_path_buf(),
            layout: ColumnLayout::new(manifest.chunk_records),
            manifest,
            index,
            _lock: lock,
        })
    }

    /// Open a store only if it was produced by the run `fingerprint` names
    pub fn open_matching(dir: &Path, fingerprint: &str) -> Result<Self, StoreError> {
        let store = Self::open_or_rebuild(dir)?;
        if store.manifest.fingerprint != fingerprint {
            return Err(StoreError::Stale {
                expected: fingerprint.to_string(),
                found: store.manifest.fingerprint,
            });
        }
        Ok(store)
    }

    /// Open, rebuilding the index when it is missing or does not match
    pub fn open_or_rebuild(dir: &Path) -> Result<Self, StoreError> {
        match Self::open(dir) {
            Err(StoreError::IndexMismatch { indexed, records }) => {
                warn!(indexed, records, "bin index does not match store, rebuilding");
            }
            Err(StoreError::IndexCorrupt(reason)) => {
                warn!(%reason, "bin index is corrupt, rebuilding");
            }
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("bin index is missing, rebuilding");
            }
            other => return other,
        }
        Self::rebuild_index(dir)?;
        Self::open(dir)
    }

    /// Recompute the bin index by scanning every chunk
    pub fn rebuild_index(dir: &Path) -> Result<BinIndex, StoreError> {
        if WriteLock::is_held(dir) {
            return Err(StoreError::Locked(dir.to_path_buf()));
        }
        let manifest = Self::complete_manifest(dir)?;
        let layout = ColumnLayout::new(manifest.chunk_records);

        let per_chunk: Vec<Vec<u64>> = (0..manifest.chunk_count)
            .into_par_iter()
            .map(|number| -> Result<Vec<u64>, StoreError> {
                let len = rows_in_chunk(manifest.record_count, manifest.chunk_records, number);
                let reader = ChunkReader::open(&dir.join(chunk_file_name(number)), layout, len)?;
                Ok((0..reader.len())
                    .map(|row| manifest.grid.linear(reader.bin(row)))
                    .collect())
            })
            .collect::<Result<_, _>>()?;

        let mut index = BinIndex::new();
        for (number, bins) in per_chunk.into_iter().enumerate() {
            for bin in bins {
                index.insert(bin, number as u32);
            }
        }
        index.write(&dir.join(INDEX_FILE))?;
        info!(
            records = index.record_count(),
            bins = index.bin_count(),
            "rebuilt bin index"
        );
        Ok(index)
    }

    /// Current state of the store in `dir`
    pub fn state(dir: &Path) -> Result<StoreState, StoreError> {
        Ok(StoreManifest::read(dir)?.state)
    }

    /// Delete the store; refuses while a writer or any reader holds it
    pub fn invalidate(dir: &Path) -> Result<(), StoreError> {
        if !dir.exists() {
            return Ok(());
        }
        if WriteLock::is_held(dir) {
            return Err(StoreError::Locked(dir.to_path_buf()));
        }
        ReadLock::ensure_none(dir)?;
        fs::remove_dir_all(dir)?;
        info!(dir = %dir.display(), "invalidated analysis store");
        Ok(())
    }

    /// Remove writer and reader locks left by dead processes. Returns
    /// whether any lock was removed.
    pub fn break_lock(dir: &Path) -> Result<bool, StoreError> {
        let writer = WriteLock::break_stale(dir)?;
        let readers = ReadLock::break_stale(dir)?;
        if readers > 0 {
            warn!(dir = %dir.display(), readers, "removed reader locks");
        }
        Ok(writer || readers > 0)
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    pub fn record_count(&self) -> u64 {
        self.manifest.record_count
    }

    pub fn grid(&self) -> &BinGrid {
        &self.manifest.grid
    }

    pub fn fingerprint(&self) -> &str {
        &self.manifest.fingerprint
    }

    /// All records of one bin, in append order
    pub fn records_in_bin(&self, address: BinAddress) -> Result<Vec<TraceRecord>, StoreError> {
        self.check_bin(address)?;
        self.verify()?;
        let bin = self.manifest.grid.linear(address);
        self.collect(self.index.chunks_for(bin).to_vec(), |b| b == address)
    }

    /// Records of every bin in the row running along x at `crossline`
    pub fn records_in_inline(&self, crossline: u32) -> Result<Vec<TraceRecord>, StoreError> {
        let grid = self.manifest.grid;
        self.check_bin(BinAddress::new(0, crossline))?;
        self.verify()?;
        let bins = (0..grid.nx).map(|i| grid.linear(BinAddress::new(i, crossline)));
        self.collect(self.index.chunks_for_bins(bins), |b| b.crossline == crossline)
    }

    /// Records of every bin in the column running along y at `inline`
    pub fn records_in_crossline(&self, inline: u32) -> Result<Vec<TraceRecord>, StoreError> {
        let grid = self.manifest.grid;
        self.check_bin(BinAddress::new(inline, 0))?;
        self.verify()?;
        let bins = (0..grid.ny).map(|j| grid.linear(BinAddress::new(inline, j)));
        self.collect(self.index.chunks_for_bins(bins), |b| b.inline == inline)
    }

    /// Visit every record in append order, one chunk mapped at a time
    pub fn scan(&self, mut visit: impl FnMut(&TraceRecord)) -> Result<(), StoreError> {
        self.verify()?;
        for number in 0..self.manifest.chunk_count {
            let reader = self.reader(number)?;
            for row in 0..reader.len() {
                visit(&reader.record(row));
            }
        }
        self.verify()
    }

    /// Fail unless the directory still holds the store that was opened
    pub fn verify(&self) -> Result<(), StoreError> {
        let changed = |current: u64, state: String| StoreError::Changed {
            opened: self.manifest.generation,
            current,
            state,
        };
        let current = match StoreManifest::read(&self.dir) {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => return Err(changed(0, "removed".into())),
            Err(e) => return Err(e),
        };
        if current.generation != self.manifest.generation
            || current.fingerprint != self.manifest.fingerprint
            || current.record_count != self.manifest.record_count
            || current.state != StoreState::Complete
        {
            return Err(changed(current.generation, current.state.to_string()));
        }
        Ok(())
    }

    fn collect(
        &self,
        chunks: Vec<u32>,
        keep: impl Fn(BinAddress) -> bool,
    ) -> Result<Vec<TraceRecord>, StoreError> {
        let mut records = Vec::new();
        for number in chunks {
            let reader = self.reader(number)?;
            for row in 0..reader.len() {
                if keep(reader.bin(row)) {
                    records.push(reader.record(row));
                }
            }
        }
        self.verify()?;
        Ok(records)
    }

    fn reader(&self, number: u32) -> Result<ChunkReader, StoreError> {
        let len = rows_in_chunk(
            self.manifest.record_count,
            self.manifest.chunk_records,
            number,
        );
        Ok(ChunkReader::open(
            &self.dir.join(chunk_file_name(number)),
            self.layout,
            len,
        )?)
    }

    fn check_bin(&self, address: BinAddress) -> Result<(), StoreError> {
        let grid = &self.manifest.grid;
        if grid.contains(address) {
            Ok(())
        } else {
            Err(StoreError::BinOutOfRange {
                inline: address.inline,
                crossline: address.crossline,
                nx: grid.nx,
                ny: grid.ny,
            })
        }
    }

    fn complete_manifest(dir: &Path) -> Result<StoreManifest, StoreError> {
        let manifest = StoreManifest::read(dir)?;
        if manifest.state != StoreState::Complete {
            return Err(StoreError::NotComplete {
                state: manifest.state.to_string(),
            });
        }
        Ok(manifest)
    }
}

fn rows_in_chunk(record_count: u64, chunk_records: u64, number: u32) -> u64 {
    let start = number as u64 * chunk_records;
    record_count.saturating_sub(start).min(chunk_records)
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete chunk files numbered `first` and above
fn remove_chunks_from(dir: &Path, first: u32) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(number) = name
            .to_str()
            .and_then(|n| n.strip_prefix("chunk-"))
            .and_then(|n| n.strip_suffix(".dat"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if number >= first {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Coord, Rect};
    use crate::trace::{PointId, TraceFlags};

    fn grid() -> BinGrid {
        BinGrid::covering(&Rect::new(0.0, 0.0, 40.0, 40.0), 10.0, 10.0)
    }

    fn record(n: u32) -> TraceRecord {
        let bin = BinAddress::new(n % 4, (n / 4) % 4);
        TraceRecord {
            bin,
            src_id: PointId::new(1, 1000, n as i32),
            rec_id: PointId::new(1, 2000, n as i32),
            src: Coord::new(0.0, 0.0),
            rec: Coord::new(n as f64, 0.0),
            cmp: Coord::new(n as f64 / 2.0, 0.0),
            offset: n as f64,
            azimuth: Some(0.0),
            twt_ms: 0.0,
            flags: TraceFlags::ACTIVE | TraceFlags::UNIQUE,
        }
    }

    fn write_store(dir: &Path, count: u32) -> StoreManifest {
        let mut writer = StoreWriter::create(dir, "fp", grid(), 8).unwrap();
        for n in 0..count {
            writer.append(&record(n)).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_store(dir.path(), 40);
        assert_eq!(manifest.record_count, 40);
        assert_eq!(manifest.chunk_count, 5);
        assert!(!WriteLock::is_held(dir.path()));

        let store = AnalysisStore::open(dir.path()).unwrap();
        let in_bin = store.records_in_bin(BinAddress::new(1, 0)).unwrap();
        let offsets: Vec<f64> = in_bin.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1.0, 17.0, 33.0]);

        let row = store.records_in_inline(2).unwrap();
        assert_eq!(row.len(), 8);
        assert!(row.iter().all(|r| r.bin.crossline == 2));

        let column = store.records_in_crossline(3).unwrap();
        assert_eq!(column.len(), 10);
        assert!(column.iter().all(|r| r.bin.inline == 3));

        let mut scanned = Vec::new();
        store.scan(|r| scanned.push(r.offset as u32)).unwrap();
        assert_eq!(scanned, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_range_query() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), 4);
        let store = AnalysisStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.records_in_bin(BinAddress::new(4, 0)),
            Err(StoreError::BinOutOfRange { .. })
        ));
    }

    #[test]
    fn test_writing_store_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(dir.path(), "fp", grid(), 8).unwrap();
        writer.append(&record(0)).unwrap();
        writer.commit().unwrap();

        assert!(matches!(
            AnalysisStore::open(dir.path()),
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(
            StoreWriter::create(dir.path(), "fp", grid(), 8),
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(
            AnalysisStore::invalidate(dir.path()),
            Err(StoreError::Locked(_))
        ));

        writer.suspend().unwrap();
        assert!(matches!(
            AnalysisStore::open(dir.path()),
            Err(StoreError::NotComplete { .. })
        ));
    }

    #[test]
    fn test_abort_marks_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(dir.path(), "fp", grid(), 8).unwrap();
        writer.append(&record(0)).unwrap();
        writer.abort("disk full");

        assert_eq!(
            AnalysisStore::state(dir.path()).unwrap(),
            StoreState::Incomplete {
                reason: "disk full".into()
            }
        );
        assert!(AnalysisStore::open(dir.path()).is_err());
        assert!(matches!(
            StoreWriter::resume(dir.path(), "fp", 0),
            Err(StoreError::Resume(_))
        ));
    }

    #[test]
    fn test_open_reader_blocks_new_run() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), 4);
        let store = AnalysisStore::open(dir.path()).unwrap();
        let bin = BinAddress::new(1, 0);
        let before = store.records_in_bin(bin).unwrap();

        assert!(matches!(
            StoreWriter::create(dir.path(), "next", grid(), 8),
            Err(StoreError::InUse { readers: 1, .. })
        ));
        assert!(matches!(
            AnalysisStore::invalidate(dir.path()),
            Err(StoreError::InUse { .. })
        ));
        // The refused writer left the store untouched.
        assert!(!WriteLock::is_held(dir.path()));
        assert_eq!(store.records_in_bin(bin).unwrap(), before);
        assert_eq!(store.fingerprint(), "fp");

        drop(store);
        assert!(StoreWriter::create(dir.path(), "next", grid(), 8).is_ok());
    }

    #[test]
    fn test_rewritten_store_fails_open_reader() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), 4);
        let store = AnalysisStore::open(dir.path()).unwrap();

        // Breaking the locks lets a new run start underneath the reader.
        assert!(AnalysisStore::break_lock(dir.path()).unwrap());
        let mut writer = StoreWriter::create(dir.path(), "next", grid(), 8).unwrap();
        let mut replacement = record(1);
        replacement.offset = 999.0;
        writer.append(&replacement).unwrap();
        writer.commit().unwrap();

        assert!(matches!(
            store.records_in_bin(BinAddress::new(1, 0)),
            Err(StoreError::Changed { opened: 1, current: 2, .. })
        ));
        assert!(matches!(store.scan(|_| {}), Err(StoreError::Changed { .. })));

        writer.finish().unwrap();
        // Still a different generation after the new run completes.
        assert!(store.verify().is_err());
        let reopened = AnalysisStore::open(dir.path()).unwrap();
        assert_eq!(reopened.fingerprint(), "next");
        assert_eq!(reopened.manifest().generation, 2);
    }

    #[test]
    fn test_resume_truncates_to_committed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(dir.path(), "fp", grid(), 8).unwrap();
        for n in 0..11 {
            writer.append(&record(n)).unwrap();
        }
        writer.commit().unwrap();
        for n in 11..20 {
            writer.append(&record(n)).unwrap();
        }
        // A checkpoint taken at 11 records discards the later appends on resume.
        writer.suspend().unwrap();

        let mut writer = StoreWriter::resume(dir.path(), "fp", 11).unwrap();
        assert_eq!(writer.record_count(), 11);
        for n in 11..20 {
            writer.append(&record(n)).unwrap();
        }
        writer.finish().unwrap();

        let store = AnalysisStore::open(dir.path()).unwrap();
        let mut scanned = Vec::new();
        store.scan(|r| scanned.push(r.offset as u32)).unwrap();
        assert_eq!(scanned, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_resume_rejects_other_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StoreWriter::create(dir.path(), "fp", grid(), 8).unwrap();
        writer.suspend().unwrap();
        assert!(matches!(
            StoreWriter::resume(dir.path(), "other", 0),
            Err(StoreError::Stale { .. })
        ));
    }

    #[test]
    fn test_missing_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), 25);
        fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        assert!(AnalysisStore::open(dir.path()).is_err());
        let store = AnalysisStore::open_or_rebuild(dir.path()).unwrap();
        assert_eq!(store.records_in_bin(BinAddress::new(0, 0)).unwrap().len(), 2);
        assert!(AnalysisStore::open(dir.path()).is_ok());
    }

    #[test]
    fn test_open_matching_detects_stale_store() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), 3);
        assert!(AnalysisStore::open_matching(dir.path(), "fp").is_ok());
        assert!(matches!(
            AnalysisStore::open_matching(dir.path(), "changed"),
            Err(StoreError::Stale { .. })
        ));
        AnalysisStore::invalidate(dir.path()).unwrap();
        assert!(!dir.path().exists());
    }
}
