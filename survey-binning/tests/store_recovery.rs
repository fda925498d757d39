mod common;

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use constants::store::{chunk_file_name, INDEX_FILE};
use survey_binning::{
    AnalysisStore, BinningError, NoProgress, Progress, ProgressSink, RunControl, RunOutcome,
    RunRequest, StoreError, StoreState,
};

fn complete_store(dir: &Path) -> u64 {
    match common::engine()
        .run(&RunRequest::full(dir), &RunControl::new(), &NoProgress)
        .unwrap()
    {
        RunOutcome::Completed(result) => result.stats.traces_accepted,
        RunOutcome::Cancelled(_) => panic!("run was not cancelled"),
    }
}

/// After the first commit, blocks every chunk file the writer has not
/// allocated yet so the next allocation fails mid-run.
struct BlockNextChunks<'a> {
    dir: &'a Path,
}

impl ProgressSink for BlockNextChunks<'_> {
    fn report(&self, _progress: Progress) {
        for number in 0..256 {
            let path = self.dir.join(chunk_file_name(number));
            if !path.exists() {
                fs::create_dir_all(path).unwrap();
            }
        }
    }
}

#[test]
fn test_failed_append_aborts_store_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let sink = BlockNextChunks { dir: dir.path() };
    let err = common::engine()
        .run(&RunRequest::full(dir.path()), &RunControl::new(), &sink)
        .unwrap_err();
    assert!(matches!(err, BinningError::Store(StoreError::Io(_))));

    match AnalysisStore::state(dir.path()).unwrap() {
        StoreState::Incomplete { reason } => {
            assert!(!reason.is_empty());
            assert_eq!(reason, err.to_string());
        }
        other => panic!("expected an incomplete store, found {other}"),
    }
    assert!(matches!(
        AnalysisStore::open(dir.path()),
        Err(StoreError::NotComplete { .. })
    ));
    assert!(AnalysisStore::open_or_rebuild(dir.path()).is_err());
}

#[test]
fn test_tampered_index_count_is_detected_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let records = complete_store(dir.path());

    let mut index = fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join(INDEX_FILE))
        .unwrap();
    index.seek(SeekFrom::Start(8)).unwrap();
    index.write_all(&(records + 7).to_le_bytes()).unwrap();
    drop(index);

    assert!(matches!(
        AnalysisStore::open(dir.path()),
        Err(StoreError::IndexMismatch { .. })
    ));

    let store = AnalysisStore::open_or_rebuild(dir.path()).unwrap();
    assert_eq!(store.record_count(), records);
    // The rebuilt index is persisted.
    assert!(AnalysisStore::open(dir.path()).is_ok());
}

#[test]
fn test_missing_index_is_rebuilt_with_same_answers() {
    let dir = tempfile::tempdir().unwrap();
    complete_store(dir.path());
    let before = AnalysisStore::open(dir.path()).unwrap();
    let bin = before
        .grid()
        .address(600.0, 300.0)
        .unwrap();
    let expected = before.records_in_bin(bin).unwrap();
    assert!(!expected.is_empty());
    drop(before);

    fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();
    let rebuilt = AnalysisStore::open_or_rebuild(dir.path()).unwrap();
    assert_eq!(rebuilt.records_in_bin(bin).unwrap(), expected);
}

#[test]
fn test_line_queries_cover_bin_queries() {
    let dir = tempfile::tempdir().unwrap();
    complete_store(dir.path());
    let store = AnalysisStore::open(dir.path()).unwrap();
    let grid = *store.grid();

    let row = store.records_in_inline(12).unwrap();
    let by_bins: usize = (0..grid.nx)
        .map(|i| store.records_in_bin(survey_binning::BinAddress::new(i, 12)).unwrap().len())
        .sum();
    assert_eq!(row.len(), by_bins);
    assert!(row.iter().all(|r| r.bin.crossline == 12));

    let column = store.records_in_crossline(20).unwrap();
    assert!(column.iter().all(|r| r.bin.inline == 20));
}

#[test]
fn test_invalidate_removes_store() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("survey.store");
    complete_store(&store_dir);
    AnalysisStore::invalidate(&store_dir).unwrap();
    assert!(!store_dir.exists());
    assert!(matches!(
        AnalysisStore::open(&store_dir),
        Err(StoreError::NotFound(_))
    ));
}
