mod common;

use std::sync::Arc;

use constants::store::CHECKPOINT_FILE;
use survey_binning::{
    AnalysisStore, BinningError, BinningMode, BinningTask, NoProgress, RunControl, RunOutcome,
    RunRequest, StoreError, StoreState,
};

#[test]
fn test_basic_resume_matches_uninterrupted_run() {
    let engine = common::engine();
    let uninterrupted = engine.run_basic().unwrap();

    let (resumed, interruptions) = common::run_interrupted(&engine, RunRequest::basic(), 3, None);
    assert!(interruptions >= 3);
    assert_eq!(resumed.aggregates.to_bytes(), uninterrupted.aggregates.to_bytes());
    assert_eq!(resumed.stats, uninterrupted.stats);
}

#[test]
fn test_full_resume_matches_uninterrupted_run() {
    let engine = common::engine();
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = match engine
        .run(&RunRequest::full(reference_dir.path()), &RunControl::new(), &NoProgress)
        .unwrap()
    {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled(_) => panic!("run was not cancelled"),
    };

    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join(CHECKPOINT_FILE);
    let (resumed, interruptions) =
        common::run_interrupted(&engine, RunRequest::full(dir.path()), 2, Some(&checkpoint));

    assert!(interruptions >= 5);
    assert_eq!(resumed.aggregates.to_bytes(), reference.aggregates.to_bytes());
    assert_eq!(resumed.store_records, reference.store_records);
    assert_eq!(
        common::store_records(dir.path()),
        common::store_records(reference_dir.path())
    );
    assert!(!checkpoint.exists());
}

#[test]
fn test_cancelled_store_is_suspended_and_unreadable() {
    let engine = common::engine();
    let dir = tempfile::tempdir().unwrap();
    let control = RunControl::new();
    let sink = common::CancelAfter::new(&control, 4);

    let RunOutcome::Cancelled(checkpoint) = engine
        .run(&RunRequest::full(dir.path()), &control, &sink)
        .unwrap()
    else {
        panic!("expected cancellation");
    };
    assert_eq!(checkpoint.mode, BinningMode::Full);
    assert_eq!(checkpoint.cursor.instances_done, 4);
    assert!(checkpoint.records_committed > 0);
    assert_eq!(AnalysisStore::state(dir.path()).unwrap(), StoreState::Suspended);
    assert!(matches!(
        AnalysisStore::open(dir.path()),
        Err(StoreError::NotComplete { .. })
    ));
    assert!(dir.path().join(CHECKPOINT_FILE).exists());
}

#[test]
fn test_checkpoint_from_other_geometry_rejected() {
    let engine = common::engine();
    let control = RunControl::new();
    let sink = common::CancelAfter::new(&control, 1);
    let RunOutcome::Cancelled(mut checkpoint) =
        engine.run(&RunRequest::basic(), &control, &sink).unwrap()
    else {
        panic!("expected cancellation");
    };

    checkpoint.fingerprint = "0".repeat(64);
    let result = engine.run(
        &RunRequest::basic().resuming(checkpoint),
        &RunControl::new(),
        &NoProgress,
    );
    assert!(matches!(result, Err(BinningError::CheckpointMismatch { .. })));
}

#[test]
fn test_paused_task_resumes_and_completes() {
    let engine = Arc::new(common::engine());
    let control = RunControl::new();
    control.pause();
    let task = BinningTask::spawn_with(Arc::clone(&engine), RunRequest::basic(), control).unwrap();

    // Paused at the first quantum boundary.
    let first = task.progress().recv().unwrap();
    assert!(first.fraction < 1.0);
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(!task.is_finished());

    task.resume();
    let RunOutcome::Completed(result) = task.join().unwrap() else {
        panic!("run was not cancelled");
    };
    assert_eq!(result.aggregates.digest(), engine.run_basic().unwrap().aggregates.digest());
}
