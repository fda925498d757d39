//! Background binning runs: cancellation, pause, checkpoints and a worker
//! thread that streams progress over a channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use constants::store::STORE_FORMAT_VERSION;

use crate::aggregates::AggregateSnapshot;
use crate::binning::{BinningEngine, BinningMode, Progress, RunCursor, RunOutcome, RunStats};
use crate::error::BinningError;

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Cancellation and pause flags shared between a run and its owner.
/// Both are observed at quantum boundaries only.
#[derive(Debug, Default)]
pub struct RunControl {
    token: CancellationToken,
    paused: Mutex<bool>,
    wake: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing cancellation token, e.g. a parent's child token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        let _paused = self.paused.lock();
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
        debug!("binning run paused");
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.wake.notify_all();
        debug!("binning run resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Block while paused. Returns true when the run should stop.
    pub fn checkpoint(&self) -> bool {
        let mut paused = self.paused.lock();
        // The token may be cancelled from a clone that cannot signal us.
        while *paused && !self.token.is_cancelled() {
            self.wake.wait_for(&mut paused, PAUSE_POLL);
        }
        self.token.is_cancelled()
    }
}

/// Everything needed to resume a cancelled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub fingerprint: String,
    pub mode: BinningMode,
    pub cursor: RunCursor,
    pub aggregates: AggregateSnapshot,
    pub stats: RunStats,
    /// Store records durable at the time of cancellation
    pub records_committed: u64,
}

impl Checkpoint {
    pub fn new(
        fingerprint: &str,
        mode: BinningMode,
        cursor: RunCursor,
        aggregates: AggregateSnapshot,
        stats: RunStats,
        records_committed: u64,
    ) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            fingerprint: fingerprint.to_string(),
            mode,
            cursor,
            aggregates,
            stats,
            records_committed,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BinningError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), instances_done = self.cursor.instances_done, "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BinningError> {
        let checkpoint: Checkpoint = serde_json::from_slice(&fs::read(path)?)?;
        if checkpoint.version != STORE_FORMAT_VERSION {
            return Err(BinningError::CheckpointMismatch {
                expected: format!("format version {}", STORE_FORMAT_VERSION),
                found: format!("format version {}", checkpoint.version),
            });
        }
        Ok(checkpoint)
    }

    /// Load and check that the checkpoint belongs to `fingerprint`
    pub fn load_matching(path: &Path, fingerprint: &str) -> Result<Self, BinningError> {
        let checkpoint = Self::load(path)?;
        if checkpoint.fingerprint != fingerprint {
            return Err(BinningError::CheckpointMismatch {
                expected: fingerprint.to_string(),
                found: checkpoint.fingerprint,
            });
        }
        Ok(checkpoint)
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: BinningMode,
    /// Analysis store directory, required in full mode
    pub store_dir: Option<PathBuf>,
    pub resume: Option<Checkpoint>,
}

impl RunRequest {
    pub fn basic() -> Self {
        Self {
            mode: BinningMode::Basic,
            store_dir: None,
            resume: None,
        }
    }

    pub fn full(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: BinningMode::Full,
            store_dir: Some(store_dir.into()),
            resume: None,
        }
    }

    pub fn resuming(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }
}

/// A binning run on its own thread.
pub struct BinningTask {
    control: Arc<RunControl>,
    progress: Receiver<Progress>,
    handle: JoinHandle<Result<RunOutcome, BinningError>>,
}

impl BinningTask {
    pub fn spawn(engine: Arc<BinningEngine>, request: RunRequest) -> Result<Self, BinningError> {
        Self::spawn_with(engine, request, RunControl::new())
    }

    pub fn spawn_with(
        engine: Arc<BinningEngine>,
        request: RunRequest,
        control: RunControl,
    ) -> Result<Self, BinningError> {
        let control = Arc::new(control);
        let (sender, progress) = unbounded();
        let worker_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name("binning".to_string())
            .spawn(move || engine.run(&request, &worker_control, &sender))?;

        Ok(Self {
            control,
            progress,
            handle,
        })
    }

    /// Progress reports; disconnects when the run ends
    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<RunOutcome, BinningError> {
        self.handle
            .join()
            .map_err(|_| BinningError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Rect;
    use crate::config::BinningConfig;
    use crate::geometry::{Block, Role, Seed, SurveyGeometry, Template};
    use crate::points::PointEdits;

    fn engine() -> Arc<BinningEngine> {
        let geometry = SurveyGeometry::new("line").with_block(
            Block::new("B").with_template(
                Template::new("T")
                    .with_roll(20, 50.0, 0.0)
                    .with_seed(Seed::new("s", Role::Source, 0.0, 50.0))
                    .with_seed(Seed::new("r", Role::Receiver, 0.0, 0.0).with_grow(12, 50.0, 0.0)),
            ),
        );
        let mut config = BinningConfig::new(Rect::new(0.0, 0.0, 1600.0, 100.0), 25.0, 25.0);
        config.quantum.instances = 1;
        Arc::new(BinningEngine::new(geometry, config, PointEdits::new()).unwrap())
    }

    #[test]
    fn test_checkpoint_releases_when_not_paused() {
        let control = RunControl::new();
        assert!(!control.checkpoint());
        control.cancel();
        assert!(control.checkpoint());
    }

    #[test]
    fn test_cancel_wakes_paused_run() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.checkpoint())
        };
        thread::sleep(Duration::from_millis(20));
        control.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_token_clone_cancels_paused_run() {
        let control = Arc::new(RunControl::new());
        let token = control.token();
        control.pause();
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.checkpoint())
        };
        token.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_task_completes_and_reports_progress() {
        let engine = engine();
        let task = BinningTask::spawn(Arc::clone(&engine), RunRequest::basic()).unwrap();
        let reports: Vec<Progress> = task.progress().iter().collect();

        let RunOutcome::Completed(result) = task.join().unwrap() else {
            panic!("run was not cancelled");
        };
        assert_eq!(result.aggregates.digest(), engine.run_basic().unwrap().aggregates.digest());
        assert!(reports.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(reports.last().map(|p| p.fraction), Some(1.0));
    }

    #[test]
    fn test_cancelled_before_start_returns_checkpoint() {
        let engine = engine();
        let control = RunControl::new();
        control.cancel();
        let task = BinningTask::spawn_with(engine, RunRequest::basic(), control).unwrap();
        let RunOutcome::Cancelled(checkpoint) = task.join().unwrap() else {
            panic!("run should stop at the first quantum boundary");
        };
        assert_eq!(checkpoint.cursor.instances_done, 1);
        assert_eq!(checkpoint.records_committed, 0);
    }

    #[test]
    fn test_checkpoint_file_roundtrip_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let engine = engine();
        let control = RunControl::new();
        control.cancel();
        let RunOutcome::Cancelled(checkpoint) = engine
            .run(&RunRequest::basic(), &control, &crate::binning::NoProgress)
            .unwrap()
        else {
            panic!("expected cancellation");
        };

        checkpoint.save(&path).unwrap();
        assert_eq!(Checkpoint::load_matching(&path, engine.fingerprint()).unwrap(), checkpoint);
        assert!(matches!(
            Checkpoint::load_matching(&path, "other"),
            Err(BinningError::CheckpointMismatch { .. })
        ));
    }
}
