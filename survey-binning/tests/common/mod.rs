#![allow(dead_code)]

use std::cell::Cell;
use std::path::Path;

use survey_binning::{
    BinningConfig, BinningEngine, Block, Checkpoint, PointEdits, Progress, ProgressSink, Rect,
    Role, RunControl, RunOutcome, RunRequest, Seed, SurveyGeometry, Template, TraceRecord,
    AnalysisStore, BinningResult, UniqueFold,
};

/// Orthogonal patch rolled over a 3 x 4 lattice, plus a repeated infill
/// template that shoots the same pairs again.
pub fn orthogonal() -> SurveyGeometry {
    let patch = Template::new("patch")
        .with_roll(3, 0.0, 200.0)
        .with_roll(4, 200.0, 0.0)
        .with_seed(
            Seed::new("rec", Role::Receiver, 0.0, 0.0)
                .with_grow(4, 0.0, 200.0)
                .with_grow(16, 50.0, 0.0),
        )
        .with_seed(Seed::new("src", Role::Source, 375.0, 25.0).with_grow(4, 0.0, 50.0));
    let infill = Template::new("infill")
        .with_seed(
            Seed::new("rec", Role::Receiver, 0.0, 0.0)
                .with_grow(4, 0.0, 200.0)
                .with_grow(16, 50.0, 0.0),
        )
        .with_seed(Seed::new("src", Role::Source, 375.0, 25.0).with_grow(2, 0.0, 50.0));

    SurveyGeometry::new("orthogonal").with_block(
        Block::new("main")
            .with_borders(
                Some(Rect::new(0.0, 0.0, 1400.0, 1000.0)),
                Some(Rect::new(0.0, 0.0, 1300.0, 1200.0)),
            )
            .with_template(patch)
            .with_template(infill),
    )
}

pub fn config() -> BinningConfig {
    let mut config = BinningConfig::new(Rect::new(0.0, 0.0, 1600.0, 1400.0), 25.0, 25.0);
    config.quantum.instances = 1;
    config.chunk_records = 256;
    config.unique_fold = UniqueFold::Pairs;
    config
}

pub fn engine() -> BinningEngine {
    BinningEngine::new(orthogonal(), config(), PointEdits::new()).unwrap()
}

/// Cancels its run on the n-th progress report.
pub struct CancelAfter<'a> {
    control: &'a RunControl,
    after: usize,
    seen: Cell<usize>,
}

impl<'a> CancelAfter<'a> {
    pub fn new(control: &'a RunControl, after: usize) -> Self {
        Self {
            control,
            after,
            seen: Cell::new(0),
        }
    }
}

impl ProgressSink for CancelAfter<'_> {
    fn report(&self, _progress: Progress) {
        let seen = self.seen.get() + 1;
        self.seen.set(seen);
        if seen == self.after {
            self.control.cancel();
        }
    }
}

/// Run `request` to completion, cancelling every `every` quanta and
/// resuming from the checkpoint each time. Returns the result and the
/// number of interruptions.
pub fn run_interrupted(
    engine: &BinningEngine,
    request: RunRequest,
    every: usize,
    checkpoint_file: Option<&Path>,
) -> (BinningResult, usize) {
    let mut interruptions = 0;
    let mut next = request.clone();
    loop {
        let control = RunControl::new();
        let sink = CancelAfter::new(&control, every);
        match engine.run(&next, &control, &sink).unwrap() {
            RunOutcome::Completed(result) => return (result, interruptions),
            RunOutcome::Cancelled(checkpoint) => {
                interruptions += 1;
                let checkpoint = match checkpoint_file {
                    Some(path) => Checkpoint::load_matching(path, engine.fingerprint()).unwrap(),
                    None => checkpoint,
                };
                next = request.clone().resuming(checkpoint);
            }
        }
    }
}

pub fn store_records(dir: &Path) -> Vec<TraceRecord> {
    let store = AnalysisStore::open(dir).unwrap();
    let mut records = Vec::new();
    store.scan(|r| records.push(*r)).unwrap();
    records
}
