//! Pairing of source and receiver points into binned traces.
//!
//! Iteration order is block, template, roll index, seed, grow index. Within
//! one template instance every accepted source is paired with every
//! accepted receiver, sources outermost. The order fixes both the bin
//! aggregates and the record order of the analysis store, and the position
//! after each template instance is the resumption cursor.

use std::time::Instant;

use constants::store::CHECKPOINT_FILE;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::aggregates::{BinAggregates, FoldSummary};
use crate::bounds::Extent;
use crate::config::{BinningConfig, FullModeEstimate};
use crate::error::BinningError;
use crate::geometry::{Block, Role, SurveyGeometry, Template, hex_digest};
use crate::grid::BinGrid;
use crate::lattice::{LatticePoint, MultiIndex, RollInstance, RollOffsets, seed_points};
use crate::points::PointEdits;
use crate::run::{Checkpoint, RunControl, RunRequest};
use crate::store::StoreWriter;
use crate::trace::{SurveyPoint, TraceFlags, TraceGeometry, TraceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinningMode {
    /// Bin aggregates only
    Basic,
    /// Aggregates plus every trace in the analysis store
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completed template instances over all instances, in [0, 1]
    pub fraction: f64,
    pub message: String,
}

pub trait ProgressSink {
    fn report(&self, progress: Progress);
}

/// Discards progress reports.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: Progress) {}
}

impl ProgressSink for crossbeam_channel::Sender<Progress> {
    fn report(&self, progress: Progress) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(progress);
    }
}

/// Position after the last fully binned template instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCursor {
    pub block: usize,
    pub template: usize,
    pub roll: MultiIndex,
    pub instances_done: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Points placed, counted once per template instance
    pub source_points: u64,
    pub receiver_points: u64,
    pub points_clipped: u64,
    pub points_inactive: u64,
    pub pairs_considered: u64,
    pub pairs_outside_limits: u64,
    pub pairs_outside_grid: u64,
    /// Pairs with no reflection within the accepted angles
    pub pairs_no_reflection: u64,
    pub traces_accepted: u64,
    pub source_extent: Extent,
    pub receiver_extent: Extent,
    pub cmp_extent: Extent,
}

impl RunStats {
    pub fn merge(&mut self, other: &RunStats) {
        self.source_points += other.source_points;
        self.receiver_points += other.receiver_points;
        self.points_clipped += other.points_clipped;
        self.points_inactive += other.points_inactive;
        self.pairs_considered += other.pairs_considered;
        self.pairs_outside_limits += other.pairs_outside_limits;
        self.pairs_outside_grid += other.pairs_outside_grid;
        self.pairs_no_reflection += other.pairs_no_reflection;
        self.traces_accepted += other.traces_accepted;
        self.source_extent.merge(&other.source_extent);
        self.receiver_extent.merge(&other.receiver_extent);
        self.cmp_extent.merge(&other.cmp_extent);
    }
}

/// Up-front totals for progress reporting and cost warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub blocks: usize,
    pub templates: usize,
    pub instances: u64,
    pub source_points: u64,
    pub receiver_points: u64,
    pub max_traces: u64,
    pub bins: u64,
    pub full_mode: FullModeEstimate,
}

#[derive(Debug, Clone)]
pub struct BinningResult {
    pub mode: BinningMode,
    pub fingerprint: String,
    pub aggregates: BinAggregates,
    pub stats: RunStats,
    pub summary: FoldSummary,
    /// Records written to the analysis store in full mode
    pub store_records: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(BinningResult),
    /// Stopped at a quantum boundary; resume from the checkpoint
    Cancelled(Checkpoint),
}

/// Mutable state of a run between template instances.
#[derive(Debug, Clone)]
pub(crate) struct RunState {
    pub cursor: RunCursor,
    pub aggregates: BinAggregates,
    pub stats: RunStats,
}

#[derive(Default)]
struct InstancePoints {
    sources: Vec<SurveyPoint>,
    receivers: Vec<SurveyPoint>,
}

/// Fields that change binning results; run tuning is left out.
#[derive(Serialize)]
struct ResultIdentity<'a> {
    geometry: String,
    edits: String,
    output_area: &'a crate::bounds::Rect,
    bin_size: &'a crate::config::BinSize,
    numbering: &'a crate::config::StakeNumbering,
    limits: &'a crate::config::OffsetLimits,
    unique_fold: &'a crate::config::UniqueFold,
    reflector: &'a Option<crate::config::Reflector>,
}

pub struct BinningEngine {
    geometry: SurveyGeometry,
    config: BinningConfig,
    edits: PointEdits,
    grid: BinGrid,
    fingerprint: String,
}

impl BinningEngine {
    /// Validate inputs and fix the run identity
    pub fn new(
        geometry: SurveyGeometry,
        config: BinningConfig,
        edits: PointEdits,
    ) -> Result<Self, BinningError> {
        geometry.validate()?;
        config.validate()?;

        let identity = ResultIdentity {
            geometry: geometry.fingerprint(),
            edits: edits.fingerprint(),
            output_area: &config.output_area,
            bin_size: &config.bin_size,
            numbering: &config.numbering,
            limits: &config.limits,
            unique_fold: &config.unique_fold,
            reflector: &config.reflector,
        };
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&identity)?);
        let fingerprint = hex_digest(hasher);

        let grid = config.grid();
        debug!(fingerprint = %fingerprint, nx = grid.nx, ny = grid.ny, "binning engine ready");
        Ok(Self {
            geometry,
            config,
            edits,
            grid,
            fingerprint,
        })
    }

    pub fn geometry(&self) -> &SurveyGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &BinningConfig {
        &self.config
    }

    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }

    /// Identity of geometry, result-affecting configuration and point edits
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn plan(&self) -> RunPlan {
        RunPlan {
            blocks: self.geometry.blocks.len(),
            templates: self.geometry.blocks.iter().map(|b| b.templates.len()).sum(),
            instances: self.geometry.instance_count(),
            source_points: self.geometry.generated_point_count(Role::Source),
            receiver_points: self.geometry.generated_point_count(Role::Receiver),
            max_traces: self.geometry.max_trace_count(),
            bins: self.grid.bin_count(),
            full_mode: FullModeEstimate::new(&self.geometry, &self.config),
        }
    }

    /// Basic-mode run on the calling thread without cancellation
    pub fn run_basic(&self) -> Result<BinningResult, BinningError> {
        let (state, _) = self.drive(self.fresh_state(), None, &NoProgress, None)?;
        Ok(self.result(state, BinningMode::Basic, None))
    }

    /// Run or resume as `request` describes. Full mode creates or reopens
    /// the store; on a fatal error the store is marked incomplete.
    pub fn run(
        &self,
        request: &RunRequest,
        control: &RunControl,
        progress: &dyn ProgressSink,
    ) -> Result<RunOutcome, BinningError> {
        let state = match &request.resume {
            Some(checkpoint) => self.restore(checkpoint, request.mode)?,
            None => self.fresh_state(),
        };
        let plan = self.plan();
        info!(
            mode = ?request.mode,
            instances = plan.instances,
            resume_at = state.cursor.instances_done,
            max_traces = plan.max_traces,
            bins = plan.bins,
            "starting binning run"
        );

        plan.full_mode.warn_if_expensive(request.mode == BinningMode::Full);

        match request.mode {
            BinningMode::Basic => {
                let (state, stopped) = self.drive(state, Some(control), progress, None)?;
                if stopped {
                    Ok(RunOutcome::Cancelled(self.checkpoint(&state, BinningMode::Basic, 0)))
                } else {
                    Ok(RunOutcome::Completed(self.result(state, BinningMode::Basic, None)))
                }
            }
            BinningMode::Full => {
                let dir = request
                    .store_dir
                    .as_deref()
                    .ok_or(BinningError::FullModeRequiresStore)?;

                let mut writer = match &request.resume {
                    Some(checkpoint) => {
                        StoreWriter::resume(dir, &self.fingerprint, checkpoint.records_committed)?
                    }
                    None => StoreWriter::create(
                        dir,
                        &self.fingerprint,
                        self.grid,
                        self.config.chunk_records,
                    )?,
                };

                match self.drive(state, Some(control), progress, Some(&mut writer)) {
                    Ok((state, true)) => {
                        let committed = writer.suspend()?;
                        let checkpoint = self.checkpoint(&state, BinningMode::Full, committed);
                        checkpoint.save(&dir.join(CHECKPOINT_FILE))?;
                        Ok(RunOutcome::Cancelled(checkpoint))
                    }
                    Ok((state, false)) => {
                        let manifest = writer.finish()?;
                        Ok(RunOutcome::Completed(self.result(
                            state,
                            BinningMode::Full,
                            Some(manifest.record_count),
                        )))
                    }
                    Err(e) => {
                        writer.abort(&e.to_string());
                        Err(e)
                    }
                }
            }
        }
    }

    /// Basic mode with blocks binned in parallel and merged in block order.
    /// Folds match a sequential run exactly; offset sums may differ in
    /// the last bits because they are added in a different order.
    pub fn run_basic_parallel(&self) -> Result<BinningResult, BinningError> {
        let partials: Vec<RunState> = self
            .geometry
            .blocks
            .par_iter()
            .enumerate()
            .map(|(block_index, block)| -> Result<RunState, BinningError> {
                let mut state = self.fresh_state();
                let mut points = InstancePoints::default();
                for template in &block.templates {
                    for instance in RollOffsets::new(&template.roll) {
                        self.bin_instance(
                            block_index,
                            block,
                            template,
                            &instance,
                            &mut state,
                            &mut points,
                            None,
                        )?;
                        state.cursor.instances_done += 1;
                    }
                }
                Ok(state)
            })
            .collect::<Result<_, _>>()?;

        let mut merged = self.fresh_state();
        for partial in &partials {
            merged.aggregates.merge(&partial.aggregates);
            merged.stats.merge(&partial.stats);
            merged.cursor.instances_done += partial.cursor.instances_done;
        }
        merged.cursor.block = self.geometry.blocks.len();
        Ok(self.result(merged, BinningMode::Basic, None))
    }

    pub(crate) fn fresh_state(&self) -> RunState {
        RunState {
            cursor: RunCursor::default(),
            aggregates: BinAggregates::new(self.grid, self.config.unique_fold),
            stats: RunStats::default(),
        }
    }

    fn restore(&self, checkpoint: &Checkpoint, mode: BinningMode) -> Result<RunState, BinningError> {
        if checkpoint.fingerprint != self.fingerprint {
            return Err(BinningError::CheckpointMismatch {
                expected: self.fingerprint.clone(),
                found: checkpoint.fingerprint.clone(),
            });
        }
        if checkpoint.mode != mode || checkpoint.aggregates.grid != self.grid {
            return Err(BinningError::CheckpointMismatch {
                expected: format!("{:?} run on this grid", mode),
                found: format!("{:?} checkpoint", checkpoint.mode),
            });
        }
        Ok(RunState {
            cursor: checkpoint.cursor,
            aggregates: BinAggregates::from_snapshot(checkpoint.aggregates.clone()),
            stats: checkpoint.stats,
        })
    }

    fn checkpoint(&self, state: &RunState, mode: BinningMode, records_committed: u64) -> Checkpoint {
        info!(
            instances_done = state.cursor.instances_done,
            records_committed, "binning run cancelled at a quantum boundary"
        );
        Checkpoint::new(
            &self.fingerprint,
            mode,
            state.cursor,
            state.aggregates.snapshot(),
            state.stats,
            records_committed,
        )
    }

    fn result(&self, state: RunState, mode: BinningMode, store_records: Option<u64>) -> BinningResult {
        let summary = state.aggregates.summary();
        info!(
            traces = state.stats.traces_accepted,
            covered_bins = summary.covered_bins,
            min_fold = summary.min_fold,
            max_fold = summary.max_fold,
            min_offset = summary.min_min_offset,
            max_offset = summary.max_max_offset,
            rms_increment_min = summary.min_rms_increment,
            rms_increment_max = summary.max_rms_increment,
            "binning complete"
        );
        BinningResult {
            mode,
            fingerprint: self.fingerprint.clone(),
            aggregates: state.aggregates,
            stats: state.stats,
            summary,
            store_records,
        }
    }

    /// Walk template instances from the state's cursor. Returns the final
    /// state and whether the run stopped early on cancellation.
    fn drive(
        &self,
        mut state: RunState,
        control: Option<&RunControl>,
        progress: &dyn ProgressSink,
        mut store: Option<&mut StoreWriter>,
    ) -> Result<(RunState, bool), BinningError> {
        let total = self.geometry.instance_count().max(1);
        let start = state.cursor;
        let quantum = self.config.quantum;
        let mut since_check = 0u64;
        let mut quantum_start = Instant::now();
        let mut points = InstancePoints::default();

        for (b, block) in self.geometry.blocks.iter().enumerate().skip(start.block) {
            let first_template = if b == start.block { start.template } else { 0 };
            for (t, template) in block.templates.iter().enumerate().skip(first_template) {
                let first_roll = if b == start.block && t == start.template {
                    start.roll
                } else {
                    MultiIndex::ZERO
                };

                let mut rolls = RollOffsets::starting_at(&template.roll, first_roll);
                while let Some(instance) = rolls.next() {
                    self.bin_instance(
                        b,
                        block,
                        template,
                        &instance,
                        &mut state,
                        &mut points,
                        store.as_deref_mut(),
                    )?;

                    let instances_done = state.cursor.instances_done + 1;
                    state.cursor = match rolls.next_index() {
                        Some(roll) => RunCursor {
                            block: b,
                            template: t,
                            roll,
                            instances_done,
                        },
                        None => RunCursor {
                            block: b,
                            template: t + 1,
                            roll: MultiIndex::ZERO,
                            instances_done,
                        },
                    };

                    since_check += 1;
                    let elapsed = quantum_start.elapsed().as_millis() as u64;
                    if since_check < quantum.instances && elapsed < quantum.millis {
                        continue;
                    }
                    since_check = 0;
                    quantum_start = Instant::now();

                    if let Some(store) = store.as_deref_mut() {
                        store.commit()?;
                    }
                    progress.report(Progress {
                        fraction: instances_done as f64 / total as f64,
                        message: format!(
                            "block '{}' template '{}': {}/{} instances",
                            block.name, template.name, instances_done, total
                        ),
                    });
                    if control.is_some_and(RunControl::checkpoint) {
                        return Ok((state, true));
                    }
                }
            }
        }

        if let Some(store) = store {
            store.commit()?;
        }
        progress.report(Progress {
            fraction: 1.0,
            message: format!("binned {} traces", state.stats.traces_accepted),
        });
        Ok((state, false))
    }

    #[allow(clippy::too_many_arguments)]
    fn bin_instance(
        &self,
        block_index: usize,
        block: &Block,
        template: &Template,
        instance: &RollInstance,
        state: &mut RunState,
        points: &mut InstancePoints,
        mut store: Option<&mut StoreWriter>,
    ) -> Result<(), BinningError> {
        points.sources.clear();
        points.receivers.clear();

        for seed in &template.seeds {
            for point in seed_points(seed, (instance.dx, instance.dy)) {
                if let Some(resolved) = self.resolve_point(block_index, block, &point, &mut state.stats)
                {
                    match resolved.role {
                        Role::Source => points.sources.push(resolved),
                        Role::Receiver => points.receivers.push(resolved),
                    }
                }
            }
        }

        state
            .aggregates
            .begin_instance(block_index, &points.sources, &points.receivers);
        for (s, src) in points.sources.iter().enumerate() {
            for (r, rec) in points.receivers.iter().enumerate() {
                self.bin_pair((s, src), (r, rec), state, store.as_deref_mut())?;
            }
        }
        Ok(())
    }

    /// Apply identity, edits and border clipping to a generated point
    fn resolve_point(
        &self,
        block_index: usize,
        block: &Block,
        point: &LatticePoint,
        stats: &mut RunStats,
    ) -> Option<SurveyPoint> {
        let id = self.config.numbering.identify(
            block_index,
            point.position.x,
            point.position.y,
            &self.config.bin_size,
        );
        let Some(position) = self.edits.resolve(point.role, id, point.position) else {
            stats.points_inactive += 1;
            return None;
        };
        if !block.admits(point.role, position.x, position.y) {
            stats.points_clipped += 1;
            return None;
        }

        match point.role {
            Role::Source => {
                stats.source_points += 1;
                stats.source_extent.update(position.x, position.y);
            }
            Role::Receiver => {
                stats.receiver_points += 1;
                stats.receiver_extent.update(position.x, position.y);
            }
        }
        Some(SurveyPoint {
            id,
            role: point.role,
            position,
            azimuth: point.azimuth,
        })
    }

    /// Bin one pair; `src` and `rec` carry their index in the instance
    fn bin_pair(
        &self,
        (s, src): (usize, &SurveyPoint),
        (r, rec): (usize, &SurveyPoint),
        state: &mut RunState,
        store: Option<&mut StoreWriter>,
    ) -> Result<(), BinningError> {
        let stats = &mut state.stats;
        stats.pairs_considered += 1;

        let geometry = TraceGeometry::between(&src.position, &rec.position);
        if !self
            .config
            .limits
            .accepts(geometry.dx, geometry.dy, geometry.offset, geometry.azimuth)
        {
            stats.pairs_outside_limits += 1;
            return Ok(());
        }
        let (point, twt_ms) = match &self.config.reflector {
            None => (geometry.cmp, 0.0),
            Some(reflector) => match reflector.reflect(&src.position, &rec.position) {
                Some(reflection) => (reflection.point, reflection.twt_ms),
                None => {
                    stats.pairs_no_reflection += 1;
                    return Ok(());
                }
            },
        };
        let Some(bin) = self.grid.address(point.x, point.y) else {
            stats.pairs_outside_grid += 1;
            return Ok(());
        };

        let unique = state.aggregates.accept(bin, &geometry, s, r);
        stats.traces_accepted += 1;
        stats.cmp_extent.update(point.x, point.y);

        if let Some(store) = store {
            let mut flags = TraceFlags::ACTIVE;
            flags.set(TraceFlags::UNIQUE, unique);
            flags.set(TraceFlags::AZIMUTH_UNDEFINED, geometry.azimuth.is_none());
            flags.set(TraceFlags::SRC_DIRECTIONAL, src.azimuth);
            flags.set(TraceFlags::REC_DIRECTIONAL, rec.azimuth);
            store.append(&TraceRecord {
                bin,
                src_id: src.id,
                rec_id: rec.id,
                src: src.position,
                rec: rec.position,
                cmp: point,
                offset: geometry.offset,
                azimuth: geometry.azimuth.map(|a| a as f32),
                twt_ms: twt_ms as f32,
                flags,
            })?;
        }
        Ok(())
    }
}
