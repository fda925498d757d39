//! Per-bin running statistics.
//!
//! Every bin keeps its fold, unique fold, min/max offset and the running
//! sum and sum of squares of offset. Unique fold is decided by the
//! configured [`UniqueFold`] method; its tracking state is bounded by
//! station placements or by bucket occupancy, never by trace count.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::UniqueFold;
use crate::geometry::{Role, hex_digest};
use crate::grid::{BinAddress, BinGrid};
use crate::trace::{PointId, SurveyPoint, TraceGeometry};

/// Approximate heap bytes per remembered station placement
pub const PLACEMENT_BYTES: u64 = 48;

/// Approximate heap bytes per occupied offset/azimuth bucket
pub const BUCKET_BYTES: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BinCell {
    pub fold: u32,
    pub unique_fold: u32,
    pub min_offset: f64,
    pub max_offset: f64,
    pub offset_sum: f64,
    pub offset_sum_sq: f64,
}

impl BinCell {
    pub fn add(&mut self, offset: f64, unique: bool) {
        if self.fold == 0 {
            self.min_offset = offset;
            self.max_offset = offset;
        } else {
            self.min_offset = self.min_offset.min(offset);
            self.max_offset = self.max_offset.max(offset);
        }
        self.fold += 1;
        if unique {
            self.unique_fold += 1;
        }
        self.offset_sum += offset;
        self.offset_sum_sq += offset * offset;
    }

    pub fn is_empty(&self) -> bool {
        self.fold == 0
    }

    pub fn mean_offset(&self) -> Option<f64> {
        (self.fold > 0).then(|| self.offset_sum / self.fold as f64)
    }

    /// Population standard deviation of offsets; `None` for empty bins
    pub fn rms_increment(&self) -> Option<f64> {
        let mean = self.mean_offset()?;
        let variance = self.offset_sum_sq / self.fold as f64 - mean * mean;
        Some(variance.max(0.0).sqrt())
    }

    /// Fold-in statistics of `other`; unique fold is handled by the caller
    fn merge_stats(&mut self, other: &BinCell) {
        if other.fold == 0 {
            return;
        }
        if self.fold == 0 {
            self.min_offset = other.min_offset;
            self.max_offset = other.max_offset;
        } else {
            self.min_offset = self.min_offset.min(other.min_offset);
            self.max_offset = self.max_offset.max(other.max_offset);
        }
        self.fold += other.fold;
        self.offset_sum += other.offset_sum;
        self.offset_sum_sq += other.offset_sum_sq;
    }
}

/// One placement of a station by a template instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub instance: u32,
    pub x: f64,
    pub y: f64,
}

impl Placement {
    fn at(instance: u32, point: &SurveyPoint) -> Self {
        Self {
            instance,
            x: point.position.x,
            y: point.position.y,
        }
    }

    fn same_position(&self, other: &Placement) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits()
    }
}

/// Earlier placements of one station within the current instance.
#[derive(Debug, Clone, Default)]
struct Slot {
    /// Earlier instances of the block that placed it at the same position
    earlier: Vec<u32>,
    /// Already placed at this position by the current instance
    repeat: bool,
}

/// Station placements of the current block.
///
/// A pair repeats when an earlier instance of the block combined the same
/// two stations at the same positions, so it landed in the same bin.
/// Point identities carry the block index, so history resets per block.
#[derive(Debug, Clone, Default)]
struct PairHistory {
    block: Option<usize>,
    instances: u32,
    placements: HashMap<(Role, PointId), Vec<Placement>>,
    sources: Vec<Slot>,
    receivers: Vec<Slot>,
}

impl PartialEq for PairHistory {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
            && self.instances == other.instances
            && self.placements == other.placements
    }
}

impl PairHistory {
    fn begin(&mut self, block: usize, sources: &[SurveyPoint], receivers: &[SurveyPoint]) {
        if self.block != Some(block) {
            self.block = Some(block);
            self.instances = 0;
            self.placements.clear();
        }
        let instance = self.instances;
        self.instances += 1;
        Self::mark(&mut self.placements, instance, sources, &mut self.sources);
        Self::mark(&mut self.placements, instance, receivers, &mut self.receivers);
    }

    fn mark(
        placements: &mut HashMap<(Role, PointId), Vec<Placement>>,
        instance: u32,
        points: &[SurveyPoint],
        slots: &mut Vec<Slot>,
    ) {
        slots.clear();
        for point in points {
            let placement = Placement::at(instance, point);
            let history = placements.entry((point.role, point.id)).or_default();
            let repeat = history
                .iter()
                .rev()
                .take_while(|p| p.instance == instance)
                .any(|p| p.same_position(&placement));
            let earlier = history
                .iter()
                .filter(|p| p.instance < instance && p.same_position(&placement))
                .map(|p| p.instance)
                .collect();
            if !repeat {
                history.push(placement);
            }
            slots.push(Slot { earlier, repeat });
        }
    }

    fn is_unique(&self, src: usize, rec: usize) -> bool {
        match (self.sources.get(src), self.receivers.get(rec)) {
            (Some(s), Some(r)) => !(s.repeat || r.repeat || shares_instance(&s.earlier, &r.earlier)),
            _ => true,
        }
    }

    fn placement_count(&self) -> usize {
        self.placements.values().map(Vec::len).sum()
    }
}

/// Whether two ascending instance lists have an entry in common
fn shares_instance(a: &[u32], b: &[u32]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

/// Offset and azimuth bucket of a trace within its bin
pub type BucketKey = (u64, u32, u32);

#[derive(Debug, Clone, PartialEq)]
enum Tracker {
    Off,
    Pairs(PairHistory),
    Buckets {
        delta_offset: f64,
        delta_azimuth: f64,
        seen: HashSet<BucketKey>,
    },
}

impl Tracker {
    fn new(method: UniqueFold) -> Self {
        match method {
            UniqueFold::Off => Tracker::Off,
            UniqueFold::Pairs => Tracker::Pairs(PairHistory::default()),
            UniqueFold::Buckets {
                delta_offset,
                delta_azimuth,
            } => Tracker::Buckets {
                delta_offset,
                delta_azimuth,
                seen: HashSet::new(),
            },
        }
    }
}

/// Bucket of a trace; undefined azimuths share bucket zero
fn bucket(bin: u64, geometry: &TraceGeometry, delta_offset: f64, delta_azimuth: f64) -> BucketKey {
    let offset = (geometry.offset / delta_offset).floor() as u32;
    let azimuth = geometry
        .azimuth
        .map_or(0, |a| (a / delta_azimuth).floor() as u32 + 1);
    (bin, offset, azimuth)
}

/// Min/max over covered bins of each derived quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FoldSummary {
    pub covered_bins: u64,
    pub total_fold: u64,
    pub min_fold: u32,
    pub max_fold: u32,
    pub min_min_offset: f64,
    pub max_min_offset: f64,
    pub min_max_offset: f64,
    pub max_max_offset: f64,
    pub min_rms_increment: f64,
    pub max_rms_increment: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinAggregates {
    grid: BinGrid,
    cells: Vec<BinCell>,
    tracker: Tracker,
}

impl BinAggregates {
    pub fn new(grid: BinGrid, unique: UniqueFold) -> Self {
        Self {
            grid,
            cells: vec![BinCell::default(); grid.bin_count() as usize],
            tracker: Tracker::new(unique),
        }
    }

    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }

    pub fn cells(&self) -> &[BinCell] {
        &self.cells
    }

    pub fn tracks_unique(&self) -> bool {
        !matches!(self.tracker, Tracker::Off)
    }

    /// Entries held by unique-fold tracking: placements or buckets
    pub fn tracked_entries(&self) -> usize {
        match &self.tracker {
            Tracker::Off => 0,
            Tracker::Pairs(history) => history.placement_count(),
            Tracker::Buckets { seen, .. } => seen.len(),
        }
    }

    pub fn cell(&self, address: BinAddress) -> Option<&BinCell> {
        if !self.grid.contains(address) {
            return None;
        }
        self.cells.get(self.grid.linear(address) as usize)
    }

    /// Register the stations of the next template instance. `accept` then
    /// refers to them by their index in these slices.
    pub fn begin_instance(&mut self, block: usize, sources: &[SurveyPoint], receivers: &[SurveyPoint]) {
        if let Tracker::Pairs(history) = &mut self.tracker {
            history.begin(block, sources, receivers);
        }
    }

    /// Add one trace formed by source `src` and receiver `rec` of the
    /// current instance; returns whether it counted towards unique fold.
    /// Without tracking every trace counts as unique.
    pub fn accept(
        &mut self,
        address: BinAddress,
        geometry: &TraceGeometry,
        src: usize,
        rec: usize,
    ) -> bool {
        let bin = self.grid.linear(address);
        let unique = match &mut self.tracker {
            Tracker::Off => true,
            Tracker::Pairs(history) => history.is_unique(src, rec),
            Tracker::Buckets {
                delta_offset,
                delta_azimuth,
                seen,
            } => seen.insert(bucket(bin, geometry, *delta_offset, *delta_azimuth)),
        };
        if let Some(cell) = self.cells.get_mut(bin as usize) {
            cell.add(geometry.offset, unique);
        }
        unique
    }

    /// Record a trace whose uniqueness was decided earlier
    pub(crate) fn replay(&mut self, address: BinAddress, offset: f64, unique: bool) {
        let bin = self.grid.linear(address) as usize;
        if let Some(cell) = self.cells.get_mut(bin) {
            cell.add(offset, unique);
        }
    }

    /// Merge aggregates of later blocks produced by the same method
    pub fn merge(&mut self, other: &BinAggregates) {
        for (cell, theirs) in self.cells.iter_mut().zip(other.cells.iter()) {
            cell.merge_stats(theirs);
        }
        match (&mut self.tracker, &other.tracker) {
            (Tracker::Buckets { seen, .. }, Tracker::Buckets { seen: theirs, .. }) => {
                let mut keys: Vec<&BucketKey> = theirs.iter().collect();
                keys.sort();
                for key in keys {
                    if seen.insert(*key) {
                        if let Some(cell) = self.cells.get_mut(key.0 as usize) {
                            cell.unique_fold += 1;
                        }
                    }
                }
            }
            (tracker, later_tracker) => {
                for (cell, theirs) in self.cells.iter_mut().zip(other.cells.iter()) {
                    cell.unique_fold += theirs.unique_fold;
                }
                if let (Tracker::Pairs(history), Tracker::Pairs(later)) = (tracker, later_tracker) {
                    if later.block.is_some() {
                        *history = later.clone();
                    }
                }
            }
        }
    }

    pub fn total_fold(&self) -> u64 {
        self.cells.iter().map(|c| c.fold as u64).sum()
    }

    pub fn summary(&self) -> FoldSummary {
        let mut summary = FoldSummary::default();
        for cell in self.cells.iter().filter(|c| !c.is_empty()) {
            let rms = cell.rms_increment().unwrap_or(0.0);
            if summary.covered_bins == 0 {
                summary.min_fold = cell.fold;
                summary.max_fold = cell.fold;
                summary.min_min_offset = cell.min_offset;
                summary.max_min_offset = cell.min_offset;
                summary.min_max_offset = cell.max_offset;
                summary.max_max_offset = cell.max_offset;
                summary.min_rms_increment = rms;
                summary.max_rms_increment = rms;
            } else {
                summary.min_fold = summary.min_fold.min(cell.fold);
                summary.max_fold = summary.max_fold.max(cell.fold);
                summary.min_min_offset = summary.min_min_offset.min(cell.min_offset);
                summary.max_min_offset = summary.max_min_offset.max(cell.min_offset);
                summary.min_max_offset = summary.min_max_offset.min(cell.max_offset);
                summary.max_max_offset = summary.max_max_offset.max(cell.max_offset);
                summary.min_rms_increment = summary.min_rms_increment.min(rms);
                summary.max_rms_increment = summary.max_rms_increment.max(rms);
            }
            summary.covered_bins += 1;
            summary.total_fold += cell.fold as u64;
        }
        summary
    }

    /// Canonical little-endian encoding of every cell in bin order
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.cells.len() * 40);
        for cell in &self.cells {
            bytes.extend_from_slice(&cell.fold.to_le_bytes());
            bytes.extend_from_slice(&cell.unique_fold.to_le_bytes());
            bytes.extend_from_slice(&cell.min_offset.to_le_bytes());
            bytes.extend_from_slice(&cell.max_offset.to_le_bytes());
            bytes.extend_from_slice(&cell.offset_sum.to_le_bytes());
            bytes.extend_from_slice(&cell.offset_sum_sq.to_le_bytes());
        }
        bytes
    }

    /// SHA-256 of [`to_bytes`](Self::to_bytes)
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes());
        hex_digest(hasher)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let unique = match &self.tracker {
            Tracker::Off => UniqueSnapshot::Off,
            Tracker::Pairs(history) => {
                let mut stations: Vec<StationHistory> = history
                    .placements
                    .iter()
                    .map(|(&(role, id), placements)| StationHistory {
                        role,
                        id,
                        placements: placements.clone(),
                    })
                    .collect();
                stations.sort_by_key(|s| (s.role, s.id));
                UniqueSnapshot::Pairs {
                    block: history.block,
                    instances: history.instances,
                    stations,
                }
            }
            Tracker::Buckets {
                delta_offset,
                delta_azimuth,
                seen,
            } => {
                let mut buckets: Vec<BucketKey> = seen.iter().copied().collect();
                buckets.sort();
                UniqueSnapshot::Buckets {
                    delta_offset: *delta_offset,
                    delta_azimuth: *delta_azimuth,
                    buckets,
                }
            }
        };
        AggregateSnapshot {
            grid: self.grid,
            cells: self.cells.clone(),
            unique,
        }
    }

    pub fn from_snapshot(snapshot: AggregateSnapshot) -> Self {
        let tracker = match snapshot.unique {
            UniqueSnapshot::Off => Tracker::Off,
            UniqueSnapshot::Pairs {
                block,
                instances,
                stations,
            } => Tracker::Pairs(PairHistory {
                block,
                instances,
                placements: stations
                    .into_iter()
                    .map(|s| ((s.role, s.id), s.placements))
                    .collect(),
                ..PairHistory::default()
            }),
            UniqueSnapshot::Buckets {
                delta_offset,
                delta_azimuth,
                buckets,
            } => Tracker::Buckets {
                delta_offset,
                delta_azimuth,
                seen: buckets.into_iter().collect(),
            },
        };
        Self {
            grid: snapshot.grid,
            cells: snapshot.cells,
            tracker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationHistory {
    pub role: Role,
    pub id: PointId,
    pub placements: Vec<Placement>,
}

/// Unique-fold tracking state in sorted, serialisable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum UniqueSnapshot {
    Off,
    Pairs {
        block: Option<usize>,
        instances: u32,
        stations: Vec<StationHistory>,
    },
    Buckets {
        delta_offset: f64,
        delta_azimuth: f64,
        buckets: Vec<BucketKey>,
    },
}

/// Serialisable form of [`BinAggregates`] stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub grid: BinGrid,
    pub cells: Vec<BinCell>,
    pub unique: UniqueSnapshot,
}
