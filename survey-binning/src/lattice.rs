//! Lazy expansion of grow and roll lattices.
//!
//! A lattice of up to three dimensions is walked by a [`LatticeCursor`]:
//! the first step is the slowest index, the last step the fastest. The
//! cursor's [`MultiIndex`] is plain data, so the same value drives
//! iteration and is persisted to resume a run.

use constants::binning::MAX_STEP_DEPTH;
use serde::{Deserialize, Serialize};

use crate::bounds::Coord;
use crate::geometry::{Pattern, Role, Seed, Step};

pub const MAX_DIMS: usize = MAX_STEP_DEPTH;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct MultiIndex(pub [u32; MAX_DIMS]);

impl MultiIndex {
    pub const ZERO: MultiIndex = MultiIndex([0; MAX_DIMS]);

    pub fn new(i: u32, j: u32, k: u32) -> Self {
        MultiIndex([i, j, k])
    }

    /// Sum of `increment * index` over the given steps
    pub fn offset(&self, steps: &[Step]) -> (f64, f64) {
        steps
            .iter()
            .take(MAX_DIMS)
            .zip(self.0.iter())
            .fold((0.0, 0.0), |(x, y), (step, &i)| {
                (x + step.dx * i as f64, y + step.dy * i as f64)
            })
    }
}

/// Odometer over a bounded lattice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticeCursor {
    counts: [u32; MAX_DIMS],
    current: Option<MultiIndex>,
}

impl LatticeCursor {
    /// Cursor at the first lattice point; unused dimensions have count 1
    pub fn new(steps: &[Step]) -> Self {
        Self::starting_at(steps, MultiIndex::ZERO)
    }

    /// Cursor positioned at `index`, or exhausted if `index` lies outside
    pub fn starting_at(steps: &[Step], index: MultiIndex) -> Self {
        let mut counts = [1u32; MAX_DIMS];
        for (slot, step) in counts.iter_mut().zip(steps.iter().take(MAX_DIMS)) {
            *slot = step.count.max(0) as u32;
        }
        let inside = index.0.iter().zip(counts.iter()).all(|(&i, &n)| i < n);
        Self {
            counts,
            current: inside.then_some(index),
        }
    }

    /// Reposition at `index` with the same counts
    pub fn restart_at(&mut self, index: MultiIndex) {
        let inside = index.0.iter().zip(self.counts.iter()).all(|(&i, &n)| i < n);
        self.current = inside.then_some(index);
    }

    pub fn current(&self) -> Option<MultiIndex> {
        self.current
    }

    pub fn counts(&self) -> [u32; MAX_DIMS] {
        self.counts
    }

    /// Total lattice points
    pub fn len(&self) -> u64 {
        self.counts.iter().map(|&n| n as u64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major position of the current index, or `len()` once exhausted
    pub fn linear_position(&self) -> u64 {
        match self.current {
            Some(index) => index
                .0
                .iter()
                .zip(self.counts.iter())
                .fold(0u64, |acc, (&i, &n)| acc * n as u64 + i as u64),
            None => self.len(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.len() - self.linear_position()
    }

    /// Step to the next index; the last dimension turns fastest
    pub fn advance(&mut self) {
        let Some(mut index) = self.current else {
            return;
        };
        for dim in (0..MAX_DIMS).rev() {
            index.0[dim] += 1;
            if index.0[dim] < self.counts[dim] {
                self.current = Some(index);
                return;
            }
            index.0[dim] = 0;
        }
        self.current = None;
    }
}

/// One concrete point produced by a seed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticePoint {
    pub index: MultiIndex,
    pub position: Coord,
    pub role: Role,
    pub azimuth: bool,
}

/// Points of a seed, translated by a template-instance offset. Circle and
/// spiral seeds walk a single dimension of `point_count` entries.
#[derive(Debug, Clone)]
pub struct GrowPoints<'a> {
    seed: &'a Seed,
    base: Coord,
    cursor: LatticeCursor,
}

impl<'a> GrowPoints<'a> {
    pub fn new(seed: &'a Seed, offset: (f64, f64)) -> Self {
        Self::starting_at(seed, offset, MultiIndex::ZERO)
    }

    pub fn starting_at(seed: &'a Seed, offset: (f64, f64), index: MultiIndex) -> Self {
        Self {
            seed,
            base: Coord::new(seed.origin.x + offset.0, seed.origin.y + offset.1),
            cursor: LatticeCursor::starting_at(&seed.lattice_steps(), index),
        }
    }

    pub fn cursor(&self) -> &LatticeCursor {
        &self.cursor
    }
}

impl Iterator for GrowPoints<'_> {
    type Item = LatticePoint;

    fn next(&mut self) -> Option<LatticePoint> {
        let index = self.cursor.current()?;
        self.cursor.advance();
        let (dx, dy) = self.seed.offset_of(&index);
        Some(LatticePoint {
            index,
            position: Coord::new(self.base.x + dx, self.base.y + dy),
            role: self.seed.role,
            azimuth: self.seed.azimuth,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cursor.remaining() as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GrowPoints<'_> {}

/// Points of `seed` in one template instance.
pub fn seed_points(seed: &Seed, offset: (f64, f64)) -> GrowPoints<'_> {
    GrowPoints::new(seed, offset)
}

/// One translated copy of a template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollInstance {
    pub index: MultiIndex,
    pub dx: f64,
    pub dy: f64,
}

/// Template instances generated by a roll list. An empty list yields a
/// single instance at zero offset.
#[derive(Debug, Clone)]
pub struct RollOffsets<'a> {
    steps: &'a [Step],
    cursor: LatticeCursor,
}

impl<'a> RollOffsets<'a> {
    pub fn new(steps: &'a [Step]) -> Self {
        Self::starting_at(steps, MultiIndex::ZERO)
    }

    pub fn starting_at(steps: &'a [Step], index: MultiIndex) -> Self {
        Self {
            steps,
            cursor: LatticeCursor::starting_at(steps, index),
        }
    }

    /// Index the next call to `next` will yield
    pub fn next_index(&self) -> Option<MultiIndex> {
        self.cursor.current()
    }
}

impl Iterator for RollOffsets<'_> {
    type Item = RollInstance;

    fn next(&mut self) -> Option<RollInstance> {
        let index = self.cursor.current()?;
        self.cursor.advance();
        let (dx, dy) = index.offset(self.steps);
        Some(RollInstance { index, dx, dy })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cursor.remaining() as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RollOffsets<'_> {}

/// Element positions of a pattern relative to its station
pub fn pattern_elements(pattern: &Pattern) -> impl Iterator<Item = Coord> + '_ {
    pattern.seeds.iter().flat_map(|seed| {
        let cursor = LatticeCursor::new(&seed.grow);
        PatternWalk { cursor, seed }
    })
}

struct PatternWalk<'a> {
    cursor: LatticeCursor,
    seed: &'a crate::geometry::PatternSeed,
}

impl Iterator for PatternWalk<'_> {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        let index = self.cursor.current()?;
        self.cursor.advance();
        let (dx, dy) = index.offset(&self.seed.grow);
        Some(Coord::new(self.seed.origin.x + dx, self.seed.origin.y + dy))
    }
}
