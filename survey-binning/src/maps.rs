//! Raster grids derived from bin aggregates.
//!
//! Every raster shares the bin grid's cell size and origin. A bin with fold
//! zero is NoData (`None`) in every raster, including the fold map itself.

use std::borrow::Cow;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregates::{BinAggregates, BinCell};
use crate::bounds::Coord;
use crate::config::UniqueFold;
use crate::error::StoreError;
use crate::grid::BinAddress;
use crate::store::AnalysisStore;
use crate::trace::TraceFlags;
use crate::transform::{AffineTransform, CoordinateTransform, CrsInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Fold,
    MinOffset,
    MaxOffset,
    RmsOffsetIncrement,
    UniqueFold,
}

impl MapKind {
    pub const ALL: [MapKind; 5] = [
        MapKind::Fold,
        MapKind::MinOffset,
        MapKind::MaxOffset,
        MapKind::RmsOffsetIncrement,
        MapKind::UniqueFold,
    ];

    /// File-name friendly identifier
    pub fn name(self) -> &'static str {
        match self {
            MapKind::Fold => "fold",
            MapKind::MinOffset => "min_offset",
            MapKind::MaxOffset => "max_offset",
            MapKind::RmsOffsetIncrement => "rms_offset_increment",
            MapKind::UniqueFold => "unique_fold",
        }
    }

    fn value(self, cell: &BinCell) -> Option<f32> {
        if cell.is_empty() {
            return None;
        }
        Some(match self {
            MapKind::Fold => cell.fold as f32,
            MapKind::MinOffset => cell.min_offset as f32,
            MapKind::MaxOffset => cell.max_offset as f32,
            MapKind::RmsOffsetIncrement => cell.rms_increment()? as f32,
            MapKind::UniqueFold => cell.unique_fold as f32,
        })
    }
}

impl std::fmt::Display for MapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RasterStats {
    pub valid_cells: u64,
    pub nodata_cells: u64,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub kind: MapKind,
    pub nx: u32,
    pub ny: u32,
    /// Cell width and height in local grid units
    pub cell_size: (f64, f64),
    /// Local coordinates of the corner of cell (0, 0)
    pub origin: Coord,
    /// Row-major from the origin, one row per crossline
    pub values: Vec<Option<f32>>,
    /// Cell (column, row) corner coordinates to projected coordinates
    pub transform: AffineTransform,
    pub crs: Option<CrsInfo>,
}

impl Raster {
    pub fn get(&self, address: BinAddress) -> Option<f32> {
        if address.inline >= self.nx || address.crossline >= self.ny {
            return None;
        }
        let index = address.crossline as usize * self.nx as usize + address.inline as usize;
        self.values.get(index).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn stats(&self) -> RasterStats {
        let mut stats = RasterStats::default();
        let mut sum = 0.0f64;
        for value in &self.values {
            match value {
                Some(v) => {
                    stats.valid_cells += 1;
                    sum += *v as f64;
                    stats.min = Some(stats.min.map_or(*v, |m| m.min(*v)));
                    stats.max = Some(stats.max.map_or(*v, |m| m.max(*v)));
                }
                None => stats.nodata_cells += 1,
            }
        }
        stats.mean = (stats.valid_cells > 0).then(|| sum / stats.valid_cells as f64);
        stats
    }
}

/// Reduces bin aggregates into rasters.
pub struct MapBuilder<'a> {
    aggregates: Cow<'a, BinAggregates>,
    transform: AffineTransform,
    crs: Option<CrsInfo>,
}

impl<'a> MapBuilder<'a> {
    pub fn from_aggregates(
        aggregates: &'a BinAggregates,
        transform: &dyn CoordinateTransform,
    ) -> Self {
        Self::with_aggregates(Cow::Borrowed(aggregates), transform)
    }

    /// Rebuild aggregates by scanning every record of a complete store.
    /// Unique fold follows the flag recorded at write time.
    pub fn from_store(
        store: &AnalysisStore,
        transform: &dyn CoordinateTransform,
    ) -> Result<MapBuilder<'static>, StoreError> {
        let mut aggregates = BinAggregates::new(*store.grid(), UniqueFold::Off);
        store.scan(|record| {
            aggregates.replay(
                record.bin,
                record.offset,
                record.flags.contains(TraceFlags::UNIQUE),
            )
        })?;
        info!(
            records = store.record_count(),
            total_fold = aggregates.total_fold(),
            "rebuilt bin aggregates from analysis store"
        );
        Ok(MapBuilder::with_aggregates(Cow::Owned(aggregates), transform))
    }

    fn with_aggregates(
        aggregates: Cow<'a, BinAggregates>,
        transform: &dyn CoordinateTransform,
    ) -> Self {
        let grid = aggregates.grid();
        let cells = AffineTransform::from_grid(grid.origin.x, grid.origin.y, 0.0, grid.bin_dx, grid.bin_dy);
        Self {
            transform: transform.affine().then(&cells),
            crs: transform.crs().cloned(),
            aggregates,
        }
    }

    pub fn aggregates(&self) -> &BinAggregates {
        &self.aggregates
    }

    /// Cell coordinates to projected coordinates
    pub fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    pub fn build(&self, kind: MapKind) -> Raster {
        let grid = self.aggregates.grid();
        let values: Vec<Option<f32>> = self
            .aggregates
            .cells()
            .iter()
            .map(|cell| kind.value(cell))
            .collect();
        debug!(kind = %kind, nx = grid.nx, ny = grid.ny, "built raster");
        Raster {
            kind,
            nx: grid.nx,
            ny: grid.ny,
            cell_size: (grid.bin_dx, grid.bin_dy),
            origin: grid.origin,
            values,
            transform: self.transform,
            crs: self.crs.clone(),
        }
    }

    pub fn build_all(&self) -> Vec<Raster> {
        MapKind::ALL.par_iter().map(|&kind| self.build(kind)).collect()
    }
}
