//! Survey geometry expansion and trace binning.
//!
//! A [`SurveyGeometry`] of blocks, templates and seeds expands lazily into
//! source and receiver points. [`BinningEngine`] pairs them per template
//! instance, bins the midpoints (or reflection points) and accumulates per-bin statistics; in full
//! mode every trace is also written to an on-disk [`AnalysisStore`].
//! [`MapBuilder`] turns the statistics into geo-referenced rasters.

pub mod aggregates;
pub mod analysis;
pub mod binning;
pub mod bounds;
pub mod config;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod lattice;
pub mod logging;
pub mod maps;
pub mod points;
pub mod raster_writer;
pub mod reflector;
pub mod run;
pub mod store;
pub mod trace;
pub mod transform;

pub use aggregates::{BinAggregates, BinCell, FoldSummary};
pub use binning::{
    BinningEngine, BinningMode, BinningResult, NoProgress, Progress, ProgressSink, RunCursor,
    RunOutcome, RunPlan, RunStats,
};
pub use bounds::{Coord, Extent, Rect};
pub use config::{BinningConfig, OffsetLimits, ProjectFile, Range, StakeNumbering, UniqueFold};
pub use error::{BinningError, ConfigError, ExportError, GeometryError, StoreError};
pub use geometry::{
    Block, Pattern, PatternSeed, Role, Seed, SeedShape, Step, SurveyGeometry, Template,
};
pub use grid::{BinAddress, BinGrid};
pub use maps::{MapBuilder, MapKind, Raster};
pub use points::{PointEdits, PointList, PointRecord};
pub use reflector::{Point3, Reflection, Reflector};
pub use run::{BinningTask, Checkpoint, RunControl, RunRequest};
pub use store::{AnalysisStore, StoreState, StoreWriter};
pub use trace::{PointId, TraceFlags, TraceRecord};
pub use transform::{AffineTransform, CoordinateTransform, CrsInfo, GridTransform};
