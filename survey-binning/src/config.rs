//! Run configuration and project files.
//!
//! Configuration is an immutable value built once and handed to validation
//! and engine construction. Defaults come from the `constants` crate.

use std::fs;
use std::path::{Path, PathBuf};

use constants::binning::{
    DEFAULT_BIN_SIZE, DEFAULT_LINE_ORIGIN, DEFAULT_QUANTUM_INSTANCES, DEFAULT_QUANTUM_MILLIS,
    DEFAULT_STAKE_ORIGIN, DEFAULT_UNIQUE_DELTA_AZIMUTH, DEFAULT_UNIQUE_DELTA_OFFSET,
    FULL_CIRCLE_DEGREES, FULL_MODE_WARNING_BYTES,
};
use constants::store::DEFAULT_CHUNK_RECORDS;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregates::{BUCKET_BYTES, PLACEMENT_BYTES};
use crate::bounds::Rect;
use crate::error::ConfigError;
use crate::geometry::{Role, SurveyGeometry};
use crate::grid::BinGrid;
use crate::store::RECORD_BYTES;
use crate::trace::PointId;
use crate::transform::GridTransform;

pub use crate::reflector::Reflector;

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub(crate) fn check(&self, field: &'static str) -> Result<(), ConfigError> {
        if !(self.min.is_finite() && self.max.is_finite()) {
            return Err(ConfigError::invalid(field, "bounds must be finite"));
        }
        if self.min > self.max {
            return Err(ConfigError::invalid(
                field,
                format!("min {} exceeds max {}", self.min, self.max),
            ));
        }
        Ok(())
    }
}

/// Limits a source/receiver pair must satisfy to form a trace.
/// Unset limits accept everything.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetLimits {
    /// Receiver minus source, x component
    pub inline: Option<Range>,
    /// Receiver minus source, y component
    pub crossline: Option<Range>,
    pub radial: Option<Range>,
    /// Degrees in [0, 360); zero-offset traces have no azimuth and pass
    pub azimuth: Option<Range>,
}

impl OffsetLimits {
    pub fn accepts(&self, dx: f64, dy: f64, offset: f64, azimuth: Option<f64>) -> bool {
        self.inline.is_none_or(|r| r.contains(dx))
            && self.crossline.is_none_or(|r| r.contains(dy))
            && self.radial.is_none_or(|r| r.contains(offset))
            && match (self.azimuth, azimuth) {
                (Some(range), Some(a)) => range.contains(a),
                _ => true,
            }
    }
}

/// Line and stake numbering used to derive point identities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeNumbering {
    pub point_origin: f64,
    pub line_origin: f64,
    /// Defaults to the bin width
    pub point_interval: Option<f64>,
    /// Defaults to the bin height
    pub line_interval: Option<f64>,
}

impl Default for StakeNumbering {
    fn default() -> Self {
        Self {
            point_origin: DEFAULT_STAKE_ORIGIN,
            line_origin: DEFAULT_LINE_ORIGIN,
            point_interval: None,
            line_interval: None,
        }
    }
}

impl StakeNumbering {
    /// Identity of a generated point from its block and local position.
    pub fn identify(&self, block: usize, x: f64, y: f64, bin_size: &BinSize) -> PointId {
        let ds = self.point_interval.unwrap_or(bin_size.dx);
        let dl = self.line_interval.unwrap_or(bin_size.dy);
        PointId {
            index: (block + 1).min(u16::MAX as usize) as u16,
            line: (self.line_origin + y / dl).round() as i32,
            point: (self.point_origin + x / ds).round() as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinSize {
    pub dx: f64,
    pub dy: f64,
}

impl Default for BinSize {
    fn default() -> Self {
        Self {
            dx: DEFAULT_BIN_SIZE,
            dy: DEFAULT_BIN_SIZE,
        }
    }
}

fn default_delta_offset() -> f64 {
    DEFAULT_UNIQUE_DELTA_OFFSET
}

fn default_delta_azimuth() -> f64 {
    DEFAULT_UNIQUE_DELTA_AZIMUTH
}

/// How unique fold discounts repeated coverage of a bin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum UniqueFold {
    /// No tracking; unique fold equals fold
    #[default]
    Off,
    /// A source/receiver pair that an earlier roll of the same block
    /// already placed at the same positions counts once
    Pairs,
    /// Each bin counts one trace per offset and azimuth bucket
    Buckets {
        #[serde(default = "default_delta_offset")]
        delta_offset: f64,
        #[serde(default = "default_delta_azimuth")]
        delta_azimuth: f64,
    },
}

impl UniqueFold {
    /// Upper bound on heap bytes held for unique-fold tracking
    pub fn tracking_bytes(&self, geometry: &SurveyGeometry, config: &BinningConfig) -> u64 {
        match *self {
            UniqueFold::Off => 0,
            UniqueFold::Pairs => geometry
                .generated_point_count(Role::Source)
                .saturating_add(geometry.generated_point_count(Role::Receiver))
                .saturating_mul(PLACEMENT_BYTES),
            UniqueFold::Buckets {
                delta_offset,
                delta_azimuth,
            } => {
                let traces = geometry.max_trace_count();
                let entries = match config.limits.radial {
                    Some(radial) => {
                        let offsets = (radial.max / delta_offset).floor() as u64 + 1;
                        let azimuths = (FULL_CIRCLE_DEGREES / delta_azimuth).ceil() as u64 + 1;
                        config
                            .grid()
                            .bin_count()
                            .saturating_mul(offsets)
                            .saturating_mul(azimuths)
                            .min(traces)
                    }
                    None => traces,
                };
                entries.saturating_mul(BUCKET_BYTES)
            }
        }
    }
}

/// Work done between cancellation and pause checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quantum {
    pub instances: u64,
    pub millis: u64,
}

impl Default for Quantum {
    fn default() -> Self {
        Self {
            instances: DEFAULT_QUANTUM_INSTANCES,
            millis: DEFAULT_QUANTUM_MILLIS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    pub output_area: Rect,
    pub bin_size: BinSize,
    pub numbering: StakeNumbering,
    pub limits: OffsetLimits,
    pub unique_fold: UniqueFold,
    pub reflector: Option<Reflector>,
    pub quantum: Quantum,
    pub chunk_records: u64,
    pub full_mode_warning_bytes: u64,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            output_area: Rect::new(0.0, 0.0, 0.0, 0.0),
            bin_size: BinSize::default(),
            numbering: StakeNumbering::default(),
            limits: OffsetLimits::default(),
            unique_fold: UniqueFold::Off,
            reflector: None,
            quantum: Quantum::default(),
            chunk_records: DEFAULT_CHUNK_RECORDS,
            full_mode_warning_bytes: FULL_MODE_WARNING_BYTES,
        }
    }
}

impl BinningConfig {
    pub fn new(output_area: Rect, bin_dx: f64, bin_dy: f64) -> Self {
        Self {
            output_area,
            bin_size: BinSize {
                dx: bin_dx,
                dy: bin_dy,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_area.is_degenerate() {
            return Err(ConfigError::invalid(
                "output_area",
                format!(
                    "degenerate area {} x {}",
                    self.output_area.width(),
                    self.output_area.height()
                ),
            ));
        }
        let BinSize { dx, dy } = self.bin_size;
        if !(dx.is_finite() && dy.is_finite() && dx > 0.0 && dy > 0.0) {
            return Err(ConfigError::invalid(
                "bin_size",
                format!("{dx} x {dy} must be positive"),
            ));
        }
        for (field, interval) in [
            ("numbering.point_interval", self.numbering.point_interval),
            ("numbering.line_interval", self.numbering.line_interval),
        ] {
            if let Some(value) = interval {
                if !(value.is_finite() && value > 0.0) {
                    return Err(ConfigError::invalid(field, "must be positive"));
                }
            }
        }
        for (field, range) in [
            ("limits.inline", self.limits.inline),
            ("limits.crossline", self.limits.crossline),
            ("limits.radial", self.limits.radial),
            ("limits.azimuth", self.limits.azimuth),
        ] {
            if let Some(range) = range {
                range.check(field)?;
            }
        }
        if let Some(reflector) = &self.reflector {
            reflector.check()?;
        }
        if let UniqueFold::Buckets {
            delta_offset,
            delta_azimuth,
        } = self.unique_fold
        {
            if !(delta_offset.is_finite() && delta_offset > 0.0) {
                return Err(ConfigError::invalid(
                    "unique_fold.delta_offset",
                    "must be positive",
                ));
            }
            if !(delta_azimuth.is_finite() && delta_azimuth > 0.0) {
                return Err(ConfigError::invalid(
                    "unique_fold.delta_azimuth",
                    "must be positive",
                ));
            }
        }
        if self.chunk_records == 0 || self.chunk_records % 8 != 0 {
            return Err(ConfigError::invalid(
                "chunk_records",
                format!("{} must be a positive multiple of 8", self.chunk_records),
            ));
        }
        if self.quantum.instances == 0 {
            return Err(ConfigError::invalid("quantum.instances", "must be at least 1"));
        }
        Ok(())
    }

    pub fn grid(&self) -> BinGrid {
        BinGrid::covering(&self.output_area, self.bin_size.dx, self.bin_size.dy)
    }
}

/// Projected cost of a run: the analysis store in full mode and the
/// unique-fold tracking memory in both modes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FullModeEstimate {
    pub bins: u64,
    pub max_traces: u64,
    pub expected_fold: f64,
    pub store_bytes: u64,
    pub unique_tracking_bytes: u64,
    pub warning_bytes: u64,
}

impl FullModeEstimate {
    pub fn new(geometry: &SurveyGeometry, config: &BinningConfig) -> Self {
        let bins = config.grid().bin_count();
        let max_traces = geometry.max_trace_count();
        Self {
            bins,
            max_traces,
            expected_fold: if bins == 0 {
                0.0
            } else {
                max_traces as f64 / bins as f64
            },
            store_bytes: max_traces.saturating_mul(RECORD_BYTES as u64),
            unique_tracking_bytes: config.unique_fold.tracking_bytes(geometry, config),
            warning_bytes: config.full_mode_warning_bytes,
        }
    }

    /// Whether the run exceeds the warning threshold, counting the store
    /// only when one will be written
    pub fn is_expensive(&self, with_store: bool) -> bool {
        let store = if with_store { self.store_bytes } else { 0 };
        store.saturating_add(self.unique_tracking_bytes) > self.warning_bytes
    }

    /// Log a warning when the run would be expensive; returns whether it is
    pub fn warn_if_expensive(&self, with_store: bool) -> bool {
        let expensive = self.is_expensive(with_store);
        if expensive {
            const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
            warn!(
                bins = self.bins,
                max_traces = self.max_traces,
                expected_fold = self.expected_fold,
                store_gib = if with_store { self.store_bytes as f64 / GIB } else { 0.0 },
                unique_tracking_gib = self.unique_tracking_bytes as f64 / GIB,
                "binning run will need a large amount of memory or disk"
            );
        }
        expensive
    }
}

/// Everything needed to run a survey: geometry, configuration, the
/// coordinate transform for export and an optional point-edit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub geometry: SurveyGeometry,
    #[serde(default)]
    pub config: BinningConfig,
    #[serde(default)]
    pub transform: GridTransform,
    #[serde(default)]
    pub point_edits: Option<PathBuf>,
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl ProjectFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut project: ProjectFile =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // Relative paths inside the project resolve against its directory.
        let base = path.parent().unwrap_or(Path::new("."));
        project.point_edits = project.point_edits.map(|p| base.join(p));
        project.store_dir = Some(match project.store_dir.take() {
            Some(dir) => base.join(dir),
            None => path.with_extension("store"),
        });
        Ok(project)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BinningConfig {
        BinningConfig::new(Rect::new(0.0, 0.0, 1000.0, 500.0), 25.0, 25.0)
    }

    #[test]
    fn test_default_validates_only_with_area() {
        assert!(BinningConfig::default().validate().is_err());
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut c = config();
        c.bin_size.dx = 0.0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { field: "bin_size", .. })));

        let mut c = config();
        c.limits.radial = Some(Range::new(500.0, 100.0));
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                field: "limits.radial",
                ..
            })
        ));

        let mut c = config();
        c.chunk_records = 100;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_limits() {
        let limits = OffsetLimits {
            inline: Some(Range::new(-1000.0, 1000.0)),
            radial: Some(Range::new(0.0, 1200.0)),
            azimuth: Some(Range::new(0.0, 180.0)),
            ..OffsetLimits::default()
        };
        assert!(limits.accepts(500.0, 500.0, 707.1, Some(45.0)));
        assert!(!limits.accepts(1500.0, 0.0, 1500.0, Some(0.0)));
        assert!(!limits.accepts(-500.0, -500.0, 707.1, Some(225.0)));
        assert!(limits.accepts(0.0, 0.0, 0.0, None));
    }

    #[test]
    fn test_stake_numbering() {
        let numbering = StakeNumbering::default();
        let bins = BinSize { dx: 25.0, dy: 50.0 };
        let id = numbering.identify(0, 250.0, 100.0, &bins);
        assert_eq!(id, PointId::new(1, 1002, 1010));
        let id = numbering.identify(2, -25.0, 0.0, &bins);
        assert_eq!(id, PointId::new(3, 1000, 999));
    }

    #[test]
    fn test_reflector_and_unique_validation() {
        let mut c = config();
        c.reflector = Some(Reflector::horizontal(-5.0, 2000.0));
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                field: "reflector.depth",
                ..
            })
        ));

        let mut c = config();
        c.unique_fold = UniqueFold::Buckets {
            delta_offset: 0.0,
            delta_azimuth: 90.0,
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                field: "unique_fold.delta_offset",
                ..
            })
        ));
    }

    #[test]
    fn test_unique_method_parses() {
        let c: UniqueFold = serde_json::from_str(r#"{ "method": "buckets" }"#).unwrap();
        assert_eq!(
            c,
            UniqueFold::Buckets {
                delta_offset: DEFAULT_UNIQUE_DELTA_OFFSET,
                delta_azimuth: DEFAULT_UNIQUE_DELTA_AZIMUTH,
            }
        );
        let c: UniqueFold = serde_json::from_str(r#"{ "method": "pairs" }"#).unwrap();
        assert_eq!(c, UniqueFold::Pairs);
    }

    #[test]
    fn test_estimate_reports_unique_tracking() {
        use crate::geometry::{Block, Role, Seed, Template};

        let geometry = SurveyGeometry::new("g").with_block(
            Block::new("B").with_template(
                Template::new("T")
                    .with_roll(100, 50.0, 0.0)
                    .with_seed(Seed::new("s", Role::Source, 0.0, 0.0).with_grow(10, 0.0, 50.0))
                    .with_seed(Seed::new("r", Role::Receiver, 0.0, 0.0).with_grow(100, 50.0, 0.0)),
            ),
        );
        let mut c = config();
        let off = FullModeEstimate::new(&geometry, &c);
        assert_eq!(off.unique_tracking_bytes, 0);
        assert_eq!(off.store_bytes, 100 * 10 * 100 * RECORD_BYTES as u64);

        c.unique_fold = UniqueFold::Pairs;
        let pairs = FullModeEstimate::new(&geometry, &c);
        assert_eq!(pairs.unique_tracking_bytes, 100 * 110 * PLACEMENT_BYTES);

        c.full_mode_warning_bytes = pairs.unique_tracking_bytes - 1;
        let tight = FullModeEstimate::new(&geometry, &c);
        assert!(tight.warn_if_expensive(false));
        c.full_mode_warning_bytes = pairs.unique_tracking_bytes;
        let loose = FullModeEstimate::new(&geometry, &c);
        assert!(!loose.warn_if_expensive(false));
        assert!(loose.is_expensive(true));
    }

    #[test]
    fn test_project_file_round_trip() {
        use crate::geometry::{Block, Role, Seed, Template};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.json");
        let project = ProjectFile {
            geometry: SurveyGeometry::new("g").with_block(Block::new("B").with_template(
                Template::new("T").with_seed(Seed::new("s", Role::Source, 0.0, 0.0)),
            )),
            config: config(),
            transform: GridTransform::default(),
            point_edits: None,
            store_dir: None,
        };
        project.save(&path).unwrap();

        let loaded = ProjectFile::load(&path).unwrap();
        assert_eq!(loaded.geometry, project.geometry);
        assert_eq!(loaded.config, project.config);
        assert_eq!(loaded.store_dir, Some(dir.path().join("survey.store")));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "output_area": { "min_x": 0, "min_y": 0, "max_x": 100, "max_y": 100 } }"#;
        let c: BinningConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.bin_size, BinSize::default());
        assert_eq!(c.unique_fold, UniqueFold::Off);
        assert_eq!(c.chunk_records, DEFAULT_CHUNK_RECORDS);
    }
}
