/// Defaults shared by geometry validation and the binning engine

/// First stake number assigned along a receiver or source line
pub const DEFAULT_STAKE_ORIGIN: f64 = 1000.0;

/// First line number assigned across lines
pub const DEFAULT_LINE_ORIGIN: f64 = 1000.0;

/// Interval velocity (m/s) used for two-way-time lookup
pub const DEFAULT_INTERVAL_VELOCITY: f64 = 2000.0;

/// Maximum number of grow or roll steps on a seed or template
pub const MAX_STEP_DEPTH: usize = 3;

/// Default bin size (m) along both grid axes
pub const DEFAULT_BIN_SIZE: f64 = 25.0;

/// Template instances processed between cancellation checks
pub const DEFAULT_QUANTUM_INSTANCES: u64 = 64;

/// Wall-clock budget (ms) between cancellation checks
pub const DEFAULT_QUANTUM_MILLIS: u64 = 250;

/// Estimated full-mode store size (bytes) above which a run warns
pub const FULL_MODE_WARNING_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Full azimuth range in degrees
pub const FULL_CIRCLE_DEGREES: f64 = 360.0;

/// Offset bucket (m) for unique fold by offset/azimuth buckets
pub const DEFAULT_UNIQUE_DELTA_OFFSET: f64 = 200.0;

/// Azimuth bucket (degrees) for unique fold by offset/azimuth buckets
pub const DEFAULT_UNIQUE_DELTA_AZIMUTH: f64 = 180.0;

/// Largest angle of incidence (degrees) accepted on dipping and curved reflectors
pub const DEFAULT_MAX_REFLECTION_ANGLE: f64 = 45.0;
