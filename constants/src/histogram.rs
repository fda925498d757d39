/// Bucket widths for trace-level analysis outputs

/// Offset histogram bucket width (m)
pub const OFFSET_HISTOGRAM_STEP: f64 = 50.0;

/// Angular bucket width (degrees) of the offset/azimuth histogram
pub const OFFAZI_AZIMUTH_STEP: f64 = 5.0;

/// Offset bucket width (m) of the offset/azimuth histogram
pub const OFFAZI_OFFSET_STEP: f64 = 100.0;

/// Wavenumber samples per axis for stack-response grids
pub const STACK_RESPONSE_SAMPLES: usize = 101;

/// Floor (dB) for stack and pattern responses
pub const RESPONSE_FLOOR_DB: f64 = -60.0;

/// Largest wavenumber (cycles per metre) of stack-response grids
pub const DEFAULT_K_MAX: f64 = 0.05;
