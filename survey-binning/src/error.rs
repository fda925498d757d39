//! Error types for geometry validation, configuration, the analysis store,
//! binning runs and raster export.

use std::fmt;
use std::path::PathBuf;

use crate::geometry::{Role, StepKind};

/// Location of an entity inside the geometry hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryPath {
    pub block: Option<String>,
    pub template: Option<String>,
    pub seed: Option<String>,
    pub pattern: Option<String>,
}

impl GeometryPath {
    pub fn block(name: &str) -> Self {
        Self {
            block: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn template(&self, name: &str) -> Self {
        Self {
            template: Some(name.to_string()),
            ..self.clone()
        }
    }

    pub fn seed(&self, name: &str) -> Self {
        Self {
            seed: Some(name.to_string()),
            ..self.clone()
        }
    }

    pub fn pattern(name: &str) -> Self {
        Self {
            pattern: Some(name.to_string()),
            ..Self::default()
        }
    }
}

impl fmt::Display for GeometryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("block", &self.block),
            ("template", &self.template),
            ("seed", &self.seed),
            ("pattern", &self.pattern),
        ]
        .iter()
        .filter_map(|(label, name)| name.as_ref().map(|n| format!("{label} '{n}'")))
        .collect();

        if parts.is_empty() {
            write!(f, "geometry")
        } else {
            write!(f, "{}", parts.join(" / "))
        }
    }
}

/// Rejections raised before any run starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("geometry has no blocks")]
    NoBlocks,
    #[error("{path}: {kind} list has {depth} steps, at most {max} allowed")]
    StepDepth {
        path: GeometryPath,
        kind: StepKind,
        depth: usize,
        max: usize,
    },
    #[error("{path}: {kind} step {index} has count {count}, must be at least 1")]
    StepCount {
        path: GeometryPath,
        kind: StepKind,
        index: usize,
        count: i32,
    },
    #[error("{path}: {role} border is degenerate ({width} x {height})")]
    DegenerateBorder {
        path: GeometryPath,
        role: Role,
        width: f64,
        height: f64,
    },
    #[error("{path}: contains no templates")]
    EmptyBlock { path: GeometryPath },
    #[error("{path}: contains no seeds")]
    MissingSeeds { path: GeometryPath },
    #[error("{path}: references unknown pattern {pattern}")]
    UnknownPattern { path: GeometryPath, pattern: usize },
    #[error("{path}: {field} is not finite")]
    NonFinite {
        path: GeometryPath,
        field: &'static str,
    },
    #[error("{path}: name is empty")]
    MissingName { path: GeometryPath },
    #[error("{path}: {reason}")]
    InvalidShape { path: GeometryPath, reason: String },
    #[error("{path}: {what} overflows")]
    TooLarge {
        path: GeometryPath,
        what: &'static str,
    },
}

impl GeometryError {
    /// Hierarchy location of the offending entity
    pub fn path(&self) -> Option<&GeometryPath> {
        match self {
            GeometryError::NoBlocks => None,
            GeometryError::StepDepth { path, .. }
            | GeometryError::StepCount { path, .. }
            | GeometryError::DegenerateBorder { path, .. }
            | GeometryError::EmptyBlock { path }
            | GeometryError::MissingSeeds { path }
            | GeometryError::UnknownPattern { path, .. }
            | GeometryError::NonFinite { path, .. }
            | GeometryError::MissingName { path }
            | GeometryError::InvalidShape { path, .. }
            | GeometryError::TooLarge { path, .. } => Some(path),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store at {0} is locked by another writer")]
    Locked(PathBuf),
    #[error("store at {path} is open in {readers} reader(s)")]
    InUse { path: PathBuf, readers: usize },
    #[error("store was rewritten since it was opened (generation {opened}, now {current}, state {state})")]
    Changed {
        opened: u64,
        current: u64,
        state: String,
    },
    #[error("no store found at {0}")]
    NotFound(PathBuf),
    #[error("store is not complete (state: {state})")]
    NotComplete { state: String },
    #[error("store was written for geometry {found}, expected {expected}")]
    Stale { expected: String, found: String },
    #[error("store format version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("bin index covers {indexed} records but the store holds {records}; rebuild required")]
    IndexMismatch { indexed: u64, records: u64 },
    #[error("bin index is corrupt: {0}; rebuild required")]
    IndexCorrupt(String),
    #[error("cannot resume store: {0}")]
    Resume(String),
    #[error("bin ({inline}, {crossline}) is outside the {nx} x {ny} grid")]
    BinOutOfRange {
        inline: u32,
        crossline: u32,
        nx: u32,
        ny: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BinningError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkpoint belongs to run {found}, expected {expected}")]
    CheckpointMismatch { expected: String, found: String },
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint format error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("full mode requires a store directory")]
    FullModeRequiresStore,
    #[error("binning worker thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("EXR encoding failed: {0}")]
    Exr(#[from] exr::error::Error),
    #[error("sidecar encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("raster {0} has no cells")]
    EmptyRaster(String),
}
