//! Typed, immutable description of a survey layout.
//!
//! A survey is a list of blocks. Each block owns templates, each template
//! owns seeds, and each seed is replicated by up to three grow steps while
//! its template is replicated by up to three roll steps. Patterns describe
//! the array response of a seed and are referenced by index.

use std::f64::consts::PI;
use std::fmt;

use constants::binning::MAX_STEP_DEPTH;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bounds::{Coord, Rect};
use crate::error::{GeometryError, GeometryPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Grow,
    Roll,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Grow => write!(f, "grow"),
            StepKind::Roll => write!(f, "roll"),
        }
    }
}

/// One replication dimension: `count` copies spaced by (dx, dy).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub count: i32,
    pub dx: f64,
    pub dy: f64,
}

pub type GrowStep = Step;
pub type RollStep = Step;

impl Step {
    pub const fn new(count: i32, dx: f64, dy: f64) -> Self {
        Self { count, dx, dy }
    }

    /// A count of one is the identity step
    pub fn replicates(&self) -> bool {
        self.count > 1
    }
}

/// Layout of the points a seed places around its origin.
///
/// Grid seeds are replicated by their grow steps. Circle and spiral seeds
/// place points at a fixed arc-length `interval` (negative runs clockwise)
/// and take no grow steps. Azimuths are in degrees, counter-clockwise
/// from the x axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeedShape {
    #[default]
    Grid,
    Circle {
        radius: f64,
        #[serde(default)]
        start_azimuth: f64,
        interval: f64,
    },
    /// Archimedean spiral whose radius grows by `radius_step` per turn
    Spiral {
        min_radius: f64,
        max_radius: f64,
        radius_step: f64,
        #[serde(default)]
        start_azimuth: f64,
        interval: f64,
    },
}

impl SeedShape {
    pub fn is_grid(&self) -> bool {
        matches!(self, SeedShape::Grid)
    }

    /// Points placed by a circle or spiral; `None` for grids
    pub fn point_count(&self) -> Option<u64> {
        match *self {
            SeedShape::Grid => None,
            SeedShape::Circle {
                radius, interval, ..
            } => {
                if interval == 0.0 {
                    return Some(1);
                }
                Some(((2.0 * PI * radius / interval.abs()).floor() as u64).max(1))
            }
            SeedShape::Spiral {
                min_radius,
                max_radius,
                radius_step,
                interval,
                ..
            } => {
                if radius_step <= 0.0 || interval == 0.0 {
                    return Some(1);
                }
                let c = radius_step / (2.0 * PI);
                let span = spiral_arc(max_radius / c, c) - spiral_arc(min_radius / c, c);
                Some((span / interval.abs()).floor().max(0.0) as u64)
            }
        }
    }

    /// Position of point `n` relative to the seed origin
    pub fn offset(&self, n: u32) -> (f64, f64) {
        match *self {
            SeedShape::Grid => (0.0, 0.0),
            SeedShape::Circle {
                radius,
                start_azimuth,
                interval,
            } => {
                let angle = start_azimuth.to_radians() + n as f64 * interval / radius;
                (radius * angle.cos(), radius * angle.sin())
            }
            SeedShape::Spiral {
                min_radius,
                radius_step,
                start_azimuth,
                interval,
                ..
            } => {
                let c = radius_step / (2.0 * PI);
                let arc = spiral_arc(min_radius / c, c) + n as f64 * interval.abs();
                let theta = spiral_angle(arc, c);
                let angle = start_azimuth.to_radians() + theta.copysign(interval);
                let r = c * theta;
                (r * angle.cos(), r * angle.sin())
            }
        }
    }

    fn check(&self) -> Result<(), String> {
        let fields = match *self {
            SeedShape::Grid => return Ok(()),
            SeedShape::Circle {
                radius,
                start_azimuth,
                interval,
            } => vec![radius, start_azimuth, interval],
            SeedShape::Spiral {
                min_radius,
                max_radius,
                radius_step,
                start_azimuth,
                interval,
            } => vec![min_radius, max_radius, radius_step, start_azimuth, interval],
        };
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("shape parameters must be finite".into());
        }
        match *self {
            SeedShape::Grid => Ok(()),
            SeedShape::Circle {
                radius, interval, ..
            } => {
                if radius <= 0.0 {
                    Err(format!("circle radius {radius} must be positive"))
                } else if interval == 0.0 {
                    Err("circle interval must be non-zero".into())
                } else {
                    Ok(())
                }
            }
            SeedShape::Spiral {
                min_radius,
                max_radius,
                radius_step,
                interval,
                ..
            } => {
                if min_radius < 0.0 || max_radius <= min_radius {
                    Err(format!(
                        "spiral radii {min_radius}..{max_radius} must be non-negative and increasing"
                    ))
                } else if radius_step <= 0.0 {
                    Err(format!("spiral radius step {radius_step} must be positive"))
                } else if interval == 0.0 {
                    Err("spiral interval must be non-zero".into())
                } else if self.point_count() == Some(0) {
                    Err("spiral is shorter than one interval".into())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Arc length of the spiral r = c * theta from its centre to `theta`
fn spiral_arc(theta: f64, c: f64) -> f64 {
    let root = (1.0 + theta * theta).sqrt();
    0.5 * c * (theta * root + (theta + root).ln())
}

/// Inverse of [`spiral_arc`] by Newton iteration
fn spiral_angle(arc: f64, c: f64) -> f64 {
    let mut theta = (2.0 * arc / c).sqrt();
    for _ in 0..8 {
        let error = spiral_arc(theta, c) - arc;
        if error.abs() < 1.0e-6 {
            break;
        }
        theta -= error / (c * (1.0 + theta * theta).sqrt());
    }
    theta
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub name: String,
    pub origin: Coord,
    pub role: Role,
    /// Orient the seed's pattern along each trace azimuth
    #[serde(default)]
    pub azimuth: bool,
    #[serde(default)]
    pub pattern: Option<usize>,
    #[serde(default)]
    pub shape: SeedShape,
    #[serde(default)]
    pub grow: Vec<GrowStep>,
}

impl Seed {
    pub fn new(name: &str, role: Role, x: f64, y: f64) -> Self {
        Self {
            name: name.to_string(),
            origin: Coord::new(x, y),
            role,
            azimuth: false,
            pattern: None,
            shape: SeedShape::Grid,
            grow: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: SeedShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_grow(mut self, count: i32, dx: f64, dy: f64) -> Self {
        self.grow.push(Step::new(count, dx, dy));
        self
    }

    pub fn with_pattern(mut self, pattern: usize) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_azimuth(mut self, azimuth: bool) -> Self {
        self.azimuth = azimuth;
        self
    }

    /// Points this seed occupies in one template instance
    pub fn point_count(&self) -> u64 {
        self.checked_point_count().unwrap_or(u64::MAX)
    }

    fn checked_point_count(&self) -> Option<u64> {
        match self.shape.point_count() {
            Some(n) => Some(n),
            None => step_product(&self.grow),
        }
    }

    /// Steps the lattice cursor walks: the grow list for grids, one
    /// dimension of `point_count` for shaped seeds
    pub fn lattice_steps(&self) -> Vec<Step> {
        match self.shape.point_count() {
            None => self.grow.clone(),
            Some(n) => vec![Step::new(i32::try_from(n).unwrap_or(i32::MAX), 0.0, 0.0)],
        }
    }

    /// Position of lattice point `index` relative to the seed origin
    pub fn offset_of(&self, index: &crate::lattice::MultiIndex) -> (f64, f64) {
        if self.shape.is_grid() {
            index.offset(&self.grow)
        } else {
            self.shape.offset(index.0[0])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub roll: Vec<RollStep>,
    pub seeds: Vec<Seed>,
}

impl Template {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            roll: Vec::new(),
            seeds: Vec::new(),
        }
    }

    pub fn with_roll(mut self, count: i32, dx: f64, dy: f64) -> Self {
        self.roll.push(Step::new(count, dx, dy));
        self
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seeds.push(seed);
        self
    }

    pub fn instance_count(&self) -> u64 {
        step_product(&self.roll).unwrap_or(u64::MAX)
    }

    /// Points of one role generated by a single instance
    pub fn points_per_instance(&self, role: Role) -> u64 {
        self.checked_points_per_instance(role).unwrap_or(u64::MAX)
    }

    fn checked_points_per_instance(&self, role: Role) -> Option<u64> {
        self.seeds
            .iter()
            .filter(|s| s.role == role)
            .try_fold(0u64, |acc, s| acc.checked_add(s.checked_point_count()?))
    }

    /// Traces formed by all instances before clipping, or `None` on overflow
    fn checked_trace_count(&self) -> Option<u64> {
        step_product(&self.roll)?
            .checked_mul(self.checked_points_per_instance(Role::Source)?)?
            .checked_mul(self.checked_points_per_instance(Role::Receiver)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    /// `None` leaves sources unclipped
    #[serde(default)]
    pub source_border: Option<Rect>,
    #[serde(default)]
    pub receiver_border: Option<Rect>,
    pub templates: Vec<Template>,
}

impl Block {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source_border: None,
            receiver_border: None,
            templates: Vec::new(),
        }
    }

    pub fn with_borders(mut self, source: Option<Rect>, receiver: Option<Rect>) -> Self {
        self.source_border = source;
        self.receiver_border = receiver;
        self
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    pub fn border(&self, role: Role) -> Option<&Rect> {
        match role {
            Role::Source => self.source_border.as_ref(),
            Role::Receiver => self.receiver_border.as_ref(),
        }
    }

    /// Whether a point of `role` at (x, y) survives border clipping
    pub fn admits(&self, role: Role, x: f64, y: f64) -> bool {
        self.border(role).is_none_or(|border| border.contains(x, y))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSeed {
    pub origin: Coord,
    #[serde(default)]
    pub grow: Vec<GrowStep>,
}

/// Array of elements summed into one source or receiver station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub seeds: Vec<PatternSeed>,
}

impl Pattern {
    pub fn element_count(&self) -> u64 {
        self.seeds
            .iter()
            .try_fold(0u64, |acc, s| acc.checked_add(step_product(&s.grow)?))
            .unwrap_or(u64::MAX)
    }
}

/// Rules applied by [`SurveyGeometry::validate_with`]. Depths above
/// `MAX_STEP_DEPTH` are capped, since lattice indices have three slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRules {
    pub max_grow_depth: usize,
    pub max_roll_depth: usize,
}

impl Default for GeometryRules {
    fn default() -> Self {
        Self {
            max_grow_depth: MAX_STEP_DEPTH,
            max_roll_depth: MAX_STEP_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyGeometry {
    pub name: String,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

impl SurveyGeometry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blocks: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        self.validate_with(&GeometryRules::default())
    }

    /// Check every block, template, seed and pattern; the first violation
    /// is returned with its location in the hierarchy.
    pub fn validate_with(&self, rules: &GeometryRules) -> Result<(), GeometryError> {
        if self.blocks.is_empty() {
            return Err(GeometryError::NoBlocks);
        }
        let max_grow = rules.max_grow_depth.min(MAX_STEP_DEPTH);
        let max_roll = rules.max_roll_depth.min(MAX_STEP_DEPTH);

        for block in &self.blocks {
            let block_path = GeometryPath::block(&block.name);
            if block.name.trim().is_empty() {
                return Err(GeometryError::MissingName { path: block_path });
            }
            for role in [Role::Source, Role::Receiver] {
                if let Some(border) = block.border(role) {
                    if border.is_degenerate() {
                        return Err(GeometryError::DegenerateBorder {
                            path: block_path,
                            role,
                            width: border.width(),
                            height: border.height(),
                        });
                    }
                }
            }
            if block.templates.is_empty() {
                return Err(GeometryError::EmptyBlock { path: block_path });
            }

            for template in &block.templates {
                let template_path = block_path.template(&template.name);
                check_steps(&template_path, StepKind::Roll, &template.roll, max_roll)?;
                if template.seeds.is_empty() {
                    return Err(GeometryError::MissingSeeds {
                        path: template_path,
                    });
                }
                if step_product(&template.roll).is_none() {
                    return Err(GeometryError::TooLarge {
                        path: template_path,
                        what: "roll instance count",
                    });
                }

                for seed in &template.seeds {
                    let seed_path = template_path.seed(&seed.name);
                    if !seed.origin.is_finite() {
                        return Err(GeometryError::NonFinite {
                            path: seed_path,
                            field: "origin",
                        });
                    }
                    check_steps(&seed_path, StepKind::Grow, &seed.grow, max_grow)?;
                    if let Err(reason) = seed.shape.check() {
                        return Err(GeometryError::InvalidShape {
                            path: seed_path,
                            reason,
                        });
                    }
                    if !seed.shape.is_grid() && !seed.grow.is_empty() {
                        return Err(GeometryError::InvalidShape {
                            path: seed_path,
                            reason: "grow steps apply to grid seeds only".into(),
                        });
                    }
                    if seed.checked_point_count().is_none_or(|n| n > i32::MAX as u64) {
                        return Err(GeometryError::TooLarge {
                            path: seed_path,
                            what: "seed point count",
                        });
                    }
                    if let Some(pattern) = seed.pattern {
                        if pattern >= self.patterns.len() {
                            return Err(GeometryError::UnknownPattern {
                                path: seed_path,
                                pattern,
                            });
                        }
                    }
                }
            }
        }

        for pattern in &self.patterns {
            let path = GeometryPath::pattern(&pattern.name);
            if pattern.seeds.is_empty() {
                return Err(GeometryError::MissingSeeds { path });
            }
            for seed in &pattern.seeds {
                if !seed.origin.is_finite() {
                    return Err(GeometryError::NonFinite {
                        path,
                        field: "origin",
                    });
                }
                check_steps(&path, StepKind::Grow, &seed.grow, max_grow)?;
            }
        }

        // Per-template products were checked above; the totals can still wrap.
        if self.checked_total_traces().is_none() {
            return Err(GeometryError::TooLarge {
                path: GeometryPath::default(),
                what: "trace count",
            });
        }

        Ok(())
    }

    /// Total template instances across all blocks
    pub fn instance_count(&self) -> u64 {
        self.blocks
            .iter()
            .flat_map(|b| &b.templates)
            .fold(0u64, |acc, t| acc.saturating_add(t.instance_count()))
    }

    /// Points generated for a role before clipping and deduplication
    pub fn generated_point_count(&self, role: Role) -> u64 {
        self.blocks
            .iter()
            .flat_map(|b| &b.templates)
            .fold(0u64, |acc, t| {
                acc.saturating_add(t.instance_count().saturating_mul(t.points_per_instance(role)))
            })
    }

    /// Upper bound on traces formed: per instance, sources times receivers.
    /// Saturates for geometries that fail validation.
    pub fn max_trace_count(&self) -> u64 {
        self.checked_total_traces().unwrap_or(u64::MAX)
    }

    fn checked_total_traces(&self) -> Option<u64> {
        self.blocks
            .iter()
            .flat_map(|b| &b.templates)
            .try_fold(0u64, |acc, t| acc.checked_add(t.checked_trace_count()?))
    }

    /// SHA-256 of the canonical JSON form; any edit changes it
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        // Serialising plain data with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hex_digest(hasher)
    }
}

pub(crate) fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn step_product(steps: &[Step]) -> Option<u64> {
    steps
        .iter()
        .try_fold(1u64, |acc, s| acc.checked_mul(s.count.max(0) as u64))
}

fn check_steps(
    path: &GeometryPath,
    kind: StepKind,
    steps: &[Step],
    max: usize,
) -> Result<(), GeometryError> {
    if steps.len() > max {
        return Err(GeometryError::StepDepth {
            path: path.clone(),
            kind,
            depth: steps.len(),
            max,
        });
    }
    for (index, step) in steps.iter().enumerate() {
        if step.count < 1 {
            return Err(GeometryError::StepCount {
                path: path.clone(),
                kind,
                index,
                count: step.count,
            });
        }
        if !(step.dx.is_finite() && step.dy.is_finite()) {
            return Err(GeometryError::NonFinite {
                path: path.clone(),
                field: "step increment",
            });
        }
    }
    Ok(())
}
