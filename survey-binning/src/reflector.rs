//! Subsurface reflectors used to place traces and compute two-way time.
//!
//! A horizontal reflector bins every trace at its midpoint. Dipping planes
//! and spheres move the binning point to the reflection point and drop
//! pairs whose angle of incidence falls outside the accepted range.
//! Positions are in survey metres with z up; stations sit at z = 0.

use std::ops::{Add, Mul, Sub};

use constants::binning::{DEFAULT_INTERVAL_VELOCITY, DEFAULT_MAX_REFLECTION_ANGLE};
use serde::{Deserialize, Serialize};

use crate::bounds::Coord;
use crate::config::Range;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn surface(c: &Coord) -> Self {
        Self::new(c.x, c.y, 0.0)
    }

    fn dot(&self, other: &Point3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    fn length(&self) -> f64 {
        self.dot(self).sqrt()
    }

    fn unit(&self) -> Option<Point3> {
        let len = self.length();
        (len > 0.0).then(|| *self * (1.0 / len))
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Point3 {
    type Output = Point3;

    fn add(self, rhs: Point3) -> Point3 {
        Point3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point3 {
    type Output = Point3;

    fn sub(self, rhs: Point3) -> Point3 {
        Point3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Point3 {
    type Output = Point3;

    fn mul(self, rhs: f64) -> Point3 {
        Point3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

fn default_velocity() -> f64 {
    DEFAULT_INTERVAL_VELOCITY
}

fn default_angles() -> Range {
    Range::new(0.0, DEFAULT_MAX_REFLECTION_ANGLE)
}

/// Where a trace reflects and how long the path takes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reflection {
    /// Surface projection of the reflection point
    pub point: Coord,
    pub twt_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reflector {
    /// Flat reflector `depth` metres below the stations
    Horizontal {
        depth: f64,
        #[serde(default = "default_velocity")]
        velocity: f64,
    },
    /// Plane through `anchor`, dipping by `dip` degrees towards `azimuth`
    /// (degrees counter-clockwise from the x axis)
    Plane {
        anchor: Point3,
        #[serde(default)]
        azimuth: f64,
        #[serde(default)]
        dip: f64,
        #[serde(default = "default_velocity")]
        velocity: f64,
        #[serde(default = "default_angles")]
        angles: Range,
    },
    /// Sphere reflecting on its outer surface
    Sphere {
        center: Point3,
        radius: f64,
        #[serde(default = "default_velocity")]
        velocity: f64,
        #[serde(default = "default_angles")]
        angles: Range,
    },
}

impl Reflector {
    pub fn horizontal(depth: f64, velocity: f64) -> Self {
        Reflector::Horizontal { depth, velocity }
    }

    pub fn velocity(&self) -> f64 {
        match *self {
            Reflector::Horizontal { velocity, .. }
            | Reflector::Plane { velocity, .. }
            | Reflector::Sphere { velocity, .. } => velocity,
        }
    }

    /// Reflection of the ray from `src` to `rec`, or `None` when the pair
    /// has no reflection within the accepted angles
    pub fn reflect(&self, src: &Coord, rec: &Coord) -> Option<Reflection> {
        let ms_per_metre = 1000.0 / self.velocity();
        match *self {
            Reflector::Horizontal { depth, .. } => {
                let half = 0.5 * src.distance(rec);
                Some(Reflection {
                    point: src.midpoint(rec),
                    twt_ms: 2.0 * (depth * depth + half * half).sqrt() * ms_per_metre,
                })
            }
            Reflector::Plane {
                anchor,
                azimuth,
                dip,
                angles,
                ..
            } => {
                let (azi, dip) = (azimuth.to_radians(), dip.to_radians());
                let normal = Point3::new(dip.sin() * azi.cos(), dip.sin() * azi.sin(), dip.cos());
                let dist = -normal.dot(&anchor);
                let (s, r) = (Point3::surface(src), Point3::surface(rec));

                // Mirror the source in the plane; the straight path from the
                // mirror to the receiver crosses the plane at the reflection.
                let mirror = s - normal * (2.0 * (normal.dot(&s) + dist));
                let ray = r - mirror;
                let denom = normal.dot(&ray);
                if denom == 0.0 {
                    return None;
                }
                let u = (normal.dot(&r) + dist) / denom;
                if !(0.0..=1.0).contains(&u) {
                    return None;
                }
                let path = ray.length();
                let incidence = (denom / path).clamp(-1.0, 1.0).acos().to_degrees();
                if !angles.contains(incidence) {
                    return None;
                }
                let point = r - ray * u;
                Some(Reflection {
                    point: Coord::new(point.x, point.y),
                    twt_ms: path * ms_per_metre,
                })
            }
            Reflector::Sphere {
                center,
                radius,
                angles,
                ..
            } => {
                let (s, r) = (Point3::surface(src), Point3::surface(rec));
                let to_src = (s - center).unit()?;
                let to_rec = (r - center).unit()?;
                let bisector = ((to_src + to_rec) * 0.5).unit()?;
                let point = center + bisector * radius;
                let incoming = (s - point).unit()?;
                let incidence = bisector.dot(&incoming).clamp(-1.0, 1.0).acos().to_degrees();
                if !angles.contains(incidence) {
                    return None;
                }
                Some(Reflection {
                    point: Coord::new(point.x, point.y),
                    twt_ms: ((s - point).length() + (r - point).length()) * ms_per_metre,
                })
            }
        }
    }

    pub(crate) fn check(&self) -> Result<(), ConfigError> {
        let velocity = self.velocity();
        if !(velocity.is_finite() && velocity > 0.0) {
            return Err(ConfigError::invalid("reflector.velocity", "must be positive"));
        }
        match *self {
            Reflector::Horizontal { depth, .. } => {
                if !(depth.is_finite() && depth >= 0.0) {
                    return Err(ConfigError::invalid("reflector.depth", "must be non-negative"));
                }
            }
            Reflector::Plane {
                anchor,
                azimuth,
                dip,
                angles,
                ..
            } => {
                if !(anchor.is_finite() && azimuth.is_finite()) {
                    return Err(ConfigError::invalid("reflector.anchor", "must be finite"));
                }
                if !(dip.is_finite() && dip.abs() < 90.0) {
                    return Err(ConfigError::invalid(
                        "reflector.dip",
                        format!("{dip} must lie strictly between -90 and 90 degrees"),
                    ));
                }
                angles.check("reflector.angles")?;
            }
            Reflector::Sphere {
                center,
                radius,
                angles,
                ..
            } => {
                if !center.is_finite() {
                    return Err(ConfigError::invalid("reflector.center", "must be finite"));
                }
                if !(radius.is_finite() && radius > 0.0) {
                    return Err(ConfigError::invalid("reflector.radius", "must be positive"));
                }
                if center.z + radius >= 0.0 {
                    return Err(ConfigError::invalid(
                        "reflector.radius",
                        "sphere must lie below the stations",
                    ));
                }
                angles.check("reflector.angles")?;
            }
        }
        Ok(())
    }
}
