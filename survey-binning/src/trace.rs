/// Point identities, per-trace geometry and the stored trace record
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bounds::Coord;
use crate::geometry::Role;
use crate::grid::BinAddress;

/// Stable point identity: block index, line number and stake number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PointId {
    pub index: u16,
    pub line: i32,
    pub point: i32,
}

impl PointId {
    pub const fn new(index: u16, line: i32, point: i32) -> Self {
        Self { index, line, point }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.index, self.line, self.point)
    }
}

/// A point ready for pairing, after edits and border clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurveyPoint {
    pub id: PointId,
    pub role: Role,
    pub position: Coord,
    pub azimuth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TraceFlags(pub u8);

impl TraceFlags {
    pub const ACTIVE: TraceFlags = TraceFlags(1);
    pub const UNIQUE: TraceFlags = TraceFlags(1 << 1);
    pub const AZIMUTH_UNDEFINED: TraceFlags = TraceFlags(1 << 2);
    pub const SRC_DIRECTIONAL: TraceFlags = TraceFlags(1 << 3);
    pub const REC_DIRECTIONAL: TraceFlags = TraceFlags(1 << 4);

    pub fn contains(self, other: TraceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: TraceFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for TraceFlags {
    type Output = TraceFlags;

    fn bitor(self, rhs: TraceFlags) -> TraceFlags {
        TraceFlags(self.0 | rhs.0)
    }
}

/// Midpoint, offset and azimuth of a source/receiver pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceGeometry {
    pub cmp: Coord,
    pub dx: f64,
    pub dy: f64,
    pub offset: f64,
    /// `None` when source and receiver coincide
    pub azimuth: Option<f64>,
}

impl TraceGeometry {
    pub fn between(src: &Coord, rec: &Coord) -> Self {
        let dx = rec.x - src.x;
        let dy = rec.y - src.y;
        let offset = dx.hypot(dy);
        Self {
            cmp: src.midpoint(rec),
            dx,
            dy,
            offset,
            azimuth: azimuth_degrees(dx, dy),
        }
    }
}

/// atan2(dy, dx) in degrees normalised to [0, 360)
pub fn azimuth_degrees(dx: f64, dy: f64) -> Option<f64> {
    if dx == 0.0 && dy == 0.0 {
        return None;
    }
    let mut degrees = dy.atan2(dx).to_degrees();
    if degrees < 0.0 {
        degrees += 360.0;
    }
    if degrees >= 360.0 {
        degrees -= 360.0;
    }
    Some(degrees)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRecord {
    pub bin: BinAddress,
    pub src_id: PointId,
    pub rec_id: PointId,
    pub src: Coord,
    pub rec: Coord,
    /// Binning point: the midpoint, or the reflection point on a dipping
    /// or curved reflector
    pub cmp: Coord,
    pub offset: f64,
    pub azimuth: Option<f32>,
    pub twt_ms: f32,
    pub flags: TraceFlags,
}

impl TraceRecord {
    pub fn is_unique(&self) -> bool {
        self.flags.contains(TraceFlags::UNIQUE)
    }

    /// Receiver minus source
    pub fn offset_vector(&self) -> (f64, f64) {
        (self.rec.x - self.src.x, self.rec.y - self.src.y)
    }
}
