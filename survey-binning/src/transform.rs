/// Local survey grid to projected CRS transforms
use serde::{Deserialize, Serialize};

/// Reference to the projected coordinate system rasters are exported in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrsInfo {
    pub epsg: Option<u32>,
    pub wkt: Option<String>,
}

/// Geodesy collaborator converting local grid coordinates for export.
pub trait CoordinateTransform: Send + Sync {
    fn to_projected(&self, x: f64, y: f64) -> (f64, f64);

    /// Affine approximation of the mapping, used for raster geo-referencing
    fn affine(&self) -> AffineTransform;

    fn crs(&self) -> Option<&CrsInfo>;
}

/// Homogeneous 2-D transform matrix (row-major: [x_new, y_new, 1])
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub matrix: [[f64; 3]; 3],
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub const fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub const fn translation(dx: f64, dy: f64) -> Self {
        Self {
            matrix: [[1.0, 0.0, dx], [0.0, 1.0, dy], [0.0, 0.0, 1.0]],
        }
    }

    /// Counter-clockwise rotation in degrees
    pub fn rotation(degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self {
            matrix: [[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub const fn scale(sx: f64, sy: f64) -> Self {
        Self {
            matrix: [[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// translate(origin) * rotate(azimuth) * scale(sx, sy)
    pub fn from_grid(origin_x: f64, origin_y: f64, rotation_deg: f64, sx: f64, sy: f64) -> Self {
        Self::translation(origin_x, origin_y)
            .then(&Self::rotation(rotation_deg))
            .then(&Self::scale(sx, sy))
    }

    /// `self * inner`: apply `inner` first, then `self`
    pub fn then(&self, inner: &AffineTransform) -> Self {
        let mut output = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    output[i][j] += self.matrix[i][k] * inner.matrix[k][j];
                }
            }
        }
        Self { matrix: output }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let input = [x, y, 1.0];
        let mut output = [0.0; 2];

        for i in 0..2 {
            for j in 0..3 {
                output[i] += self.matrix[i][j] * input[j];
            }
        }

        (output[0], output[1])
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.matrix;
        m[0][0] * m[1][1] - m[0][1] * m[1][0]
    }

    /// `None` for singular transforms
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let m = &self.matrix;
        let a = m[1][1] / det;
        let b = -m[0][1] / det;
        let d = -m[1][0] / det;
        let e = m[0][0] / det;
        let c = -(a * m[0][2] + b * m[1][2]);
        let f = -(d * m[0][2] + e * m[1][2]);
        Some(Self {
            matrix: [[a, b, c], [d, e, f], [0.0, 0.0, 1.0]],
        })
    }
}

/// Affine grid-to-CRS mapping supplied alongside a project.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridTransform {
    pub affine: AffineTransform,
    pub crs: Option<CrsInfo>,
}

impl GridTransform {
    pub fn new(affine: AffineTransform, crs: Option<CrsInfo>) -> Self {
        Self { affine, crs }
    }
}

impl CoordinateTransform for GridTransform {
    fn to_projected(&self, x: f64, y: f64) -> (f64, f64) {
        self.affine.apply(x, y)
    }

    fn affine(&self) -> AffineTransform {
        self.affine
    }

    fn crs(&self) -> Option<&CrsInfo> {
        self.crs.as_ref()
    }
}
