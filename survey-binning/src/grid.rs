/// Fixed-size bin grid over the output area
use serde::{Deserialize, Serialize};

use crate::bounds::{Coord, Rect};

/// Integer bin address; `inline` counts along x, `crossline` along y.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BinAddress {
    pub inline: u32,
    pub crossline: u32,
}

impl BinAddress {
    pub const fn new(inline: u32, crossline: u32) -> Self {
        Self { inline, crossline }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinGrid {
    pub origin: Coord,
    pub bin_dx: f64,
    pub bin_dy: f64,
    pub nx: u32,
    pub ny: u32,
}

impl BinGrid {
    /// Grid covering `area` from its lower-left corner, rounding partial bins up
    pub fn covering(area: &Rect, bin_dx: f64, bin_dy: f64) -> Self {
        Self {
            origin: Coord::new(area.min_x, area.min_y),
            bin_dx,
            bin_dy,
            nx: (area.width() / bin_dx).ceil().max(0.0) as u32,
            ny: (area.height() / bin_dy).ceil().max(0.0) as u32,
        }
    }

    pub fn bin_count(&self) -> u64 {
        self.nx as u64 * self.ny as u64
    }

    /// floor((p - origin) / bin size) per axis, `None` outside the grid
    pub fn address(&self, x: f64, y: f64) -> Option<BinAddress> {
        let fx = ((x - self.origin.x) / self.bin_dx).floor();
        let fy = ((y - self.origin.y) / self.bin_dy).floor();
        if !(fx >= 0.0 && fy >= 0.0 && fx < self.nx as f64 && fy < self.ny as f64) {
            return None;
        }
        Some(BinAddress::new(fx as u32, fy as u32))
    }

    pub fn contains(&self, address: BinAddress) -> bool {
        address.inline < self.nx && address.crossline < self.ny
    }

    /// Row-major cell number, crossline rows of `nx` cells
    pub fn linear(&self, address: BinAddress) -> u64 {
        address.crossline as u64 * self.nx as u64 + address.inline as u64
    }

    pub fn from_linear(&self, linear: u64) -> BinAddress {
        let nx = self.nx.max(1) as u64;
        BinAddress::new((linear % nx) as u32, (linear / nx) as u32)
    }

    pub fn cell_center(&self, address: BinAddress) -> Coord {
        Coord::new(
            self.origin.x + (address.inline as f64 + 0.5) * self.bin_dx,
            self.origin.y + (address.crossline as f64 + 0.5) * self.bin_dy,
        )
    }

    pub fn area(&self) -> Rect {
        Rect::new(
            self.origin.x,
            self.origin.y,
            self.origin.x + self.nx as f64 * self.bin_dx,
            self.origin.y + self.ny as f64 * self.bin_dy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_rounds_up() {
        let grid = BinGrid::covering(&Rect::new(100.0, 200.0, 1110.0, 700.0), 25.0, 25.0);
        assert_eq!((grid.nx, grid.ny), (41, 20));
        assert_eq!(grid.bin_count(), 820);
    }

    #[test]
    fn test_address_floor() {
        let grid = BinGrid::covering(&Rect::new(0.0, 0.0, 100.0, 100.0), 25.0, 50.0);
        assert_eq!(grid.address(0.0, 0.0), Some(BinAddress::new(0, 0)));
        assert_eq!(grid.address(24.999, 49.999), Some(BinAddress::new(0, 0)));
        assert_eq!(grid.address(25.0, 50.0), Some(BinAddress::new(1, 1)));
        assert_eq!(grid.address(99.0, 99.0), Some(BinAddress::new(3, 1)));
        assert_eq!(grid.address(100.0, 10.0), None);
        assert_eq!(grid.address(-0.01, 10.0), None);
        assert_eq!(grid.address(f64::NAN, 10.0), None);
    }

    #[test]
    fn test_linear_round_trip() {
        let grid = BinGrid::covering(&Rect::new(0.0, 0.0, 70.0, 30.0), 10.0, 10.0);
        let addr = BinAddress::new(5, 2);
        assert_eq!(grid.linear(addr), 19);
        assert_eq!(grid.from_linear(19), addr);
        assert_eq!(grid.cell_center(addr), Coord::new(55.0, 25.0));
    }
}
