//! Raster export: OpenEXR floats, 16-bit PNG, ESRI world file, JSON sidecar.
//!
//! Image rows run north to south, so grid row `ny - 1` is written first.
//! NoData cells get alpha 0.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageBuffer, LumaA};
use serde::Serialize;
use tracing::info;

use crate::bounds::Coord;
use crate::error::ExportError;
use crate::maps::{MapKind, Raster, RasterStats};
use crate::transform::{AffineTransform, CrsInfo};

fn check_size(raster: &Raster) -> Result<(), ExportError> {
    if raster.nx == 0 || raster.ny == 0 || raster.values.len() != raster.nx as usize * raster.ny as usize {
        return Err(ExportError::EmptyRaster(raster.kind.to_string()));
    }
    Ok(())
}

/// Value at image pixel (x, y), top row first
fn pixel(raster: &Raster, x: usize, y: usize) -> Option<f32> {
    let row = raster.ny as usize - 1 - y;
    raster.values[row * raster.nx as usize + x]
}

/// Write a float RGBA EXR; gray channels hold the value
pub fn write_exr(raster: &Raster, path: &Path) -> Result<(), ExportError> {
    check_size(raster)?;
    exr::prelude::write_rgba_file(
        path,
        raster.nx as usize,
        raster.ny as usize,
        |x, y| match pixel(raster, x, y) {
            Some(v) => (v, v, v, 1.0f32),
            None => (0.0f32, 0.0f32, 0.0f32, 0.0f32),
        },
    )?;
    info!(path = %path.display(), kind = %raster.kind, "wrote EXR raster");
    Ok(())
}

/// Write a 16-bit gray+alpha PNG stretched over the raster's value range
pub fn write_png(raster: &Raster, path: &Path) -> Result<(), ExportError> {
    check_size(raster)?;
    let stats = raster.stats();
    let min = stats.min.unwrap_or(0.0);
    let span = stats.max.unwrap_or(0.0) - min;

    let image = ImageBuffer::from_fn(raster.nx, raster.ny, |x, y| {
        match pixel(raster, x as usize, y as usize) {
            Some(v) => {
                let level = if span > 0.0 { (v - min) / span } else { 1.0 };
                LumaA([(level.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16, u16::MAX])
            }
            None => LumaA([0u16, 0u16]),
        }
    });
    image.save(path)?;
    info!(path = %path.display(), kind = %raster.kind, "wrote PNG raster");
    Ok(())
}

/// World-file parameters for the image layout of `raster`
pub fn world_file_parameters(raster: &Raster) -> [f64; 6] {
    let m = raster.transform.matrix;
    let (c, f) = raster
        .transform
        .apply(0.5, raster.ny as f64 - 0.5);
    [m[0][0], m[1][0], -m[0][1], -m[1][1], c, f]
}

/// Write the six-line ESRI world file
pub fn write_world_file(raster: &Raster, path: &Path) -> Result<(), ExportError> {
    let contents: String = world_file_parameters(raster)
        .iter()
        .map(|v| format!("{v:.10}\n"))
        .collect();
    fs::write(path, contents)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct RasterSidecar<'a> {
    kind: MapKind,
    nx: u32,
    ny: u32,
    cell_size: (f64, f64),
    origin: Coord,
    transform: &'a AffineTransform,
    crs: Option<&'a CrsInfo>,
    nodata: &'static str,
    stats: RasterStats,
}

/// Write a JSON description of the raster's layout and statistics
pub fn write_sidecar(raster: &Raster, path: &Path) -> Result<(), ExportError> {
    let sidecar = RasterSidecar {
        kind: raster.kind,
        nx: raster.nx,
        ny: raster.ny,
        cell_size: raster.cell_size,
        origin: raster.origin,
        transform: &raster.transform,
        crs: raster.crs.as_ref(),
        nodata: "alpha = 0",
        stats: raster.stats(),
    };
    fs::write(path, serde_json::to_string_pretty(&sidecar)?)?;
    Ok(())
}

/// Write every export format for each raster under `dir`, named by kind.
/// Returns the written paths.
pub fn export_all(rasters: &[Raster], dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for raster in rasters {
        let stem = dir.join(raster.kind.name());
        let exr = stem.with_extension("exr");
        let png = stem.with_extension("png");
        let world = stem.with_extension("pgw");
        let sidecar = stem.with_extension("json");
        write_exr(raster, &exr)?;
        write_png(raster, &png)?;
        write_world_file(raster, &world)?;
        write_sidecar(raster, &sidecar)?;
        written.extend([exr, png, world, sidecar]);
    }
    Ok(written)
}
