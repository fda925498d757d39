//! Trace-level analysis over records read from the analysis store:
//! histograms, spider legs, line profiles and stack responses.
//!
//! Responses are amplitude spectra of the offset distribution,
//! `|Σ w·exp(2πi k·o)| / n`, reported in dB (`20·log10`) and floored
//! at [`RESPONSE_FLOOR_DB`]. Wavenumbers are in cycles per metre.

use std::f64::consts::TAU;

use constants::histogram::{
    DEFAULT_K_MAX, OFFAZI_AZIMUTH_STEP, OFFAZI_OFFSET_STEP, OFFSET_HISTOGRAM_STEP,
    RESPONSE_FLOOR_DB, STACK_RESPONSE_SAMPLES,
};
use constants::binning::FULL_CIRCLE_DEGREES;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bounds::Coord;
use crate::error::ConfigError;
use crate::geometry::Pattern;
use crate::grid::BinGrid;
use crate::lattice::pattern_elements;
use crate::trace::{PointId, TraceFlags, TraceRecord};

/// Records counted by an analysis; `unique_only` drops repeated pairs
pub fn selected(records: &[TraceRecord], unique_only: bool) -> impl Iterator<Item = &TraceRecord> {
    records
        .iter()
        .filter(move |r| !unique_only || r.flags.contains(TraceFlags::UNIQUE))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bucket_width: f64,
    /// Bucket `i` covers `[i·w, (i+1)·w)`
    pub counts: Vec<u64>,
}

impl Histogram {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

pub fn offset_histogram(records: &[TraceRecord], unique_only: bool) -> Histogram {
    bucket_offsets(records, unique_only, OFFSET_HISTOGRAM_STEP)
}

/// Offset histogram with a caller-chosen bucket width in metres
pub fn offset_histogram_with(
    records: &[TraceRecord],
    unique_only: bool,
    bucket_width: f64,
) -> Result<Histogram, ConfigError> {
    if !(bucket_width.is_finite() && bucket_width > 0.0) {
        return Err(ConfigError::invalid(
            "bucket_width",
            format!("{bucket_width} must be a positive number of metres"),
        ));
    }
    Ok(bucket_offsets(records, unique_only, bucket_width))
}

fn bucket_offsets(records: &[TraceRecord], unique_only: bool, bucket_width: f64) -> Histogram {
    let mut counts: Vec<u64> = Vec::new();
    for record in selected(records, unique_only) {
        let bucket = (record.offset / bucket_width).floor().max(0.0) as usize;
        if bucket >= counts.len() {
            counts.resize(bucket + 1, 0);
        }
        counts[bucket] += 1;
    }
    Histogram {
        bucket_width,
        counts,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetAzimuthHistogram {
    pub azimuth_step: f64,
    pub offset_step: f64,
    pub azimuth_buckets: usize,
    pub offset_buckets: usize,
    /// Azimuth-major: `counts[a * offset_buckets + o]`
    pub counts: Vec<u64>,
    /// Zero-offset traces have no azimuth
    pub undefined_azimuth: u64,
}

impl OffsetAzimuthHistogram {
    pub fn get(&self, azimuth_bucket: usize, offset_bucket: usize) -> u64 {
        if azimuth_bucket >= self.azimuth_buckets || offset_bucket >= self.offset_buckets {
            return 0;
        }
        self.counts[azimuth_bucket * self.offset_buckets + offset_bucket]
    }
}

pub fn offset_azimuth_histogram(records: &[TraceRecord], unique_only: bool) -> OffsetAzimuthHistogram {
    let azimuth_buckets = (FULL_CIRCLE_DEGREES / OFFAZI_AZIMUTH_STEP).ceil() as usize;
    let max_offset = selected(records, unique_only)
        .map(|r| r.offset)
        .fold(0.0f64, f64::max);
    let offset_buckets = (max_offset / OFFAZI_OFFSET_STEP).floor() as usize + 1;

    let mut histogram = OffsetAzimuthHistogram {
        azimuth_step: OFFAZI_AZIMUTH_STEP,
        offset_step: OFFAZI_OFFSET_STEP,
        azimuth_buckets,
        offset_buckets,
        counts: vec![0; azimuth_buckets * offset_buckets],
        undefined_azimuth: 0,
    };
    for record in selected(records, unique_only) {
        let Some(azimuth) = record.azimuth else {
            histogram.undefined_azimuth += 1;
            continue;
        };
        let a = ((azimuth as f64 / OFFAZI_AZIMUTH_STEP).floor() as usize).min(azimuth_buckets - 1);
        let o = ((record.offset / OFFAZI_OFFSET_STEP).floor() as usize).min(offset_buckets - 1);
        histogram.counts[a * offset_buckets + o] += 1;
    }
    histogram
}

/// Lines from a bin's midpoints to the source and receiver of each trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpiderLeg {
    pub src_id: PointId,
    pub rec_id: PointId,
    pub cmp: Coord,
    pub src: Coord,
    pub rec: Coord,
}

pub fn spider_legs(records: &[TraceRecord], unique_only: bool) -> Vec<SpiderLeg> {
    selected(records, unique_only)
        .map(|r| SpiderLeg {
            src_id: r.src_id,
            rec_id: r.rec_id,
            cmp: r.cmp,
            src: r.src,
            rec: r.rec,
        })
        .collect()
}

/// One trace drawn across its bin along a line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSegment {
    pub from: f64,
    pub to: f64,
    pub offset: f64,
    pub azimuth: Option<f32>,
}

/// Offset and azimuth against the midpoint x of records along a row
pub fn inline_profile(records: &[TraceRecord], grid: &BinGrid, unique_only: bool) -> Vec<ProfileSegment> {
    let half = grid.bin_dx / 2.0;
    profile(records, unique_only, |r| (r.cmp.x - half, r.cmp.x + half))
}

/// Offset and azimuth against the midpoint y of records along a column
pub fn crossline_profile(
    records: &[TraceRecord],
    grid: &BinGrid,
    unique_only: bool,
) -> Vec<ProfileSegment> {
    let half = grid.bin_dy / 2.0;
    profile(records, unique_only, |r| (r.cmp.y - half, r.cmp.y + half))
}

fn profile(
    records: &[TraceRecord],
    unique_only: bool,
    span: impl Fn(&TraceRecord) -> (f64, f64),
) -> Vec<ProfileSegment> {
    selected(records, unique_only)
        .map(|r| {
            let (from, to) = span(r);
            ProfileSegment {
                from,
                to,
                offset: r.offset,
                azimuth: r.azimuth,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseSettings {
    pub k_max: f64,
    /// Samples per wavenumber axis
    pub samples: usize,
    pub unique_only: bool,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            k_max: DEFAULT_K_MAX,
            samples: STACK_RESPONSE_SAMPLES,
            unique_only: false,
        }
    }
}

impl ResponseSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.k_max.is_finite() && self.k_max > 0.0) {
            return Err(ConfigError::invalid("k_max", "must be positive"));
        }
        if self.samples < 2 {
            return Err(ConfigError::invalid("samples", "at least 2 per axis"));
        }
        Ok(())
    }

    /// `samples` values over `[-k_max, k_max]`
    pub fn symmetric_axis(&self) -> Vec<f64> {
        let n = self.samples.max(2);
        let dk = 2.0 * self.k_max / (n - 1) as f64;
        (0..n).map(|i| -self.k_max + i as f64 * dk).collect()
    }

    /// `samples` values over `[0, k_max]`
    pub fn radial_axis(&self) -> Vec<f64> {
        let n = self.samples.max(2);
        let dk = self.k_max / (n - 1) as f64;
        (0..n).map(|i| i as f64 * dk).collect()
    }
}

/// Response on a square kx-ky grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KxKyResponse {
    pub k: Vec<f64>,
    /// Row-major: `db[iy * k.len() + ix]`
    pub db: Vec<f32>,
}

impl KxKyResponse {
    pub fn at(&self, ix: usize, iy: usize) -> f32 {
        self.db[iy * self.k.len() + ix]
    }
}

/// Radial |k| response, one row per bin along a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialResponse {
    pub k: Vec<f64>,
    pub rows: Vec<Vec<f32>>,
}

fn to_db(amplitude: f64) -> f32 {
    if amplitude <= 0.0 {
        return RESPONSE_FLOOR_DB as f32;
    }
    (20.0 * amplitude.log10()).max(RESPONSE_FLOOR_DB) as f32
}

/// Complex sum of unit phasors `exp(2πi k·p)` over `points`
fn phasor_sum(points: &[Coord], kx: f64, ky: f64) -> (f64, f64) {
    points.iter().fold((0.0, 0.0), |(re, im), p| {
        let phase = TAU * (kx * p.x + ky * p.y);
        (re + phase.cos(), im + phase.sin())
    })
}

/// Normalised array response of a pattern at one wavenumber
fn pattern_phasor(elements: &[Coord], kx: f64, ky: f64) -> (f64, f64) {
    if elements.is_empty() {
        return (1.0, 0.0);
    }
    let (re, im) = phasor_sum(elements, kx, ky);
    let n = elements.len() as f64;
    (re / n, im / n)
}

fn complex_mul(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    (a.0 * b.0 - a.1 * b.1, a.0 * b.1 + a.1 * b.0)
}

/// kx-ky array response of a pattern's elements
pub fn pattern_response(pattern: &Pattern, settings: &ResponseSettings) -> KxKyResponse {
    let elements: Vec<Coord> = pattern_elements(pattern).collect();
    let k = settings.symmetric_axis();
    let db = k
        .par_iter()
        .flat_map_iter(|&ky| {
            let elements = &elements;
            k.iter().map(move |&kx| {
                let (re, im) = pattern_phasor(elements, kx, ky);
                to_db(re.hypot(im))
            })
        })
        .collect();
    KxKyResponse { k, db }
}

/// Source and receiver arrays applied to each trace of a stack response.
/// Directional traces rotate their arrays to the trace's offset direction.
#[derive(Debug, Clone, Default)]
pub struct ArrayWeights {
    source: Vec<Coord>,
    receiver: Vec<Coord>,
}

impl ArrayWeights {
    pub fn new(source: Option<&Pattern>, receiver: Option<&Pattern>) -> Self {
        Self {
            source: source.map(|p| pattern_elements(p).collect()).unwrap_or_default(),
            receiver: receiver.map(|p| pattern_elements(p).collect()).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.receiver.is_empty()
    }

    fn weight(&self, record: &TraceRecord, kx: f64, ky: f64) -> (f64, f64) {
        if self.is_empty() {
            return (1.0, 0.0);
        }
        let (dx, dy) = record.offset_vector();
        let angle = if dx == 0.0 && dy == 0.0 { 0.0 } else { dy.atan2(dx) };
        let rotated = |directional: bool| -> (f64, f64) {
            // Rotating elements by θ equals rotating k by -θ.
            if directional {
                let (s, c) = angle.sin_cos();
                (c * kx + s * ky, -s * kx + c * ky)
            } else {
                (kx, ky)
            }
        };
        let (sx, sy) = rotated(record.flags.contains(TraceFlags::SRC_DIRECTIONAL));
        let (rx, ry) = rotated(record.flags.contains(TraceFlags::REC_DIRECTIONAL));
        complex_mul(
            pattern_phasor(&self.source, sx, sy),
            pattern_phasor(&self.receiver, rx, ry),
        )
    }
}

fn stack_amplitude(records: &[&TraceRecord], weights: &ArrayWeights, kx: f64, ky: f64) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let (re, im) = records.iter().fold((0.0, 0.0), |(re, im), record| {
        let (ox, oy) = record.offset_vector();
        let phase = TAU * (kx * ox + ky * oy);
        let (wr, wi) = weights.weight(record, kx, ky);
        let (pr, pi) = complex_mul((wr, wi), (phase.cos(), phase.sin()));
        (re + pr, im + pi)
    });
    re.hypot(im) / records.len() as f64
}

/// kx-ky stack response of the offset vectors of one bin
pub fn kxky_stack_response(
    records: &[TraceRecord],
    weights: &ArrayWeights,
    settings: &ResponseSettings,
) -> KxKyResponse {
    let traces: Vec<&TraceRecord> = selected(records, settings.unique_only).collect();
    let k = settings.symmetric_axis();
    let db = k
        .par_iter()
        .flat_map_iter(|&ky| {
            let traces = &traces;
            k.iter()
                .map(move |&kx| to_db(stack_amplitude(traces, weights, kx, ky)))
        })
        .collect();
    KxKyResponse { k, db }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineAxis {
    /// Row of bins running along x at a fixed crossline
    Inline,
    /// Column of bins running along y at a fixed inline
    Crossline,
}

/// |k| response of the absolute offsets in each bin along a line. A bin
/// without traces sits at the floor.
pub fn radial_stack_response(
    records: &[TraceRecord],
    grid: &BinGrid,
    axis: LineAxis,
    settings: &ResponseSettings,
) -> RadialResponse {
    let length = match axis {
        LineAxis::Inline => grid.nx,
        LineAxis::Crossline => grid.ny,
    } as usize;
    let mut offsets: Vec<Vec<f64>> = vec![Vec::new(); length];
    for record in selected(records, settings.unique_only) {
        let position = match axis {
            LineAxis::Inline => record.bin.inline,
            LineAxis::Crossline => record.bin.crossline,
        } as usize;
        if let Some(bin) = offsets.get_mut(position) {
            bin.push(record.offset);
        }
    }

    let k = settings.radial_axis();
    let rows = offsets
        .par_iter()
        .map(|bin| {
            k.iter()
                .map(|&kr| {
                    if bin.is_empty() {
                        return RESPONSE_FLOOR_DB as f32;
                    }
                    let (re, im) = bin.iter().fold((0.0, 0.0), |(re, im), &offset| {
                        let phase = TAU * kr * offset;
                        (re + phase.cos(), im + phase.sin())
                    });
                    to_db(re.hypot(im) / bin.len() as f64)
                })
                .collect()
        })
        .collect();
    RadialResponse { k, rows }
}
