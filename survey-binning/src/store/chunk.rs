//! Fixed-capacity, column-major chunk files.
//!
//! A chunk holds `capacity` records. Each column occupies a contiguous
//! run of `capacity * width` bytes, little-endian. Capacities are
//! multiples of 8 so every column starts 8-byte aligned.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::bounds::Coord;
use crate::grid::BinAddress;
use crate::trace::{PointId, TraceFlags, TraceRecord};

const INLINE: usize = 0;
const CROSSLINE: usize = 1;
const SRC_INDEX: usize = 2;
const SRC_LINE: usize = 3;
const SRC_POINT: usize = 4;
const REC_INDEX: usize = 5;
const REC_LINE: usize = 6;
const REC_POINT: usize = 7;
const SRC_X: usize = 8;
const SRC_Y: usize = 9;
const REC_X: usize = 10;
const REC_Y: usize = 11;
const CMP_X: usize = 12;
const CMP_Y: usize = 13;
const OFFSET: usize = 14;
const AZIMUTH: usize = 15;
const TWT: usize = 16;
const FLAGS: usize = 17;

const COLUMN_WIDTHS: [usize; 18] = [4, 4, 2, 4, 4, 2, 4, 4, 8, 8, 8, 8, 8, 8, 8, 4, 4, 1];

/// Bytes one record occupies across all columns
pub const RECORD_BYTES: usize = {
    let mut total = 0;
    let mut i = 0;
    while i < COLUMN_WIDTHS.len() {
        total += COLUMN_WIDTHS[i];
        i += 1;
    }
    total
};

const ZERO_BLOCK: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnLayout {
    pub capacity: u64,
    starts: [usize; 18],
}

impl ColumnLayout {
    pub fn new(capacity: u64) -> Self {
        let mut starts = [0usize; 18];
        let mut offset = 0usize;
        for (start, width) in starts.iter_mut().zip(COLUMN_WIDTHS.iter()) {
            *start = offset;
            offset += capacity as usize * width;
        }
        Self { capacity, starts }
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.capacity * RECORD_BYTES as u64
    }

    fn cell(&self, column: usize, row: u64) -> usize {
        self.starts[column] + row as usize * COLUMN_WIDTHS[column]
    }
}

fn put(bytes: &mut [u8], layout: &ColumnLayout, column: usize, row: u64, value: &[u8]) {
    let start = layout.cell(column, row);
    bytes[start..start + value.len()].copy_from_slice(value);
}

fn get<const N: usize>(bytes: &[u8], layout: &ColumnLayout, column: usize, row: u64) -> [u8; N] {
    let start = layout.cell(column, row);
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[start..start + N]);
    out
}

fn encode(bytes: &mut [u8], layout: &ColumnLayout, row: u64, record: &TraceRecord) {
    put(bytes, layout, INLINE, row, &record.bin.inline.to_le_bytes());
    put(bytes, layout, CROSSLINE, row, &record.bin.crossline.to_le_bytes());
    put(bytes, layout, SRC_INDEX, row, &record.src_id.index.to_le_bytes());
    put(bytes, layout, SRC_LINE, row, &record.src_id.line.to_le_bytes());
    put(bytes, layout, SRC_POINT, row, &record.src_id.point.to_le_bytes());
    put(bytes, layout, REC_INDEX, row, &record.rec_id.index.to_le_bytes());
    put(bytes, layout, REC_LINE, row, &record.rec_id.line.to_le_bytes());
    put(bytes, layout, REC_POINT, row, &record.rec_id.point.to_le_bytes());
    put(bytes, layout, SRC_X, row, &record.src.x.to_le_bytes());
    put(bytes, layout, SRC_Y, row, &record.src.y.to_le_bytes());
    put(bytes, layout, REC_X, row, &record.rec.x.to_le_bytes());
    put(bytes, layout, REC_Y, row, &record.rec.y.to_le_bytes());
    put(bytes, layout, CMP_X, row, &record.cmp.x.to_le_bytes());
    put(bytes, layout, CMP_Y, row, &record.cmp.y.to_le_bytes());
    put(bytes, layout, OFFSET, row, &record.offset.to_le_bytes());

    let mut flags = record.flags;
    flags.set(TraceFlags::AZIMUTH_UNDEFINED, record.azimuth.is_none());
    put(bytes, layout, AZIMUTH, row, &record.azimuth.unwrap_or(0.0).to_le_bytes());
    put(bytes, layout, TWT, row, &record.twt_ms.to_le_bytes());
    put(bytes, layout, FLAGS, row, &[flags.0]);
}

fn decode_bin(bytes: &[u8], layout: &ColumnLayout, row: u64) -> BinAddress {
    BinAddress::new(
        u32::from_le_bytes(get(bytes, layout, INLINE, row)),
        u32::from_le_bytes(get(bytes, layout, CROSSLINE, row)),
    )
}

fn decode(bytes: &[u8], layout: &ColumnLayout, row: u64) -> TraceRecord {
    let f64_at = |column| f64::from_le_bytes(get(bytes, layout, column, row));
    let flags = TraceFlags(get::<1>(bytes, layout, FLAGS, row)[0]);
    let azimuth = f32::from_le_bytes(get(bytes, layout, AZIMUTH, row));

    TraceRecord {
        bin: decode_bin(bytes, layout, row),
        src_id: PointId::new(
            u16::from_le_bytes(get(bytes, layout, SRC_INDEX, row)),
            i32::from_le_bytes(get(bytes, layout, SRC_LINE, row)),
            i32::from_le_bytes(get(bytes, layout, SRC_POINT, row)),
        ),
        rec_id: PointId::new(
            u16::from_le_bytes(get(bytes, layout, REC_INDEX, row)),
            i32::from_le_bytes(get(bytes, layout, REC_LINE, row)),
            i32::from_le_bytes(get(bytes, layout, REC_POINT, row)),
        ),
        src: Coord::new(f64_at(SRC_X), f64_at(SRC_Y)),
        rec: Coord::new(f64_at(REC_X), f64_at(REC_Y)),
        cmp: Coord::new(f64_at(CMP_X), f64_at(CMP_Y)),
        offset: f64_at(OFFSET),
        azimuth: (!flags.contains(TraceFlags::AZIMUTH_UNDEFINED)).then_some(azimuth),
        twt_ms: f32::from_le_bytes(get(bytes, layout, TWT, row)),
        flags,
    }
}

/// Write zeros so a full disk fails here rather than on a mapped write.
fn preallocate(file: &mut File, bytes: u64) -> io::Result<()> {
    let zeros = vec![0u8; ZERO_BLOCK];
    let mut remaining = bytes;
    while remaining > 0 {
        let n = remaining.min(ZERO_BLOCK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.sync_data()
}

/// The chunk currently receiving appends.
pub(crate) struct ChunkWriter {
    pub number: u32,
    layout: ColumnLayout,
    map: MmapMut,
    len: u64,
}

impl ChunkWriter {
    pub fn create(path: &Path, number: u32, layout: ColumnLayout) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        preallocate(&mut file, layout.chunk_bytes())?;
        // SAFETY: the file is owned by the writer holding the store lock and
        // keeps its length for the lifetime of the map.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            number,
            layout,
            map,
            len: 0,
        })
    }

    /// Map an existing chunk whose first `len` rows are committed
    pub fn reopen(path: &Path, number: u32, layout: ColumnLayout, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != layout.chunk_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk {} has unexpected size", path.display()),
            ));
        }
        // SAFETY: see `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            number,
            layout,
            map,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.layout.capacity
    }

    pub fn push(&mut self, record: &TraceRecord) {
        encode(&mut self.map, &self.layout, self.len, record);
        self.len += 1;
    }

    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

/// Read-only view of a committed chunk.
pub(crate) struct ChunkReader {
    layout: ColumnLayout,
    map: Mmap,
    len: u64,
}

impl ChunkReader {
    pub fn open(path: &Path, layout: ColumnLayout, len: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() < layout.chunk_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk {} is truncated", path.display()),
            ));
        }
        // SAFETY: committed chunks are never modified; writers hold the
        // store lock and only append past the committed length.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            layout,
            map,
            len: len.min(layout.capacity),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn bin(&self, row: u64) -> BinAddress {
        decode_bin(&self.map, &self.layout, row)
    }

    pub fn record(&self, row: u64) -> TraceRecord {
        decode(&self.map, &self.layout, row)
    }
}
