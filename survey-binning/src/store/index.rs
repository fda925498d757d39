//! Bin to chunk index.
//!
//! On disk (`bins.idx`, little-endian):
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..4  | magic `SBIX` |
//! | 4..8  | format version |
//! | 8..16 | record count covered |
//! | 16..20 | chunk count |
//! | 20..28 | entry count |
//! | ...   | per entry: bin u64, n u32, n chunk numbers u32 |
//! | last 32 | SHA-256 of everything before it |

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use constants::store::{INDEX_MAGIC, STORE_FORMAT_VERSION};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinIndex {
    record_count: u64,
    chunk_count: u32,
    bins: BTreeMap<u64, Vec<u32>>,
}

impl BinIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a record of `bin` stored in `chunk`; chunks arrive in order
    pub fn insert(&mut self, bin: u64, chunk: u32) {
        let chunks = self.bins.entry(bin).or_default();
        if chunks.last() != Some(&chunk) {
            chunks.push(chunk);
        }
        self.record_count += 1;
        self.chunk_count = self.chunk_count.max(chunk + 1);
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn chunks_for(&self, bin: u64) -> &[u32] {
        self.bins.get(&bin).map_or(&[], Vec::as_slice)
    }

    /// Sorted, deduplicated chunks holding any of `bins`
    pub fn chunks_for_bins(&self, bins: impl IntoIterator<Item = u64>) -> Vec<u32> {
        let mut chunks: Vec<u32> = bins
            .into_iter()
            .flat_map(|bin| self.chunks_for(bin).iter().copied())
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        chunks
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(28 + self.bins.len() * 16 + 32);
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(&STORE_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.record_count.to_le_bytes());
        bytes.extend_from_slice(&self.chunk_count.to_le_bytes());
        bytes.extend_from_slice(&(self.bins.len() as u64).to_le_bytes());
        for (bin, chunks) in &self.bins {
            bytes.extend_from_slice(&bin.to_le_bytes());
            bytes.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
            for chunk in chunks {
                bytes.extend_from_slice(&chunk.to_le_bytes());
            }
        }
        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);
        bytes
    }

    /// Decode and check against the record and chunk counts the store
    /// manifest declares
    pub fn from_bytes(
        bytes: &[u8],
        expected_records: u64,
        expected_chunks: u32,
    ) -> Result<Self, StoreError> {
        let mut reader = ByteReader::new(bytes);
        if reader.take::<4>()? != *INDEX_MAGIC {
            return Err(StoreError::IndexCorrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes(reader.take()?);
        if version != STORE_FORMAT_VERSION {
            return Err(StoreError::Version {
                found: version,
                expected: STORE_FORMAT_VERSION,
            });
        }
        let record_count = u64::from_le_bytes(reader.take()?);
        if record_count != expected_records {
            return Err(StoreError::IndexMismatch {
                indexed: record_count,
                records: expected_records,
            });
        }
        let chunk_count = u32::from_le_bytes(reader.take()?);
        if chunk_count != expected_chunks {
            return Err(StoreError::IndexCorrupt(format!(
                "index covers {chunk_count} chunks, store has {expected_chunks}"
            )));
        }

        if bytes.len() < 32 {
            return Err(StoreError::IndexCorrupt("truncated".into()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - 32);
        if Sha256::digest(body).as_slice() != digest {
            return Err(StoreError::IndexCorrupt("checksum mismatch".into()));
        }

        let entries = u64::from_le_bytes(reader.take()?);
        let mut bins = BTreeMap::new();
        for _ in 0..entries {
            let bin = u64::from_le_bytes(reader.take()?);
            let n = u32::from_le_bytes(reader.take()?);
            let mut chunks = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let chunk = u32::from_le_bytes(reader.take()?);
                if chunk >= chunk_count {
                    return Err(StoreError::IndexCorrupt(format!(
                        "bin {bin} references chunk {chunk} of {chunk_count}"
                    )));
                }
                chunks.push(chunk);
            }
            bins.insert(bin, chunks);
        }
        if reader.position != body.len() {
            return Err(StoreError::IndexCorrupt("trailing bytes".into()));
        }

        Ok(Self {
            record_count,
            chunk_count,
            bins,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let tmp = path.with_extension("idx.tmp");
        fs::write(&tmp, self.to_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path, expected_records: u64, expected_chunks: u32) -> Result<Self, StoreError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes, expected_records, expected_chunks)
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], StoreError> {
        let end = self.position + N;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| StoreError::IndexCorrupt("truncated".into()))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.position = end;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BinIndex {
        let mut index = BinIndex::new();
        for (bin, chunk) in [(5, 0), (5, 0), (2, 0), (5, 1), (9, 2), (2, 2)] {
            index.insert(bin, chunk);
        }
        index
    }

    #[test]
    fn test_insert_groups_chunks() {
        let index = sample();
        assert_eq!(index.record_count(), 6);
        assert_eq!(index.chunk_count(), 3);
        assert_eq!(index.chunks_for(5), &[0, 1]);
        assert_eq!(index.chunks_for(2), &[0, 2]);
        assert!(index.chunks_for(77).is_empty());
        assert_eq!(index.chunks_for_bins([2, 9, 5]), vec![0, 1, 2]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let index = sample();
        let decoded = BinIndex::from_bytes(&index.to_bytes(), 6, 3).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_record_count_mismatch_rejected() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            BinIndex::from_bytes(&bytes, 7, 3),
            Err(StoreError::IndexMismatch {
                indexed: 6,
                records: 7
            })
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample().to_bytes();
        let n = bytes.len();
        bytes[n - 40] ^= 0xff;
        assert!(matches!(
            BinIndex::from_bytes(&bytes, 6, 3),
            Err(StoreError::IndexCorrupt(_))
        ));

        let bytes = sample().to_bytes();
        assert!(matches!(
            BinIndex::from_bytes(&bytes[..20], 6, 3),
            Err(StoreError::IndexCorrupt(_))
        ));
    }
}
