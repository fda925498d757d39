/// Layout of the on-disk analysis store

/// Records per chunk file; a multiple of 8 keeps every column aligned
pub const DEFAULT_CHUNK_RECORDS: u64 = 262_144;

/// Format version written into the store manifest
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Magic prefix of the persisted bin index
pub const INDEX_MAGIC: &[u8; 4] = b"SBIX";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INDEX_FILE: &str = "bins.idx";
pub const LOCK_FILE: &str = "write.lock";

/// Reader lock files are named `read-<pid>-<n>.lock`
pub const READ_LOCK_PREFIX: &str = "read-";
pub const READ_LOCK_SUFFIX: &str = ".lock";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Chunk file name for a chunk number
pub fn chunk_file_name(chunk: u32) -> String {
    format!("chunk-{:06}.dat", chunk)
}
