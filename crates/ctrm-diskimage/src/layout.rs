//! Disk layout data model (spec §3).
//!
//! `DiskLayout` is the JSON document that accompanies a chunked disk image;
//! it is also technically redundant with the per-chunk annotations on the
//! OCI descriptors (spec §3: "the layout JSON is technically redundant but
//! authoritative"), so both are produced by [`crate::oci`] and kept in sync
//! from the same `Vec<ChunkInfo>`.

use serde::{Deserialize, Serialize};

/// Fixed chunk size: 1 GiB (spec §3).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Default zstd compression level (spec §4.3 step 3, §6).
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// One chunk's packaging metadata (spec §3).
///
/// Invariants: `length == raw_length`; `index` sequential from 0;
/// `offset == index * chunk_size`; every chunk but the last has
/// `length == chunk_size`; the last chunk has `length == logical_size - offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub layer_digest: String,
    pub layer_size: u64,
    pub raw_digest: String,
    pub raw_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct CompressionSpec {
    #[serde(rename = "type")]
    pub kind: CompressionType,
    pub level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarSpec {
    pub format: TarFormat,
    pub sparse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarFormat {
    Pax,
}

/// The full disk layout document (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskLayout {
    pub version: u32,
    pub logical_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub compression: CompressionSpec,
    pub tar: TarSpec,
    pub chunks: Vec<ChunkInfo>,
}

impl DiskLayout {
    pub fn new(logical_size: u64, chunk_size: u64, zstd_level: i32, chunks: Vec<ChunkInfo>) -> Self {
        let chunk_count = chunk_count_for(logical_size, chunk_size);
        Self {
            version: 1,
            logical_size,
            chunk_size,
            chunk_count,
            compression: CompressionSpec {
                kind: CompressionType::Zstd,
                level: zstd_level,
            },
            tar: TarSpec {
                format: TarFormat::Pax,
                sparse: true,
            },
            chunks,
        }
    }

    /// Encode with sorted keys and no insignificant whitespace, so the bytes
    /// are stable across hosts when this document is itself digested (spec
    /// §9 "Deterministic JSON").
    pub fn to_canonical_json(&self) -> crate::error::Result<Vec<u8>> {
        crate::json::to_canonical_json(self)
    }

    /// Validate the structural invariants in spec §3.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.chunk_count != self.chunks.len() {
            return Err(crate::error::Error::format(format!(
                "chunkCount {} does not match {} chunks",
                self.chunk_count,
                self.chunks.len()
            )));
        }
        let sum: u64 = self.chunks.iter().map(|c| c.length).sum();
        if sum != self.logical_size {
            return Err(crate::error::Error::format(format!(
                "sum of chunk lengths {} does not match logicalSize {}",
                sum, self.logical_size
            )));
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != i {
                return Err(crate::error::Error::format(format!(
                    "chunk at position {} has index {}",
                    i, chunk.index
                )));
            }
            if chunk.offset != i as u64 * self.chunk_size {
                return Err(crate::error::Error::format(format!(
                    "chunk {} offset {} does not match index*chunkSize",
                    i, chunk.offset
                )));
            }
            if chunk.length != chunk.raw_length {
                return Err(crate::error::Error::format(format!(
                    "chunk {} length {} does not match rawLength {}",
                    i, chunk.length, chunk.raw_length
                )));
            }
            let is_last = i + 1 == self.chunks.len();
            if !is_last && chunk.length != self.chunk_size {
                return Err(crate::error::Error::format(format!(
                    "non-final chunk {} has length {} != chunkSize {}",
                    i, chunk.length, self.chunk_size
                )));
            }
            if is_last && chunk.length != self.logical_size - chunk.offset {
                return Err(crate::error::Error::format(format!(
                    "final chunk {} has length {}, expected {}",
                    i,
                    chunk.length,
                    self.logical_size - chunk.offset
                )));
            }
        }
        Ok(())
    }
}

/// `ceil(logicalSize / chunkSize)`, with a minimum of one chunk for a
/// zero-length disk so the layout always carries at least an empty chunk.
pub fn chunk_count_for(logical_size: u64, chunk_size: u64) -> usize {
    if logical_size == 0 {
        return 1;
    }
    ((logical_size + chunk_size - 1) / chunk_size) as usize
}

/// The `(offset, length)` span of chunk `index` within a disk of the given
/// logical size and chunk size.
pub fn chunk_span(index: usize, logical_size: u64, chunk_size: u64) -> (u64, u64) {
    let offset = index as u64 * chunk_size;
    let length = chunk_size.min(logical_size.saturating_sub(offset));
    (offset, length)
}
