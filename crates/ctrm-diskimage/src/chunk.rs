//! Chunk codec (spec §4.3).
//!
//! Turns one `[chunkOffset, chunkOffset+chunkLength)` region of an open disk
//! file into a content-addressed, zstd-compressed PAX-sparse tar blob, plus
//! the raw (pre-compression) SHA-256 digest used for post-rebuild
//! verification (spec §4.5 step 4, §8).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::blobs::stage_blob;
use crate::error::{Error, Result};
use crate::layout::ChunkInfo;
use crate::pax;
use crate::sparse::{self, SparseExtent};

/// Result of packaging a single chunk (spec §4.3: "Output").
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub info: ChunkInfo,
    pub blob_path: PathBuf,
}

/// Package chunk `index` of `disk`, covering `[chunk_offset, chunk_offset +
/// chunk_length)`, into a blob under `blobs_sha256_dir`.
///
/// `zstd_level` and `chunk_length` are the only inputs that change the
/// resulting digests (spec §6); everything else in this function is a pure
/// transform of the chunk's bytes, so retrying from scratch is always safe
/// (spec §4.3: "Failure semantics").
pub fn package_chunk(
    disk: &File,
    index: usize,
    chunk_offset: u64,
    chunk_length: u64,
    blobs_sha256_dir: &Path,
    zstd_level: i32,
) -> Result<ChunkResult> {
    let extents = sparse::detect_extents(disk, chunk_offset, chunk_length)
        .map_err(|e| chunk_err(index, e))?;
    let raw_digest = raw_digest_hex(disk, chunk_offset, chunk_length).map_err(|e| chunk_err(index, e))?;

    let tmp_dir = blobs_sha256_dir
        .parent()
        .unwrap_or(blobs_sha256_dir)
        .to_path_buf();
    std::fs::create_dir_all(&tmp_dir).map_err(|e| Error::io(&tmp_dir, e))?;

    let tar_tmp = tmp_dir.join(format!(".chunk-{index}.tar.tmp"));
    write_tar(disk, chunk_offset, chunk_length, &extents, &tar_tmp).map_err(|e| chunk_err(index, e))?;

    let zstd_tmp = tmp_dir.join(format!(".chunk-{index}.tar.zst.tmp"));
    let layer_size = compress_zstd(&tar_tmp, &zstd_tmp, zstd_level).map_err(|e| chunk_err(index, e))?;
    let _ = std::fs::remove_file(&tar_tmp);

    let layer_digest_hex = sha256_file_hex(&zstd_tmp).map_err(|e| chunk_err(index, e))?;
    let blob_path = stage_blob(&zstd_tmp, &layer_digest_hex, blobs_sha256_dir)?;

    let info = ChunkInfo {
        index,
        offset: chunk_offset,
        length: chunk_length,
        layer_digest: format!("sha256:{layer_digest_hex}"),
        layer_size,
        raw_digest: format!("sha256:{raw_digest}"),
        raw_length: chunk_length,
    };

    Ok(ChunkResult { info, blob_path })
}

fn chunk_err(index: usize, e: Error) -> Error {
    match e {
        Error::Chunk { .. } => e,
        other => Error::Chunk {
            index,
            message: other.to_string(),
        },
    }
}

/// SHA-256 of `[offset, offset+length)`, treating holes and a short EOF read
/// as zero bytes (spec §4.3 step 2). A plain sequential read already returns
/// zeros for holes on a sparse file, so no extent bookkeeping is needed here.
pub fn raw_digest_hex(disk: &File, offset: u64, length: u64) -> Result<String> {
    let mut file = disk.try_clone().map_err(|e| Error::io("<fd>", e))?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io("<fd>", e))?;

    let mut hasher = Sha256::new();
    let mut remaining = length;
    let mut buf = [0u8; 1 << 20];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want]).map_err(|e| Error::io("<fd>", e))?;
        if n == 0 {
            // EOF before chunk_length bytes: pad the rest with zeros.
            hasher.update(vec![0u8; remaining as usize]);
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn write_tar(
    disk: &File,
    chunk_offset: u64,
    chunk_length: u64,
    extents: &[SparseExtent],
    dest: &Path,
) -> Result<()> {
    let mut out = std::fs::File::create(dest).map_err(|e| Error::io(dest, e))?;
    let mut reader = disk.try_clone().map_err(|e| Error::io("<fd>", e))?;
    pax::write_chunk_tar(&mut out, chunk_length, extents, |extent| {
        let mut buf = vec![0u8; extent.length as usize];
        reader.seek(SeekFrom::Start(chunk_offset + extent.offset as u64))?;
        reader.read_exact(&mut buf)?;
        Ok(buf)
    })?;
    out.sync_all().map_err(|e| Error::io(dest, e))?;
    Ok(())
}

/// Compress `src` to `dest` with zstd at `level`, single-threaded, no
/// content checksum, no dictionary, no embedded timestamp (spec §4.3 step 3:
/// determinism). Returns the compressed byte count.
fn compress_zstd(src: &Path, dest: &Path, level: i32) -> Result<u64> {
    let mut input = std::fs::File::open(src).map_err(|e| Error::io(src, e))?;
    let output = std::fs::File::create(dest).map_err(|e| Error::io(dest, e))?;
    // zstd::stream::Encoder defaults to single-threaded, no content checksum,
    // no dictionary, no embedded timestamp — exactly spec §4.3 step 3.
    let mut encoder = zstd::stream::Encoder::new(output, level).map_err(|e| Error::io(dest, e))?;
    std::io::copy(&mut input, &mut encoder).map_err(|e| Error::io(dest, e))?;
    let mut out = encoder.finish().map_err(|e| Error::io(dest, e))?;
    out.flush().map_err(|e| Error::io(dest, e))?;
    let meta = std::fs::metadata(dest).map_err(|e| Error::io(dest, e))?;
    Ok(meta.len())
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn small_deterministic_chunk_matches_spec_example() {
        // spec §8 scenario 1.
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, [0x01u8, 0x02, 0x03]).unwrap();
        let disk = std::fs::File::open(&disk_path).unwrap();

        let blobs_dir = dir.path().join("blobs/sha256");
        let result = package_chunk(&disk, 0, 0, 3, &blobs_dir, 3).unwrap();

        assert_eq!(result.info.length, 3);
        assert_eq!(
            result.info.raw_digest,
            "sha256:039058c6f2c0cb492c533b0a4d14ef77cc0f78abccced5287d84a1a2011cfb81"
        );
        assert!(result.blob_path.exists());
    }

    #[test]
    fn sparse_hole_chunk_preserves_small_extent() {
        // spec §8 scenario 2 (scaled down for a fast test).
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        let mut file = std::fs::File::create(&disk_path).unwrap();
        file.set_len(2 * 1024 * 1024).unwrap();
        file.seek(SeekFrom::Start(1024 * 1024)).unwrap();
        file.write_all(&[0xAAu8; 16]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let disk = std::fs::File::open(&disk_path).unwrap();
        let blobs_dir = dir.path().join("blobs/sha256");
        let result = package_chunk(&disk, 0, 0, 2 * 1024 * 1024, &blobs_dir, 3).unwrap();
        assert_eq!(result.info.length, 2 * 1024 * 1024);
        // compressed blob must be far smaller than the logical chunk size.
        assert!(result.info.layer_size < 2 * 1024 * 1024 / 4);
    }

    #[test]
    fn repackaging_same_bytes_is_idempotent_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, vec![7u8; 4096]).unwrap();
        let disk = std::fs::File::open(&disk_path).unwrap();
        let blobs_dir = dir.path().join("blobs/sha256");

        let first = package_chunk(&disk, 0, 0, 4096, &blobs_dir, 3).unwrap();
        let second = package_chunk(&disk, 0, 0, 4096, &blobs_dir, 3).unwrap();
        assert_eq!(first.info.layer_digest, second.info.layer_digest);
        assert_eq!(first.blob_path, second.blob_path);
    }
}
