//! Disk rebuilder (spec §4.5).
//!
//! Reconstructs a byte-identical sparse disk image from chunk blobs: create
//! a sparse temp sibling of `outputPath`, `pwrite` each chunk's data extents
//! at their original absolute offsets, then atomically rename over
//! `outputPath`.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::chunk::raw_digest_hex;
use crate::error::{Error, Result};
use crate::manifest::RebuildInputs;
use crate::pax;

fn pwrite_all(fd: i32, buf: &[u8], offset: i64) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                offset + written as i64,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += n as usize;
    }
    Ok(())
}

/// Rebuild a disk image at `output_path` from `inputs` (spec §4.5).
/// `verify_raw_digest` re-hashes every reassembled chunk against its
/// recorded `rawDigest` before the rename (spec §6: `verifyRawDigest`,
/// default off).
pub fn rebuild_disk(inputs: &RebuildInputs, output_path: &Path, verify_raw_digest: bool) -> Result<()> {
    let tmp_path = sibling_temp_path(output_path);
    let result = rebuild_disk_inner(inputs, output_path, &tmp_path, verify_raw_digest);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn sibling_temp_path(output_path: &Path) -> PathBuf {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    output_path.with_file_name(format!(".{file_name}.rebuild.tmp"))
}

fn rebuild_disk_inner(
    inputs: &RebuildInputs,
    output_path: &Path,
    tmp_path: &Path,
    verify_raw_digest: bool,
) -> Result<()> {
    let tmp_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)
        .map_err(|e| Error::io(tmp_path, e))?;
    tmp_file
        .set_len(inputs.layout.logical_size)
        .map_err(|e| Error::io(tmp_path, e))?;
    let fd = tmp_file.as_raw_fd();

    for chunk in &inputs.layout.chunks {
        let blob_path = inputs.blob_paths.get(&chunk.layer_digest).ok_or_else(|| {
            Error::MissingChunkBlob {
                index: chunk.index,
                digest: chunk.layer_digest.clone(),
            }
        })?;
        write_chunk(fd, blob_path, chunk.index, chunk.offset).map_err(|e| {
            Error::Chunk {
                index: chunk.index,
                message: e.to_string(),
            }
        })?;
        if verify_raw_digest {
            verify_chunk(&tmp_file, chunk)?;
        }
    }

    tmp_file.sync_all().map_err(|e| Error::io(tmp_path, e))?;
    drop(tmp_file);

    if output_path.exists() {
        std::fs::remove_file(output_path).map_err(|e| Error::io(output_path, e))?;
    }
    std::fs::rename(tmp_path, output_path).map_err(|e| Error::io(output_path, e))?;
    Ok(())
}

fn write_chunk(fd: i32, blob_path: &Path, index: usize, chunk_offset: u64) -> Result<()> {
    let compressed = File::open(blob_path).map_err(|e| Error::io(blob_path, e))?;
    let decoder = zstd::stream::Decoder::new(compressed).map_err(|e| Error::io(blob_path, e))?;
    let mut reader = std::io::BufReader::new(decoder);
    let parsed = pax::read_chunk_tar(&mut reader)
        .map_err(|e| Error::Chunk {
            index,
            message: e.to_string(),
        })?;

    let mut cursor = 0usize;
    for extent in &parsed.extents {
        let len = extent.length as usize;
        let data = &parsed.data[cursor..cursor + len];
        pwrite_all(fd, data, chunk_offset as i64 + extent.offset)
            .map_err(|e| Error::io(blob_path, e))?;
        cursor += len;
    }
    Ok(())
}

fn verify_chunk(tmp_file: &File, chunk: &crate::layout::ChunkInfo) -> Result<()> {
    let actual = raw_digest_hex(tmp_file, chunk.offset, chunk.length)?;
    let expected = chunk
        .raw_digest
        .strip_prefix("sha256:")
        .unwrap_or(&chunk.raw_digest);
    if actual != expected {
        return Err(Error::RawDigestMismatch {
            index: chunk.index,
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{build_oci_layout, read_oci_layout, PackageInputs};
    use std::io::{Seek, SeekFrom, Write};

    fn roundtrip(original: &[u8], chunk_size: u64) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, original).unwrap();
        let hw_path = dir.path().join("hw.bin");
        std::fs::write(&hw_path, b"hw").unwrap();
        let aux_path = dir.path().join("aux.bin");
        std::fs::write(&aux_path, b"aux").unwrap();

        let root = dir.path().join("layout");
        build_oci_layout(
            &root,
            &PackageInputs {
                disk_path: &disk_path,
                hardware_model_path: &hw_path,
                auxiliary_storage_path: &aux_path,
                chunk_size,
                zstd_level: 3,
            },
        )
        .unwrap();

        let inputs = read_oci_layout(&root).unwrap();
        let out_path = dir.path().join("rebuilt.img");
        rebuild_disk(&inputs, &out_path, true).unwrap();
        std::fs::read(&out_path).unwrap()
    }

    #[test]
    fn small_file_round_trips_byte_for_byte() {
        let original = vec![1u8, 2, 3, 4, 5, 6, 7];
        let rebuilt = roundtrip(&original, 4096);
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn multi_chunk_disk_round_trips_byte_for_byte() {
        let mut original = vec![0u8; 9000];
        for (i, b) in original.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let rebuilt = roundtrip(&original, 4096);
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn sparse_disk_preserves_hole_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        let mut file = File::create(&disk_path).unwrap();
        file.set_len(2 * 1024 * 1024).unwrap();
        file.seek(SeekFrom::Start(1024 * 1024)).unwrap();
        file.write_all(&[0xAAu8; 16]).unwrap();
        file.sync_all().unwrap();
        drop(file);
        let original = std::fs::read(&disk_path).unwrap();

        let hw_path = dir.path().join("hw.bin");
        std::fs::write(&hw_path, b"hw").unwrap();
        let aux_path = dir.path().join("aux.bin");
        std::fs::write(&aux_path, b"aux").unwrap();
        let root = dir.path().join("layout");
        build_oci_layout(
            &root,
            &PackageInputs {
                disk_path: &disk_path,
                hardware_model_path: &hw_path,
                auxiliary_storage_path: &aux_path,
                chunk_size: 2 * 1024 * 1024,
                zstd_level: 3,
            },
        )
        .unwrap();
        let inputs = read_oci_layout(&root).unwrap();
        let out_path = dir.path().join("rebuilt.img");
        rebuild_disk(&inputs, &out_path, true).unwrap();
        let rebuilt = std::fs::read(&out_path).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn missing_blob_fails_with_chunk_index() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, [1u8, 2, 3]).unwrap();
        let hw_path = dir.path().join("hw.bin");
        std::fs::write(&hw_path, b"hw").unwrap();
        let aux_path = dir.path().join("aux.bin");
        std::fs::write(&aux_path, b"aux").unwrap();
        let root = dir.path().join("layout");
        build_oci_layout(
            &root,
            &PackageInputs {
                disk_path: &disk_path,
                hardware_model_path: &hw_path,
                auxiliary_storage_path: &aux_path,
                chunk_size: 4096,
                zstd_level: 3,
            },
        )
        .unwrap();
        let mut inputs = read_oci_layout(&root).unwrap();
        inputs.blob_paths.clear();

        let out_path = dir.path().join("rebuilt.img");
        let err = rebuild_disk(&inputs, &out_path, false).unwrap_err();
        assert!(matches!(err, Error::MissingChunkBlob { index: 0, .. }));
        assert!(!sibling_temp_path(&out_path).exists());
    }
}
