//! Sparse extent detection (spec §4.3 step 1, §9 "Sparsity extraction").
//!
//! Uses `lseek(2)` with `SEEK_DATA`/`SEEK_HOLE` to find data extents within a
//! chunk without reading its bytes. Falls back to a single extent spanning
//! the whole chunk when the primitive is unavailable on the host — this
//! preserves correctness and determinism but degrades sparsity (spec §9).

use std::fs::File;
use std::os::unix::io::AsRawFd;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A non-hole region within a chunk, offset relative to the chunk start
/// (spec §3). Extents are non-overlapping and strictly ordered by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseExtent {
    pub offset: i64,
    pub length: i64,
}

#[cfg(target_os = "linux")]
mod seek_const {
    pub const SEEK_DATA: i32 = 3;
    pub const SEEK_HOLE: i32 = 4;
}

#[cfg(target_os = "macos")]
mod seek_const {
    pub const SEEK_HOLE: i32 = 3;
    pub const SEEK_DATA: i32 = 4;
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod seek_const {
    // No portable value; detect_extents falls back before using these.
    pub const SEEK_DATA: i32 = -1;
    pub const SEEK_HOLE: i32 = -1;
}

fn raw_lseek(fd: i32, offset: i64, whence: i32) -> std::io::Result<i64> {
    let result = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result as i64)
    }
}

fn primitive_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos"))
}

/// Detect data extents in `[chunk_offset, chunk_offset + chunk_length)`.
/// Restores the file's seek position before returning.
pub fn detect_extents(file: &File, chunk_offset: u64, chunk_length: u64) -> Result<Vec<SparseExtent>> {
    let fd = file.as_raw_fd();
    let saved_pos = raw_lseek(fd, 0, libc::SEEK_CUR).map_err(|e| Error::io("<fd>", e))?;
    let result = detect_extents_inner(fd, chunk_offset, chunk_length);
    let _ = raw_lseek(fd, saved_pos, libc::SEEK_SET);
    result
}

fn detect_extents_inner(fd: i32, chunk_offset: u64, chunk_length: u64) -> Result<Vec<SparseExtent>> {
    if !primitive_supported() {
        return Ok(vec![SparseExtent {
            offset: 0,
            length: chunk_length as i64,
        }]);
    }

    let end = chunk_offset as i64 + chunk_length as i64;
    let mut extents = Vec::new();
    let mut pos = chunk_offset as i64;

    while pos < end {
        let data_start = match raw_lseek(fd, pos, seek_const::SEEK_DATA) {
            Ok(off) => off,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => break,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                return Ok(fallback_single_extent(chunk_offset, chunk_length, &extents))
            }
            Err(e) => return Err(Error::io("<fd>", e)),
        };
        if data_start >= end {
            break;
        }

        let hole_start = match raw_lseek(fd, data_start, seek_const::SEEK_HOLE) {
            Ok(off) => off,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => end,
            Err(e) => return Err(Error::io("<fd>", e)),
        };
        let extent_end = hole_start.min(end);

        if extent_end > data_start {
            extents.push(SparseExtent {
                offset: data_start - chunk_offset as i64,
                length: extent_end - data_start,
            });
        }
        pos = extent_end.max(data_start + 1);
    }

    Ok(extents)
}

/// If we already found some extents before the primitive turned out to be
/// unsupported partway through, prefer a single full-span extent over a
/// partial, inconsistent list.
fn fallback_single_extent(
    chunk_offset: u64,
    chunk_length: u64,
    _partial: &[SparseExtent],
) -> Vec<SparseExtent> {
    let _ = chunk_offset;
    vec![SparseExtent {
        offset: 0,
        length: chunk_length as i64,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    #[cfg_attr(not(any(target_os = "linux", target_os = "macos")), ignore)]
    fn detects_a_single_trailing_extent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut file = std::fs::File::create(&path).unwrap();
        file.set_len(2 * 1024 * 1024).unwrap();
        file.seek(SeekFrom::Start(1024 * 1024)).unwrap();
        file.write_all(&[0xAAu8; 16]).unwrap();
        file.sync_all().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let extents = detect_extents(&file, 0, 2 * 1024 * 1024).unwrap();
        assert!(!extents.is_empty(), "expected at least one extent");
        let total: i64 = extents.iter().map(|e| e.length).sum();
        assert!(total >= 16);
    }

    #[test]
    fn fully_dense_region_falls_back_sanely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let extents = detect_extents(&file, 0, 3).unwrap();
        let total: i64 = extents.iter().map(|e| e.length).sum();
        assert_eq!(total, 3);
    }
}
