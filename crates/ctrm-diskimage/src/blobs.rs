//! Idempotent, content-addressed blob staging (spec §4.3 step 4, §4.4, §5:
//! "first-writer-wins, duplicates dropped"). Shared by the chunk codec and
//! the OCI artifact builder so the invariant lives in one place
//! (SPEC_FULL.md §4 item 3).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Move `tmp_path` into `blobs_sha256_dir` under its digest name. If a blob
/// with that digest already exists, the new copy is dropped and the
/// existing path is returned unchanged.
pub fn stage_blob(tmp_path: &Path, digest_hex: &str, blobs_sha256_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(blobs_sha256_dir).map_err(|e| crate::error::Error::io(blobs_sha256_dir, e))?;
    let dest = blobs_sha256_dir.join(digest_hex);
    if dest.exists() {
        let _ = fs::remove_file(tmp_path);
        return Ok(dest);
    }
    if fs::rename(tmp_path, &dest).is_err() {
        fs::copy(tmp_path, &dest).map_err(|e| crate::error::Error::io(&dest, e))?;
        let _ = fs::remove_file(tmp_path);
    }
    Ok(dest)
}
