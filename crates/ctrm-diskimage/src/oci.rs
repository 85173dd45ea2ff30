//! OCI artifact builder and reader (spec §4.4, §6).
//!
//! Lays out `oci-layout`, `index.json`, and `blobs/sha256/<digest>` on disk,
//! then (optionally) streams that directory into a single archive tar,
//! freeing staged blobs as they're appended to bound peak disk use.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::blobs::stage_blob;
use crate::chunk::{package_chunk, sha256_file_hex};
use crate::error::{Error, Result};
use crate::json::to_canonical_json;
use crate::layout::{chunk_count_for, chunk_span, DiskLayout};
use crate::manifest::{
    chunk_annotations, Descriptor, ImageConfig, MacOSImageLayers, Manifest, RebuildInputs,
    MEDIA_TYPE_AUXILIARY_STORAGE, MEDIA_TYPE_DISK_CHUNK_V1, MEDIA_TYPE_DISK_LAYOUT_V1,
    MEDIA_TYPE_HARDWARE_MODEL,
};

const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Exact contents of the `oci-layout` marker file (spec §6).
const OCI_LAYOUT_MARKER: &str = "{\"imageLayoutVersion\":\"1.0.0\"}\n";

/// Blobs at or above this size are deferred to the archive builder's second
/// phase (spec §4.4: "append each large blob, deleting the staged copy
/// immediately after append succeeds"). VM disk assets and chunk blobs are
/// always well above this; metadata blobs are always well below it.
const LARGE_BLOB_THRESHOLD: u64 = 1024 * 1024;

pub struct PackageInputs<'a> {
    pub disk_path: &'a Path,
    pub hardware_model_path: &'a Path,
    pub auxiliary_storage_path: &'a Path,
    pub chunk_size: u64,
    pub zstd_level: i32,
}

pub struct PackageOutput {
    pub layout: DiskLayout,
    pub manifest_descriptor: Descriptor,
}

fn blobs_dir(root: &Path) -> PathBuf {
    root.join("blobs").join("sha256")
}

fn stage_file_blob(root: &Path, media_type: &str, src: &Path) -> Result<Descriptor> {
    let digest_hex = sha256_file_hex(src)?;
    let size = std::fs::metadata(src).map_err(|e| Error::io(src, e))?.len();
    let tmp = blobs_dir(root).join(format!(".stage-{digest_hex}.tmp"));
    std::fs::create_dir_all(blobs_dir(root)).map_err(|e| Error::io(&blobs_dir(root), e))?;
    std::fs::copy(src, &tmp).map_err(|e| Error::io(src, e))?;
    stage_blob(&tmp, &digest_hex, &blobs_dir(root))?;
    Ok(Descriptor::new(media_type, &digest_hex, size))
}

fn stage_json_blob<T: serde::Serialize>(root: &Path, media_type: &str, value: &T) -> Result<Descriptor> {
    let bytes = to_canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest_hex = hex::encode(hasher.finalize());
    let dir = blobs_dir(root);
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let tmp = dir.join(format!(".stage-{digest_hex}.tmp"));
    std::fs::write(&tmp, &bytes).map_err(|e| Error::io(&tmp, e))?;
    stage_blob(&tmp, &digest_hex, &dir)?;
    Ok(Descriptor::new(media_type, &digest_hex, bytes.len() as u64))
}

/// Build a complete v1 OCI layout at `root` from a raw disk image plus the
/// VM asset blobs (spec §4.4). The builder never recomputes digests it
/// already has; per-chunk raw digests are produced once by [`crate::chunk`].
pub fn build_oci_layout(root: &Path, inputs: &PackageInputs) -> Result<PackageOutput> {
    std::fs::create_dir_all(&blobs_dir(root)).map_err(|e| Error::io(&blobs_dir(root), e))?;
    std::fs::write(root.join("oci-layout"), OCI_LAYOUT_MARKER)
        .map_err(|e| Error::io(root, e))?;

    let hardware_model =
        stage_file_blob(root, MEDIA_TYPE_HARDWARE_MODEL, inputs.hardware_model_path)?;
    let auxiliary_storage = stage_file_blob(
        root,
        MEDIA_TYPE_AUXILIARY_STORAGE,
        inputs.auxiliary_storage_path,
    )?;

    let disk = File::open(inputs.disk_path).map_err(|e| Error::io(inputs.disk_path, e))?;
    let logical_size = disk
        .metadata()
        .map_err(|e| Error::io(inputs.disk_path, e))?
        .len();
    let chunk_count = chunk_count_for(logical_size, inputs.chunk_size);

    let mut chunk_infos = Vec::with_capacity(chunk_count);
    let mut disk_chunk_descriptors = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let (offset, length) = chunk_span(index, logical_size, inputs.chunk_size);
        let result = package_chunk(
            &disk,
            index,
            offset,
            length,
            &blobs_dir(root),
            inputs.zstd_level,
        )?;
        let descriptor = Descriptor::new(
            MEDIA_TYPE_DISK_CHUNK_V1,
            result.info.layer_digest.strip_prefix("sha256:").unwrap(),
            result.info.layer_size,
        )
        .with_annotations(chunk_annotations(&result.info));
        disk_chunk_descriptors.push(descriptor);
        chunk_infos.push(result.info);
    }

    let layout = DiskLayout::new(logical_size, inputs.chunk_size, inputs.zstd_level, chunk_infos);
    layout.validate()?;
    let disk_layout_descriptor = stage_json_blob(root, MEDIA_TYPE_DISK_LAYOUT_V1, &layout)?;

    let layers = MacOSImageLayers::V1 {
        hardware_model,
        auxiliary_storage,
        disk_layout: disk_layout_descriptor,
        disk_chunks: disk_chunk_descriptors,
    };

    let config_descriptor = stage_json_blob(root, MEDIA_TYPE_IMAGE_CONFIG, &ImageConfig::default())?;
    let manifest = Manifest::new(config_descriptor, layers);
    let manifest_descriptor = stage_json_blob(root, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)?;

    write_index(root, &manifest_descriptor)?;

    Ok(PackageOutput {
        layout,
        manifest_descriptor,
    })
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Index {
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

fn write_index(root: &Path, manifest_descriptor: &Descriptor) -> Result<()> {
    let index = Index {
        schema_version: 2,
        manifests: vec![manifest_descriptor.clone()],
    };
    let bytes = to_canonical_json(&index)?;
    std::fs::write(root.join("index.json"), bytes).map_err(|e| Error::io(root, e))
}

fn read_blob_json<T: serde::de::DeserializeOwned>(root: &Path, descriptor: &Descriptor) -> Result<T> {
    let path = blobs_dir(root).join(descriptor.digest_hex()?);
    let bytes = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::format(e.to_string()))
}

/// Read an on-disk OCI layout back into `DiskLayout` + the per-digest blob
/// path lookup a rebuilder needs (SPEC_FULL.md §4 item 2).
pub fn read_oci_layout(root: &Path) -> Result<RebuildInputs> {
    let index_bytes =
        std::fs::read(root.join("index.json")).map_err(|e| Error::io(root, e))?;
    let index: Index =
        serde_json::from_slice(&index_bytes).map_err(|e| Error::format(e.to_string()))?;
    let manifest_descriptor = index
        .manifests
        .first()
        .ok_or_else(|| Error::format("index.json has no manifests"))?;
    let manifest: Manifest = read_blob_json(root, manifest_descriptor)?;

    let layers = MacOSImageLayers::from_layers(&manifest.layers)?;
    let (disk_layout_descriptor, disk_chunks) = match &layers {
        MacOSImageLayers::V1 {
            disk_layout,
            disk_chunks,
            ..
        } => (disk_layout.clone(), disk_chunks.clone()),
        MacOSImageLayers::V0 { .. } => {
            return Err(Error::Unsupported(
                "legacy v0 disk-image layer has no chunked layout to rebuild from".into(),
            ))
        }
    };

    let layout: DiskLayout = read_blob_json(root, &disk_layout_descriptor)?;
    layout.validate()?;

    let mut blob_paths = HashMap::new();
    for chunk_descriptor in &disk_chunks {
        let hex = chunk_descriptor.digest_hex()?.to_string();
        blob_paths.insert(
            chunk_descriptor.digest.clone(),
            blobs_dir(root).join(&hex),
        );
    }

    Ok(RebuildInputs { layout, blob_paths })
}

/// Stream an on-disk OCI layout directory into a single archive tar (spec
/// §4.4). Small metadata files are appended first; large blobs are appended
/// second and their staged copies removed immediately after each succeeds,
/// bounding peak disk use to roughly one blob at a time.
pub fn archive_oci_layout(root: &Path, dest_tar: &Path) -> Result<()> {
    let file = File::create(dest_tar).map_err(|e| Error::io(dest_tar, e))?;
    let mut builder = tar::Builder::new(file);
    builder.mode(tar::HeaderMode::Deterministic);

    builder
        .append_path_with_name(root.join("oci-layout"), "oci-layout")
        .map_err(|e| Error::io(root, e))?;
    builder
        .append_path_with_name(root.join("index.json"), "index.json")
        .map_err(|e| Error::io(root, e))?;

    let dir = blobs_dir(root);
    let mut entries: Vec<(PathBuf, u64)> = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
        let entry = entry.map_err(|e| Error::io(&dir, e))?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with('.')) == Some(true) {
            continue; // stray .tmp leftovers, never finalized blobs.
        }
        let size = entry.metadata().map_err(|e| Error::io(&path, e))?.len();
        entries.push((path, size));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let (small, large): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|(_, size)| *size < LARGE_BLOB_THRESHOLD);

    for (path, _) in &small {
        append_blob(&mut builder, root, path)?;
    }
    for (path, _) in &large {
        append_blob(&mut builder, root, path)?;
        std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    }

    builder.finish().map_err(|e| Error::io(dest_tar, e))
}

fn append_blob<W: Write>(builder: &mut tar::Builder<W>, root: &Path, path: &Path) -> Result<()> {
    let name = path
        .strip_prefix(root)
        .map_err(|_| Error::format("blob path escaped layout root"))?;
    builder
        .append_path_with_name(path, name)
        .map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn write_zeroed(path: &Path, len: u64) {
        let f = File::create(path).unwrap();
        f.set_len(len).unwrap();
    }

    #[test]
    fn builds_a_v1_layout_with_expected_layer_order() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, [1u8, 2, 3]).unwrap();
        let hw_path = dir.path().join("HardwareModel.bin");
        std::fs::write(&hw_path, b"hw-model-bytes").unwrap();
        let aux_path = dir.path().join("AuxiliaryStorage");
        std::fs::write(&aux_path, b"aux-bytes").unwrap();

        let root = dir.path().join("layout");
        let output = build_oci_layout(
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

        assert_eq!(output.layout.chunk_count, 1);
        assert!(root.join("oci-layout").exists());
        assert_eq!(
            std::fs::read_to_string(root.join("oci-layout")).unwrap(),
            OCI_LAYOUT_MARKER
        );
        assert!(root.join("index.json").exists());
    }

    #[test]
    fn reads_back_what_it_built() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        write_zeroed(&disk_path, 9000);
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&disk_path).unwrap();
            f.seek(std::io::SeekFrom::Start(0)).unwrap();
            f.write_all(&[9u8; 16]).unwrap();
        }
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

        let inputs = read_oci_layout(&root).unwrap();
        assert_eq!(inputs.layout.logical_size, 9000);
        assert_eq!(inputs.blob_paths.len(), inputs.layout.chunks.len());
        for chunk in &inputs.layout.chunks {
            assert!(inputs.blob_paths.contains_key(&chunk.layer_digest));
        }
    }

    #[test]
    fn archives_into_a_single_tar_and_frees_large_blobs() {
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

        let dest_tar = dir.path().join("out.tar");
        archive_oci_layout(&root, &dest_tar).unwrap();
        assert!(dest_tar.exists());
        assert!(std::fs::metadata(&dest_tar).unwrap().len() > 0);
    }
}
