//! OCI descriptors, the macOS image manifest, and the `MacOSImageLayers`
//! tagged union (spec §3, §6, §9 "Polymorphism").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::{ChunkInfo, DiskLayout};

pub const MEDIA_TYPE_HARDWARE_MODEL: &str = "application/vnd.apple.container.macos.hardware-model";
pub const MEDIA_TYPE_AUXILIARY_STORAGE: &str =
    "application/vnd.apple.container.macos.auxiliary-storage";
pub const MEDIA_TYPE_DISK_IMAGE_V0: &str = "application/vnd.apple.container.macos.disk-image";
pub const MEDIA_TYPE_DISK_LAYOUT_V1: &str =
    "application/vnd.apple.container.macos.disk-layout.v1+json";
pub const MEDIA_TYPE_DISK_CHUNK_V1: &str =
    "application/vnd.apple.container.macos.disk-chunk.v1.tar+zstd";

pub const ANNOTATION_CHUNK_INDEX: &str = "org.apple.container.macos.chunk.index";
pub const ANNOTATION_CHUNK_OFFSET: &str = "org.apple.container.macos.chunk.offset";
pub const ANNOTATION_CHUNK_LENGTH: &str = "org.apple.container.macos.chunk.length";
pub const ANNOTATION_CHUNK_RAW_DIGEST: &str = "org.apple.container.macos.chunk.raw.digest";
pub const ANNOTATION_CHUNK_RAW_LENGTH: &str = "org.apple.container.macos.chunk.raw.length";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

pub fn macos_platform() -> Platform {
    Platform {
        architecture: "arm64".to_string(),
        os: "darwin".to_string(),
    }
}

/// An OCI content descriptor (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest_hex: &str, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: format!("sha256:{digest_hex}"),
            size,
            annotations: HashMap::new(),
            platform: None,
        }
    }

    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    /// The digest's hex suffix, used as the `blobs/sha256/<hex>` file name.
    pub fn digest_hex(&self) -> Result<&str> {
        self.digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::format(format!("unsupported digest algorithm: {}", self.digest)))
    }
}

/// Build the annotation map for a chunk descriptor (spec §3: "Each chunk
/// descriptor carries annotations replicating its ChunkInfo fields").
pub fn chunk_annotations(info: &ChunkInfo) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(ANNOTATION_CHUNK_INDEX.to_string(), info.index.to_string());
    map.insert(ANNOTATION_CHUNK_OFFSET.to_string(), info.offset.to_string());
    map.insert(ANNOTATION_CHUNK_LENGTH.to_string(), info.length.to_string());
    map.insert(
        ANNOTATION_CHUNK_RAW_DIGEST.to_string(),
        info.raw_digest.clone(),
    );
    map.insert(
        ANNOTATION_CHUNK_RAW_LENGTH.to_string(),
        info.raw_length.to_string(),
    );
    map
}

/// The manifest's layer set, as a tagged union distinguishing the legacy
/// single-blob v0 layout from the chunked v1 layout (spec §9).
#[derive(Debug, Clone, PartialEq)]
pub enum MacOSImageLayers {
    V0 {
        disk_image: Descriptor,
    },
    V1 {
        hardware_model: Descriptor,
        auxiliary_storage: Descriptor,
        disk_layout: Descriptor,
        disk_chunks: Vec<Descriptor>,
    },
}

impl MacOSImageLayers {
    /// Parse a manifest's layer descriptors into the matching variant,
    /// rejecting duplicate or missing required media types (spec §9).
    pub fn from_layers(layers: &[Descriptor]) -> Result<Self> {
        let v0_disk: Vec<&Descriptor> = layers
            .iter()
            .filter(|d| d.media_type == MEDIA_TYPE_DISK_IMAGE_V0)
            .collect();
        let has_v1_markers = layers
            .iter()
            .any(|d| d.media_type == MEDIA_TYPE_DISK_LAYOUT_V1);

        if !v0_disk.is_empty() && has_v1_markers {
            return Err(Error::format(
                "manifest mixes v0 disk-image and v1 disk-layout media types",
            ));
        }

        if !v0_disk.is_empty() {
            if v0_disk.len() > 1 {
                return Err(Error::format("duplicate disk-image (v0) layer"));
            }
            return Ok(MacOSImageLayers::V0 {
                disk_image: v0_disk[0].clone(),
            });
        }

        let hardware_model = find_unique(layers, MEDIA_TYPE_HARDWARE_MODEL)?;
        let auxiliary_storage = find_unique(layers, MEDIA_TYPE_AUXILIARY_STORAGE)?;
        let disk_layout = find_unique(layers, MEDIA_TYPE_DISK_LAYOUT_V1)?;
        let disk_chunks: Vec<Descriptor> = layers
            .iter()
            .filter(|d| d.media_type == MEDIA_TYPE_DISK_CHUNK_V1)
            .cloned()
            .collect();
        if disk_chunks.is_empty() {
            return Err(Error::format("v1 manifest has no disk-chunk layers"));
        }

        Ok(MacOSImageLayers::V1 {
            hardware_model,
            auxiliary_storage,
            disk_layout,
            disk_chunks,
        })
    }

    /// Flatten back into the manifest's fixed layer order (spec §3:
    /// `[hardwareModel, auxiliaryStorage, diskLayout, diskChunks[0..N-1]]`).
    pub fn to_layers(&self) -> Vec<Descriptor> {
        match self {
            MacOSImageLayers::V0 { disk_image } => vec![disk_image.clone()],
            MacOSImageLayers::V1 {
                hardware_model,
                auxiliary_storage,
                disk_layout,
                disk_chunks,
            } => {
                let mut layers = vec![
                    hardware_model.clone(),
                    auxiliary_storage.clone(),
                    disk_layout.clone(),
                ];
                layers.extend(disk_chunks.iter().cloned());
                layers
            }
        }
    }
}

fn find_unique(layers: &[Descriptor], media_type: &str) -> Result<Descriptor> {
    let matches: Vec<&Descriptor> = layers.iter().filter(|d| d.media_type == media_type).collect();
    match matches.len() {
        0 => Err(Error::format(format!("missing required layer: {media_type}"))),
        1 => Ok(matches[0].clone()),
        _ => Err(Error::format(format!("duplicate layer: {media_type}"))),
    }
}

/// Minimal OCI config blob (spec §4.4: "a minimal config blob").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        let platform = macos_platform();
        Self {
            architecture: platform.architecture,
            os: platform.os,
        }
    }
}

/// Minimal OCI image manifest (media type omitted here; callers fill it in
/// per the OCI image-spec when serializing the top-level JSON object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: MacOSImageLayers) -> Self {
        Self {
            schema_version: 2,
            config,
            layers: layers.to_layers(),
        }
    }
}

/// Everything a rebuild needs: the parsed layout plus a lookup from layer
/// digest to local blob path (spec §4.5: "given a DiskLayout and a map from
/// layerDigest -> local blob path").
pub struct RebuildInputs {
    pub layout: DiskLayout,
    pub blob_paths: HashMap<String, std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str) -> Descriptor {
        Descriptor::new(media_type, "aa", 1)
    }

    #[test]
    fn parses_v1_layer_set() {
        let layers = vec![
            descriptor(MEDIA_TYPE_HARDWARE_MODEL),
            descriptor(MEDIA_TYPE_AUXILIARY_STORAGE),
            descriptor(MEDIA_TYPE_DISK_LAYOUT_V1),
            descriptor(MEDIA_TYPE_DISK_CHUNK_V1),
            descriptor(MEDIA_TYPE_DISK_CHUNK_V1),
        ];
        let parsed = MacOSImageLayers::from_layers(&layers).unwrap();
        match parsed {
            MacOSImageLayers::V1 { disk_chunks, .. } => assert_eq!(disk_chunks.len(), 2),
            _ => panic!("expected v1"),
        }
    }

    #[test]
    fn parses_v0_layer_set() {
        let layers = vec![descriptor(MEDIA_TYPE_DISK_IMAGE_V0)];
        let parsed = MacOSImageLayers::from_layers(&layers).unwrap();
        assert!(matches!(parsed, MacOSImageLayers::V0 { .. }));
    }

    #[test]
    fn rejects_duplicate_required_layer() {
        let layers = vec![
            descriptor(MEDIA_TYPE_HARDWARE_MODEL),
            descriptor(MEDIA_TYPE_HARDWARE_MODEL),
            descriptor(MEDIA_TYPE_AUXILIARY_STORAGE),
            descriptor(MEDIA_TYPE_DISK_LAYOUT_V1),
            descriptor(MEDIA_TYPE_DISK_CHUNK_V1),
        ];
        assert!(MacOSImageLayers::from_layers(&layers).is_err());
    }

    #[test]
    fn rejects_missing_required_layer() {
        let layers = vec![
            descriptor(MEDIA_TYPE_HARDWARE_MODEL),
            descriptor(MEDIA_TYPE_DISK_LAYOUT_V1),
            descriptor(MEDIA_TYPE_DISK_CHUNK_V1),
        ];
        assert!(MacOSImageLayers::from_layers(&layers).is_err());
    }

    #[test]
    fn rejects_mixed_v0_and_v1_markers() {
        let layers = vec![descriptor(MEDIA_TYPE_DISK_IMAGE_V0), descriptor(MEDIA_TYPE_DISK_LAYOUT_V1)];
        assert!(MacOSImageLayers::from_layers(&layers).is_err());
    }

    #[test]
    fn round_trips_through_fixed_layer_order() {
        let layers = MacOSImageLayers::V1 {
            hardware_model: descriptor(MEDIA_TYPE_HARDWARE_MODEL),
            auxiliary_storage: descriptor(MEDIA_TYPE_AUXILIARY_STORAGE),
            disk_layout: descriptor(MEDIA_TYPE_DISK_LAYOUT_V1),
            disk_chunks: vec![descriptor(MEDIA_TYPE_DISK_CHUNK_V1)],
        };
        let flat = layers.to_layers();
        assert_eq!(flat[0].media_type, MEDIA_TYPE_HARDWARE_MODEL);
        assert_eq!(flat[1].media_type, MEDIA_TYPE_AUXILIARY_STORAGE);
        assert_eq!(flat[2].media_type, MEDIA_TYPE_DISK_LAYOUT_V1);
        assert_eq!(flat[3].media_type, MEDIA_TYPE_DISK_CHUNK_V1);
        let back = MacOSImageLayers::from_layers(&flat).unwrap();
        assert_eq!(back, layers);
    }
}
