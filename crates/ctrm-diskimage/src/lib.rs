//! Chunked sparse disk codec and OCI artifact layout for macOS VM images
//! (spec §3, §4.2-§4.5).

pub mod blobs;
pub mod chunk;
pub mod error;
pub mod json;
pub mod layout;
pub mod manifest;
pub mod oci;
pub mod pax;
pub mod rebuild;
pub mod sparse;

pub use error::{Error, Result};
pub use layout::{ChunkInfo, DiskLayout, DEFAULT_CHUNK_SIZE, DEFAULT_ZSTD_LEVEL};
pub use manifest::{Descriptor, MacOSImageLayers, Manifest, RebuildInputs};
pub use oci::{archive_oci_layout, build_oci_layout, read_oci_layout, PackageInputs, PackageOutput};
pub use rebuild::rebuild_disk;
pub use sparse::SparseExtent;
