//! `ctrm pack`: build an OCI layout from a raw disk image plus VM assets
//! (spec §4.4).

use std::path::PathBuf;

use clap::Args;
use ctrm_diskimage::PackageInputs;

use ctrm::config::Config;
use ctrm::error::{Error, Result};

#[derive(Args, Debug)]
pub struct PackCmd {
    /// Raw disk image to chunk and package.
    pub disk_image: PathBuf,
    /// Hardware model blob (opaque to the codec).
    pub hardware_model: PathBuf,
    /// Auxiliary storage blob (opaque to the codec).
    pub auxiliary_storage: PathBuf,
    /// Directory to write the OCI layout into; must not already exist.
    pub output: PathBuf,

    /// Also archive the finished layout into a single tar at this path.
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Override the configured chunk size (bytes).
    #[arg(long)]
    pub chunk_size: Option<u64>,
    /// Override the configured zstd compression level.
    #[arg(long)]
    pub zstd_level: Option<i32>,
}

impl PackCmd {
    pub fn run(&self, config: &Config) -> Result<()> {
        if self.output.exists() {
            return Err(Error::Exists(self.output.clone()));
        }

        let inputs = PackageInputs {
            disk_path: &self.disk_image,
            hardware_model_path: &self.hardware_model,
            auxiliary_storage_path: &self.auxiliary_storage,
            chunk_size: self.chunk_size.unwrap_or(config.chunk_size),
            zstd_level: self.zstd_level.unwrap_or(config.zstd_level),
        };

        let output = ctrm_diskimage::build_oci_layout(&self.output, &inputs)?;
        tracing::info!(
            chunks = output.layout.chunk_count,
            logical_size = output.layout.logical_size,
            "packed OCI layout"
        );

        if let Some(archive) = &self.archive {
            ctrm_diskimage::archive_oci_layout(&self.output, archive)?;
            tracing::info!(archive = %archive.display(), "archived OCI layout");
        }

        Ok(())
    }
}
