//! `ctrm unpack`: rebuild a raw disk image from an OCI layout (spec §4.5).

use std::path::PathBuf;

use clap::Args;

use ctrm::config::Config;
use ctrm::error::Result;

#[derive(Args, Debug)]
pub struct UnpackCmd {
    /// Directory holding an `oci-layout`/`index.json`/`blobs/` tree.
    pub layout: PathBuf,
    /// Path to write the rebuilt disk image to.
    pub output: PathBuf,

    /// Verify each chunk's raw SHA-256 after reassembly, even if the
    /// configured default is off.
    #[arg(long)]
    pub verify_raw_digest: bool,
}

impl UnpackCmd {
    pub fn run(&self, config: &Config) -> Result<()> {
        let inputs = ctrm_diskimage::read_oci_layout(&self.layout)?;
        let verify = self.verify_raw_digest || config.verify_raw_digest;
        ctrm_diskimage::rebuild_disk(&inputs, &self.output, verify)?;
        tracing::info!(output = %self.output.display(), "rebuilt disk image");
        Ok(())
    }
}
