//! Global ctrm configuration (spec §6 "Environment/configuration options").
//!
//! Persisted as TOML under the platform config directory, following the
//! same `dirs`-based load/save shape the teacher used for its VM registry
//! (`confy`-backed `SmolvmConfig`), minus the VM registry itself — sandbox
//! state now lives on disk per spec §6, not in this file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const APP_NAME: &str = "ctrm";
const CONFIG_FILE: &str = "config.toml";

/// Global ctrm configuration. Every field here has a spec-fixed default
/// (§3, §6); overriding `chunk_size` or `zstd_level` changes digests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Configuration format version.
    pub version: u8,

    /// Chunk size for the disk codec (spec §3: default 1 GiB).
    pub chunk_size: u64,

    /// zstd compression level for chunk blobs (spec §3: default 3).
    pub zstd_level: i32,

    /// Verify each chunk's raw SHA-256 after rebuild (spec §4.5 step 4).
    pub verify_raw_digest: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            chunk_size: ctrm_diskimage::DEFAULT_CHUNK_SIZE,
            zstd_level: ctrm_diskimage::DEFAULT_ZSTD_LEVEL,
            verify_raw_digest: false,
        }
    }
}

impl Config {
    /// Load configuration from the platform config directory. Missing file
    /// is not an error: callers get spec defaults.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| Error::config(format!("{}: {e}", path.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(e, path)),
        }
    }

    /// Save configuration to the platform config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    fn path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| Error::config("could not determine a config directory"))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

/// Where a sandbox's persisted state lives (spec §6 "Persisted sandbox
/// state (directory layout)"): `Disk.img`, `AuxiliaryStorage`,
/// `HardwareModel.bin`, `MachineIdentifier.bin`, `config.json`,
/// `stdio.log`, `vminitd.log`, plus sidecar plist/stdout/stderr logs.
pub struct SandboxPaths {
    root: PathBuf,
}

impl SandboxPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `<data dir>/ctrm/sandboxes/<id>`.
    pub fn for_sandbox(sandbox_id: &str) -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::config("could not determine a data directory"))?;
        Ok(Self::new(data_dir.join(APP_NAME).join("sandboxes").join(sandbox_id)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join("Disk.img")
    }

    pub fn auxiliary_storage(&self) -> PathBuf {
        self.root.join("AuxiliaryStorage")
    }

    pub fn hardware_model(&self) -> PathBuf {
        self.root.join("HardwareModel.bin")
    }

    pub fn machine_identifier(&self) -> PathBuf {
        self.root.join("MachineIdentifier.bin")
    }

    pub fn container_config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn stdio_log(&self) -> PathBuf {
        self.root.join("stdio.log")
    }

    pub fn vminitd_log(&self) -> PathBuf {
        self.root.join("vminitd.log")
    }

    pub fn sidecar_stdout_log(&self) -> PathBuf {
        self.root.join("sidecar.stdout.log")
    }

    pub fn sidecar_stderr_log(&self) -> PathBuf {
        self.root.join("sidecar.stderr.log")
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_fixed_values() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 1024 * 1024 * 1024);
        assert_eq!(config.zstd_level, 3);
        assert!(!config.verify_raw_digest);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config { chunk_size: 512, zstd_level: 5, verify_raw_digest: true, version: 1 };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn sandbox_paths_match_spec_filenames() {
        let paths = SandboxPaths::new("/tmp/sbx-1");
        assert_eq!(paths.disk_image(), PathBuf::from("/tmp/sbx-1/Disk.img"));
        assert_eq!(paths.auxiliary_storage(), PathBuf::from("/tmp/sbx-1/AuxiliaryStorage"));
        assert_eq!(paths.hardware_model(), PathBuf::from("/tmp/sbx-1/HardwareModel.bin"));
        assert_eq!(paths.vminitd_log(), PathBuf::from("/tmp/sbx-1/vminitd.log"));
    }
}
