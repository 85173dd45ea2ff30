//! `ctrm sidecar`: launch (and block on) one sandbox's sidecar, for manual
//! testing without going through `exec` (spec §4.7).

use std::io::Read;
use std::path::PathBuf;

use clap::Args;

use ctrm::config::SandboxPaths;
use ctrm::error::Result;
use ctrm::helper::HostHelperManager;

#[derive(Args, Debug)]
pub struct SidecarCmd {
    /// Sandbox id; selects the sidecar's control socket and persisted state.
    pub sandbox_id: String,

    /// Directory holding the loopback agent sockets.
    #[arg(long)]
    pub agent_socket_dir: Option<PathBuf>,
}

impl SidecarCmd {
    pub fn run(&self) -> Result<()> {
        let paths = SandboxPaths::for_sandbox(&self.sandbox_id)?;
        let agent_dir = self
            .agent_socket_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("ctrm-sidecar-{}-agents", self.sandbox_id)));

        let manager = HostHelperManager::launch(&self.sandbox_id, &agent_dir, &paths)?;
        manager.bootstrap_start()?;
        println!(
            "sidecar ready for sandbox {} ({})",
            self.sandbox_id,
            ctrm::helper::socket_path(&self.sandbox_id).display()
        );
        println!("press enter to shut it down");

        let mut buf = [0u8; 1];
        let _ = std::io::stdin().read(&mut buf);
        manager.shutdown()
    }
}
