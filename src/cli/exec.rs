//! `ctrm exec`: run one command in a sandbox's guest agent, via its sidecar
//! (spec §4.7, §4.8). Drives the same host helper session manager a real
//! container runtime's XPC surface would.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use ctrm_protocol::ExecSpec;

use ctrm::config::SandboxPaths;
use ctrm::error::{Error, Result};
use ctrm::helper::{HostHelperManager, ProcessStdio};
use ctrm::terminal::{stdin_is_tty, RawModeGuard};

#[derive(Args, Debug)]
pub struct ExecCmd {
    /// Sandbox id; selects the sidecar's control socket and persisted state.
    pub sandbox_id: String,

    /// vsock port the guest agent listens on. Under the loopback host this
    /// maps to `<agent-socket-dir>/port-<port>.sock`.
    #[arg(long, default_value_t = 7000)]
    pub port: u32,

    /// Directory holding the loopback agent sockets. Defaults to a path
    /// derived from the sandbox id.
    #[arg(long)]
    pub agent_socket_dir: Option<PathBuf>,

    /// Allocate a pty and run interactively.
    #[arg(short, long)]
    pub interactive: bool,

    /// Command and arguments to execute in the guest.
    #[arg(required = true)]
    pub command: Vec<String>,
}

impl ExecCmd {
    pub fn run(&self) -> Result<()> {
        let (executable, arguments) = self
            .command
            .split_first()
            .ok_or_else(|| Error::config("no command given"))?;

        let paths = SandboxPaths::for_sandbox(&self.sandbox_id)?;
        let agent_dir = self.agent_socket_dir.clone().unwrap_or_else(|| default_agent_dir(&self.sandbox_id));

        let manager = Arc::new(HostHelperManager::launch(&self.sandbox_id, &agent_dir, &paths)?);
        manager.bootstrap_start()?;

        let terminal = self.interactive && stdin_is_tty(0);
        let exec = ExecSpec {
            executable: executable.clone(),
            arguments: arguments.to_vec(),
            environment: vec![],
            working_directory: None,
            terminal,
        };

        let process_id = uuid::Uuid::new_v4().to_string();
        manager.create_process(process_id.clone(), ProcessStdio::inherit());
        manager.start_process(&process_id, self.port, exec)?;

        let _raw_guard = if terminal { Some(RawModeGuard::enable(0)?) } else { None };
        manager.forward_stdin(process_id.clone(), std::io::stdin());

        let exit_code = manager.wait(&process_id, None)?;
        let _ = manager.shutdown();
        std::process::exit(exit_code);
    }
}

fn default_agent_dir(sandbox_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ctrm-sidecar-{sandbox_id}-agents"))
}
