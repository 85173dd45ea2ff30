//! Sidecar process launcher (spec §4.7's owner process).
//!
//! The old helper launcher forked and `krun_start_enter`'d a VM directly in
//! the child; VM construction is out of scope here (modeled only behind
//! `ctrm-sidecar`'s `VirtualizationHost` seam), so this launcher's job
//! shrinks to what's left: spawn the `ctrm-sidecar` binary as an ordinary
//! subprocess and wait for its control socket to come up.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::SandboxPaths;
use crate::error::{Error, Result};

/// Unix socket path for a sandbox's sidecar control connection (spec §4.7,
/// §6). Mirrors `ctrm-sidecar::server::socket_path`; duplicated rather than
/// depended on so this crate only ever launches the sidecar binary, never
/// links against it (see DESIGN.md).
pub fn socket_path(sandbox_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/ctrm-sidecar-{sandbox_id}.sock"))
}

pub struct SidecarHandle {
    pub child: Child,
    pub socket_path: PathBuf,
}

/// Spawn `ctrm-sidecar <sandbox-id> <agent-socket-dir>`, redirecting its
/// stdout/stderr to sibling log files under the sandbox's persisted state
/// directory (spec §6 "Sidecar plist and stdout/stderr logs").
pub fn spawn_sidecar(
    sandbox_id: &str,
    agent_socket_dir: &Path,
    paths: &SandboxPaths,
) -> Result<SidecarHandle> {
    paths.ensure()?;
    let exe = sidecar_binary_path();

    let stdout_path = paths.sidecar_stdout_log();
    let stderr_path = paths.sidecar_stderr_log();
    let stdout_log = std::fs::File::create(&stdout_path).map_err(|e| Error::io(e, &stdout_path))?;
    let stderr_log = std::fs::File::create(&stderr_path).map_err(|e| Error::io(e, &stderr_path))?;

    let child = Command::new(&exe)
        .arg(sandbox_id)
        .arg(agent_socket_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
        .map_err(|e| Error::sidecar(format!("failed to spawn {}: {e}", exe.display())))?;

    Ok(SidecarHandle { child, socket_path: socket_path(sandbox_id) })
}

/// Resolve the sidecar binary next to the current executable (how cargo
/// lays out a workspace's sibling binaries), falling back to a bare `PATH`
/// lookup by name.
fn sidecar_binary_path() -> PathBuf {
    if let Ok(mut path) = std::env::current_exe() {
        path.set_file_name("ctrm-sidecar");
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("ctrm-sidecar")
}

/// Poll for the control socket to start accepting connections.
pub fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut last_err: Option<io::Error> = None;
    while start.elapsed() < timeout {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(Error::timeout(format!(
        "sidecar control socket {} not ready after {timeout:?}: {}",
        path.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_matches_the_spec_fixed_prefix() {
        assert_eq!(
            socket_path("abc123"),
            PathBuf::from("/tmp/ctrm-sidecar-abc123.sock")
        );
    }

    #[test]
    fn wait_for_socket_times_out_against_nothing_listening() {
        let path = std::env::temp_dir().join(format!("ctrm-launcher-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let err = wait_for_socket(&path, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
