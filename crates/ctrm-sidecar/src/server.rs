//! Control-socket listener (spec §4.7, §6).
//!
//! Unix stream socket at `/tmp/ctrm-sidecar-<sandbox-id>.sock`, permissions
//! restricted to owner, stale sockets unlinked at startup. One handler
//! thread per accepted connection (spec §5: "one accept loop, one handler
//! thread per accepted connection").

use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::handler::handle_connection;
use crate::vm::VirtualizationHost;

/// Well-known control socket path for a sandbox id (spec §4.7, §6).
pub fn socket_path(sandbox_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/ctrm-sidecar-{sandbox_id}.sock"))
}

pub fn run(path: &Path, vm: Arc<dyn VirtualizationHost>) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    restrict_to_owner(path)?;

    info!(path = %path.display(), "ctrm-sidecar listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let vm = vm.clone();
                std::thread::spawn(move || handle_connection(stream, vm));
            }
            Err(e) => warn!(error = %e, "accept error"),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)
}
