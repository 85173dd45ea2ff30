//! Seam onto the virtualization host API (spec §1: "the virtualization host
//! API ... VM construction, restore-from-installer" is an out-of-scope
//! external collaborator). `ctrm-sidecar` only needs three operations out of
//! it, modeled as a trait so the control server and its tests do not depend
//! on a real hypervisor.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// The subset of VM lifecycle the sidecar drives directly (spec §4.7).
pub trait VirtualizationHost: Send + Sync {
    /// Start the VM; returns once it is running and a socket device exists.
    fn bootstrap_start(&self) -> Result<()>;

    /// Dial the guest agent listening on `port` inside the VM. The returned
    /// stream stands in for a vsock connection (on the real host backend,
    /// the Virtualization.framework socket device exposes one as a
    /// connectable fd the same way a Unix stream does).
    fn connect_vsock(&self, port: u32) -> Result<UnixStream>;

    /// Stop the VM. Idempotent.
    fn stop(&self) -> Result<()>;
}

/// Dials a directory of well-known Unix sockets, one per port, instead of a
/// real vsock device. Used when no hypervisor backend is wired in (local
/// testing, or a host without the virtualization entitlement) — spec §9
/// "Sparsity extraction" documents the same fallback posture: degrade
/// gracefully rather than fail outright.
pub struct LoopbackHost {
    socket_dir: PathBuf,
    running: AtomicBool,
}

impl LoopbackHost {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            running: AtomicBool::new(false),
        }
    }

    fn port_path(&self, port: u32) -> PathBuf {
        self.socket_dir.join(format!("port-{port}.sock"))
    }
}

impl VirtualizationHost for LoopbackHost {
    fn bootstrap_start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.socket_dir)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connect_vsock(&self, port: u32) -> Result<UnixStream> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("vm not running".into()));
        }
        Ok(UnixStream::connect(self.port_path(port))?)
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
