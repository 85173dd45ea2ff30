//! Host helper: launches and talks to a sandbox's sidecar control server
//! (spec §4.7, §4.8).

mod client;
mod launcher;
mod manager;

pub use client::{dial_vsock, ControlClient};
pub use launcher::{socket_path, spawn_sidecar, wait_for_socket, SidecarHandle};
pub use manager::{HostHelperManager, ProcessStdio};
