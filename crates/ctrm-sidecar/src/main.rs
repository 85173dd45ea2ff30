//! ctrm sidecar binary: owns one VM and brokers vsock dialing and process
//! streams for the container helper (spec §4.7).

use std::sync::Arc;

use ctrm_sidecar::{server, LoopbackHost};
use tracing::error;

fn main() {
    init_logging();

    let sandbox_id = match std::env::args().nth(1) {
        Some(id) => id,
        None => {
            eprintln!("usage: ctrm-sidecar <sandbox-id> [agent-socket-dir]");
            std::process::exit(2);
        }
    };
    let agent_socket_dir = std::env::args()
        .nth(2)
        .unwrap_or_else(|| format!("/tmp/ctrm-sidecar-{sandbox_id}-agents"));

    let vm = Arc::new(LoopbackHost::new(agent_socket_dir));
    let path = server::socket_path(&sandbox_id);

    if let Err(e) = server::run(&path, vm) {
        error!(error = %e, "sidecar control server exited");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ctrm_sidecar=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
