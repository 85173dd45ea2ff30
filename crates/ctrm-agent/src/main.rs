//! ctrm guest agent.
//!
//! Runs inside the macOS VM and answers the `exec` frame protocol (spec
//! §4.6) over a single listening socket. Each accepted connection gets its
//! own thread and owns at most one child process at a time.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use tracing::{error, info, warn};

mod pty;
mod session;

fn main() {
    init_logging();
    ignore_sigpipe();

    let socket_path = listen_path();
    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "failed to bind agent socket");
            std::process::exit(1);
        }
    };
    info!(path = %socket_path.display(), "ctrm-agent listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                std::thread::spawn(move || {
                    if let Err(e) = session::run_connection(stream) {
                        warn!(error = %e, "connection terminated with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept error"),
        }
    }
}

/// Socket path comes from argv[1], defaulting to the well-known runtime path
/// the sidecar dials into for a fresh `process.start` connection.
fn listen_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/run/ctrm-agent.sock"))
}

/// A peer closing mid-write must not kill the agent (spec §4.6).
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ctrm_agent=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
