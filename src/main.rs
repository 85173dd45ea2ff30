//! ctrm CLI entry point.

use clap::{Parser, Subcommand};
use ctrm::config::Config;
use tracing_subscriber::EnvFilter;

mod cli;

/// ctrm - packages, distributes, and runs macOS VM images as OCI artifacts
#[derive(Parser, Debug)]
#[command(name = "ctrm")]
#[command(about = "Packages, distributes, and runs macOS VM images as OCI artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Package a raw disk image and VM assets into an OCI layout.
    Pack(cli::pack::PackCmd),

    /// Rebuild a raw disk image from an OCI layout.
    Unpack(cli::unpack::UnpackCmd),

    /// Run a command in a sandbox's guest agent via its sidecar.
    Exec(cli::exec::ExecCmd),

    /// Launch and block on a sandbox's sidecar, for manual testing.
    Sidecar(cli::sidecar::SidecarCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging();
    tracing::debug!(version = ctrm::VERSION, "starting ctrm");

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            Config::default()
        }
    };

    let result = match cli.command {
        Commands::Pack(cmd) => cmd.run(&config),
        Commands::Unpack(cmd) => cmd.run(&config),
        Commands::Exec(cmd) => cmd.run(),
        Commands::Sidecar(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ctrm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
