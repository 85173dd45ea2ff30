//! `ctrm`: packages, distributes, and runs macOS VM images as OCI artifacts.
//!
//! This crate is the host side: configuration, the sidecar launcher/client,
//! the host helper session manager (spec §4.8), and the terminal plumbing a
//! CLI `exec` needs. The chunked disk codec and OCI layout live in
//! `ctrm-diskimage`; the wire schemas live in `ctrm-protocol`; the guest-agent
//! and sidecar binaries are separate crates this one only launches.

pub mod config;
pub mod error;
pub mod helper;
pub mod terminal;

pub use error::{Error, Result};

/// Crate version, surfaced on the CLI's `--version` and logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
