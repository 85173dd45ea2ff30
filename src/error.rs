//! Error types for ctrm (spec §7: kinds, not names).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ctrm's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ctrm operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error, optionally annotated with the path being operated on.
    #[error("io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The chunked disk codec or OCI layout failed (wraps `ctrm-diskimage`).
    #[error("disk image error: {0}")]
    DiskImage(#[from] ctrm_diskimage::Error),

    /// A wire-protocol or sidecar control-socket operation failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ctrm_protocol::Error),

    /// Configuration could not be loaded or saved.
    #[error("configuration error: {0}")]
    Config(String),

    /// Sidecar process could not be launched or reached.
    #[error("sidecar error: {0}")]
    Sidecar(String),

    /// A bounded wait elapsed (vsock connect, guest-agent ready, wait(timeout), …).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Requested operation is invalid in the session/VM's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A named session, blob, or resource could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Output target already exists and overwrite was not requested.
    #[error("already exists: {}", .0.display())]
    Exists(PathBuf),
}

impl Error {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Error::Io { source, path: Some(path.into()) }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn sidecar(msg: impl Into<String>) -> Self {
        Error::Sidecar(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io { source, path: None }
    }
}
