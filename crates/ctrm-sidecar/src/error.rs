//! Sidecar-local error type (spec §7).

use ctrm_protocol::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ctrm_protocol::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no such process session: {0}")]
    NoSuchSession(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Protocol(e) => e.kind(),
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NoSuchSession(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
