use std::fmt;

/// Error taxonomy shared across the wire protocols (spec §7: kinds, not names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Format,
    NotFound,
    Exists,
    Unsupported,
    Timeout,
    Protocol,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Exists => "exists",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {len} bytes exceeds max {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("malformed frame: {0}")]
    Format(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("eof mid-frame")]
    UnexpectedEof,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::FrameTooLarge { .. } => ErrorKind::Format,
            Error::Format(_) => ErrorKind::Format,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::UnexpectedEof => ErrorKind::Protocol,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
