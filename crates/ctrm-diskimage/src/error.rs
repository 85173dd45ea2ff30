use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    PlainIo(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("blob not found for digest {0}")]
    BlobNotFound(String),

    #[error("chunk {index} missing blob (digest {digest})")]
    MissingChunkBlob { index: usize, digest: String },

    #[error("output already exists: {0}")]
    Exists(PathBuf),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("chunk {index}: {message}")]
    Chunk { index: usize, message: String },

    #[error("raw digest mismatch for chunk {index}: expected {expected}, got {actual}")]
    RawDigestMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
