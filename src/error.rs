use std::io;
use std::sync::Arc;

/// Errors produced while reading a file.
///
/// Errors are `Clone` so that the result of a single in-flight operation can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The bytes at `addr` do not form the structure we expected (bad signature, malformed
    /// message, corrupted node, checksum mismatch).
    #[error("format error at {addr:#x}: {msg}")]
    Format { addr: u64, msg: String },

    /// A recognized structure or feature which this reader does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A path segment, dataset or chunk that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The range request failed (after retries).
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The origin ended before the requested range did. The file is either truncated or still
    /// being written.
    #[error("truncated read at {offset:#x}: wanted {wanted} bytes, got {got}")]
    Truncated { offset: u64, wanted: u64, got: u64 },

    /// Invalid selection or argument from the caller.
    #[error("invalid argument: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format<S: Into<String>>(addr: u64, msg: S) -> Error {
        Error::Format {
            addr,
            msg: msg.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Invalid(format!("{e:#}"))
    }
}
