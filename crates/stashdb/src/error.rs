//! Error types for stashdb

use std::fmt;
use std::io;

/// Result type alias for stashdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Malformed log file or record
    Parse(String),

    /// Value too large (max 1 MB)
    ValueTooLarge(usize),

    /// Log file full (max 1 GB)
    StoreFull(u64),

    /// Store is closed
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::ValueTooLarge(size) => write!(f, "Value too large: {} bytes (max 1 MB)", size),
            Error::StoreFull(size) => write!(f, "Store full: {} bytes (max 1 GB)", size),
            Error::Closed => write!(f, "Store is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
