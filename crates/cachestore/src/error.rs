//! Error types for cachestore

use std::fmt;
use std::io;

/// Result type alias for cachestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage medium and record operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Record could not be decoded (bad frame, bad compression, truncated)
    Corrupt(String),

    /// Record payload could not be (de)serialized
    Serialization(serde_json::Error),

    /// Encoded record exceeds the per-entry cap
    ValueTooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Configured cap in bytes
        max: usize,
    },

    /// Medium has no room left for the write
    QuotaExceeded {
        /// Bytes the medium would hold after the write
        needed: u64,
        /// Aggregate quota in bytes
        quota: u64,
    },

    /// Medium cannot be used in this context
    Unavailable(String),
}

impl Error {
    /// True when the medium rejected a write for lack of space
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Corrupt(msg) => write!(f, "Corrupt record: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::ValueTooLarge { size, max } => {
                write!(f, "Value too large: {} bytes (max {} bytes)", size, max)
            }
            Error::QuotaExceeded { needed, quota } => {
                write!(f, "Quota exceeded: {} bytes needed (quota {} bytes)", needed, quota)
            }
            Error::Unavailable(msg) => write!(f, "Storage unavailable: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Corrupt(format!("{:?}", err))
    }
}
