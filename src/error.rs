//! Error types for the directory core.
//!
//! Background compaction errors are latched and handed back to later
//! foreground callers, so `Error` is `Clone`; I/O errors are carried as
//! their display string rather than the non-clonable `std::io::Error`.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for directory operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Underlying file write, sync, or read failure.
    #[error("io error: {0}")]
    Io(String),

    /// CRC mismatch, bad magic, unparseable block, oversized varint,
    /// bad filter tag, or a paranoid-check violation.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Unsupported option combination or an out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted after `finish` has returned.
    #[error("already finished")]
    AlreadyFinished,

    /// On-disk data written by an unknown format version.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Constructs an `Error::Corruption` from a format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an `Error::InvalidArgument` from a format string.
#[macro_export]
macro_rules! invalid_argument {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io error: disk gone");
    }

    #[test]
    fn test_errors_are_clonable() {
        let err = corruption!("bad magic in {}", "MANIFEST");
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
