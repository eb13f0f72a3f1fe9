//! Error types for the space clearing engine.
//!
//! Only fatal conditions are represented as [`ClearError`]. Errnos that signal a
//! concurrently mutated owner or a temporary shortage of space are classified with
//! [`Errno`] and handled where they occur.

use std::io;

use thiserror::Error;

/// Result type alias for clearing operations.
pub type ClearResult<T> = Result<T, ClearError>;

/// Error variants for clearing operations.
#[derive(Debug, Error)]
pub enum ClearError {
    /// An unexpected errno from a filesystem primitive.
    #[error("{op} failed: {source}")]
    Io {
        /// Name of the primitive that failed.
        op: &'static str,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The requested physical range cannot be cleared.
    #[error("Invalid range {start}+{length}: {reason}")]
    InvalidRange {
        /// Start of the requested range in bytes.
        start: u64,
        /// Length of the requested range in bytes.
        length: u64,
        /// Why the range was rejected.
        reason: String,
    },

    /// Realtime clearing was requested but the filesystem has no realtime device.
    #[error("Filesystem has no realtime device")]
    NoRealtimeDevice,

    /// The backend cannot provide a primitive the engine needs.
    #[error("Operation not supported: {op}")]
    Unsupported {
        /// Name of the missing primitive.
        op: &'static str,
    },

    /// The configuration file could not be parsed.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },
}

impl ClearError {
    /// Wraps an I/O error with the name of the primitive that produced it.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        ClearError::Io { op, source }
    }
}

/// Classification of errnos returned by filesystem primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// `EINVAL`: the source range was punched or truncated underneath us.
    Invalid,
    /// `EBUSY`: the freshness guard of an exchange tripped.
    Busy,
    /// `ENOSPC`: out of space for a clone, dedupe or unshare.
    NoSpace,
    /// `EOPNOTSUPP`/`ENOTTY`/`ENOSYS`: the primitive is missing.
    NotSupported,
    /// `ENOENT`/`ESTALE`: the object no longer exists.
    Gone,
    /// Anything else.
    Other,
}

impl Errno {
    /// Classifies an I/O error by its raw OS error code.
    pub fn of(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => Errno::Invalid,
            Some(libc::EBUSY) => Errno::Busy,
            Some(libc::ENOSPC) => Errno::NoSpace,
            Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) | Some(libc::ENOSYS) => {
                Errno::NotSupported
            }
            Some(libc::ENOENT) | Some(libc::ESTALE) => Errno::Gone,
            _ => Errno::Other,
        }
    }

    /// Returns whether the error indicates a racing writer rather than a real failure.
    pub fn is_transient(self) -> bool {
        matches!(self, Errno::Invalid | Errno::Busy | Errno::Gone)
    }
}

/// Shorthand for building an `io::Error` from an errno value.
pub fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errnos() {
        assert_eq!(Errno::of(&errno(libc::EINVAL)), Errno::Invalid);
        assert_eq!(Errno::of(&errno(libc::EBUSY)), Errno::Busy);
        assert_eq!(Errno::of(&errno(libc::ENOSPC)), Errno::NoSpace);
        assert_eq!(Errno::of(&errno(libc::EOPNOTSUPP)), Errno::NotSupported);
        assert_eq!(Errno::of(&errno(libc::ENOTTY)), Errno::NotSupported);
        assert_eq!(Errno::of(&errno(libc::ESTALE)), Errno::Gone);
        assert_eq!(Errno::of(&errno(libc::EIO)), Errno::Other);
    }

    #[test]
    fn test_errno_without_os_code() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(Errno::of(&err), Errno::Other);
    }

    #[test]
    fn test_transient_classes() {
        assert!(Errno::Invalid.is_transient());
        assert!(Errno::Busy.is_transient());
        assert!(!Errno::NoSpace.is_transient());
        assert!(!Errno::Other.is_transient());
    }

    #[test]
    fn test_io_error_display() {
        let err = ClearError::io("clone_range", errno(libc::EIO));
        let msg = format!("{}", err);
        assert!(msg.starts_with("clone_range failed"));
    }

    #[test]
    fn test_invalid_range_display() {
        let err = ClearError::InvalidRange {
            start: 4096,
            length: 0,
            reason: "empty range".to_string(),
        };
        assert_eq!(format!("{}", err), "Invalid range 4096+0: empty range");
    }
}
