//! Error types.

use std::fmt;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All recoverable errors the storage core can report.
///
/// Invariant violations (frame id out of range, pin-count underflow,
/// `set_evictable` on an untracked frame) are bugs, not states a caller can
/// react to, and panic instead of appearing here.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying database file.
    Io(std::io::Error),

    /// Requested page was never allocated on disk.
    PageNotFound(u32),

    /// Every frame is pinned and the free list is empty.
    NoFreeFrames,

    /// The provided page id is out of range for the file.
    InvalidPageId(u32),

    /// The page cannot be deleted while guards still pin it.
    PagePinned(u32),

    /// The on-disk index structure contradicts itself.
    TreeCorrupted(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::PageNotFound(pid) => write!(f, "page {} not found", pid),
            Error::NoFreeFrames => write!(f, "no free frames available in buffer pool"),
            Error::InvalidPageId(pid) => write!(f, "invalid page id: {}", pid),
            Error::PagePinned(pid) => write!(f, "page {} is still pinned", pid),
            Error::TreeCorrupted(msg) => write!(f, "b+ tree corrupted: {}", msg),
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

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PageNotFound(42);
        assert_eq!(format!("{}", err), "page 42 not found");

        let err = Error::PagePinned(7);
        assert_eq!(format!("{}", err), "page 7 is still pinned");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
