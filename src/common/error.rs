//! Error types for the container store.

use thiserror::Error;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the container store.
///
/// None of these are retried internally: there are no transient failure
/// classes in a single-process, single-writer, synchronous design. Every
/// variant is surfaced to the immediate caller.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unrecognized container structure.
    ///
    /// Fatal to `open`; no recovery is attempted.
    #[error("format error: {0}")]
    Format(String),

    /// Seek outside the bounds of a block.
    #[error("seek to {pos} outside block of {size} bytes")]
    OutOfRange { pos: usize, size: usize },

    /// Read past the end of a block.
    #[error("short read: {requested} bytes requested, {remaining} remaining in block")]
    ShortRead { requested: usize, remaining: usize },

    /// Write or delete past the end of a block.
    ///
    /// Indicates a logic error in the calling layer, e.g. a record larger
    /// than the computed split capacity.
    #[error("write of {len} bytes past end of block of {size} bytes")]
    Overflow { len: usize, size: usize },

    /// The buddy allocator cannot satisfy a width.
    #[error("allocation exhausted: no block of width {width} available")]
    AllocationExhausted { width: u8 },

    /// A record payload carries a type code outside the recognized set.
    #[error("unknown type code {0:?}")]
    UnknownTypeCode([u8; 4]),

    /// Reserved legacy record shape, always rejected immediately.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Format("bad magic".into());
        assert_eq!(format!("{}", err), "format error: bad magic");

        let err = Error::ShortRead {
            requested: 8,
            remaining: 3,
        };
        assert_eq!(
            format!("{}", err),
            "short read: 8 bytes requested, 3 remaining in block"
        );

        let err = Error::AllocationExhausted { width: 32 };
        assert_eq!(
            format!("{}", err),
            "allocation exhausted: no block of width 32 available"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn might_fail() -> Result<u32> {
            Ok(42)
        }
        assert_eq!(might_fail().unwrap(), 42);
    }
}
