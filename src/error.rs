//! Engine error type.

use std::error;
use std::fmt;
use std::io;

/// Convenience alias for results produced by the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by streams, the merge sorter and the pipeline runtime.
#[derive(Debug)]
pub enum Error {
    /// Backing-file open, read, write or truncate failed.
    Io(io::Error),
    /// Read past the end of a stream.
    EndOfStream,
    /// Seek or truncate outside the valid range of a stream.
    OutOfRange {
        /// The requested offset.
        offset: u64,
        /// The stream length at the time of the request.
        len: u64,
    },
    /// An operation was called in a state that does not allow it.
    State(&'static str),
    /// Requested parameters do not fit in the configured memory budget.
    Capacity(String),
    /// An internal invariant did not hold.
    Invariant(String),
}

impl Error {
    /// Exit code for host tools wrapping the library: usage errors map to 1,
    /// I/O failures to 2 and violated invariants to 3.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) => 2,
            Error::EndOfStream | Error::OutOfRange { .. } | Error::State(_) | Error::Capacity(_) => 1,
            Error::Invariant(_) => 3,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O operation failed: {}", err),
            Error::EndOfStream => write!(f, "read past the end of the stream"),
            Error::OutOfRange { offset, len } => {
                write!(f, "offset {} outside the valid range [0, {}]", offset, len)
            }
            Error::State(msg) => write!(f, "operation not allowed in the current state: {}", msg),
            Error::Capacity(msg) => write!(f, "memory budget too small: {}", msg),
            Error::Invariant(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::Error;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Io(io::Error::new(io::ErrorKind::Other, "disk on fire")).exit_code(), 2);
        assert_eq!(Error::EndOfStream.exit_code(), 1);
        assert_eq!(Error::OutOfRange { offset: 7, len: 3 }.exit_code(), 1);
        assert_eq!(Error::State("push after end").exit_code(), 1);
        assert_eq!(Error::Capacity("no room".into()).exit_code(), 1);
        assert_eq!(Error::Invariant("bad heap".into()).exit_code(), 3);
    }
}
