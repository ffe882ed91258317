use std::io;
use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a sensor session.
///
/// Every variant is an I/O failure on the underlying port; `From<Error> for
/// io::Error` folds them back into that single category.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport refused to open
    #[error("[{port}] failed to open serial port: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: io::Error,
    },

    /// The transport refused to close
    #[error("[{port}] failed to close serial port: {source}")]
    CloseFailed {
        port: String,
        #[source]
        source: io::Error,
    },

    /// A command frame could not be written in full
    #[error("[{port}] failed to write: {source}")]
    WriteFailed {
        port: String,
        #[source]
        source: io::Error,
    },

    /// The transport reported an error while reading a response
    #[error("[{port}] failed to read: {source}")]
    ReadFailed {
        port: String,
        #[source]
        source: io::Error,
    },

    /// The response did not arrive within the read timeout
    #[error("[{port}] read timed out after {timeout:?} ({received} of {expected} bytes)")]
    ReadTimeout {
        port: String,
        timeout: Duration,
        received: usize,
        expected: usize,
    },
}

impl Error {
    /// Port identifier of the session that produced the error
    pub fn port(&self) -> &str {
        match self {
            Error::OpenFailed { port, .. }
            | Error::CloseFailed { port, .. }
            | Error::WriteFailed { port, .. }
            | Error::ReadFailed { port, .. }
            | Error::ReadTimeout { port, .. } => port,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ReadTimeout { .. })
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::ReadTimeout { .. } => io::ErrorKind::TimedOut,
            Error::OpenFailed { source, .. }
            | Error::CloseFailed { source, .. }
            | Error::WriteFailed { source, .. }
            | Error::ReadFailed { source, .. } => source.kind(),
        };
        io::Error::new(kind, e)
    }
}
