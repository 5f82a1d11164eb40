//! Error types for the session engine.

use thiserror::Error;

/// Classified transport failures.
///
/// These are the kinds a job can receive through its `socket_error` callback
/// when the connection carrying it breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The host name did not resolve.
    HostNotFound,
    /// The server refused the TCP connection.
    ConnectionRefused,
    /// The server closed the connection.
    RemoteHostClosed,
    /// An operation timed out (connect or inactivity watchdog).
    Timeout,
    /// The TLS handshake failed.
    TlsHandshake,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Classifies an I/O error.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match error.kind() {
            Io::NotFound => Self::HostNotFound,
            Io::ConnectionRefused => Self::ConnectionRefused,
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
                Self::RemoteHostClosed
            }
            Io::TimedOut => Self::Timeout,
            _ => Self::Other,
        }
    }
}

impl From<&Error> for ErrorKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::Io(e) => Self::from_io(e),
            Error::Tls(_) | Error::TlsConfig(_) => Self::TlsHandshake,
            Error::InvalidDnsName(_) => Self::HostNotFound,
            Error::ConnectTimeout => Self::Timeout,
            Error::Parse { .. } | Error::InvalidState(_) => Self::Other,
        }
    }
}

/// Errors produced by the session engine.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// TLS configuration could not be built.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Connecting to the server timed out.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The response stream is structurally inconsistent.
    ///
    /// This is fatal to the connection: the transport is aborted.
    #[error("protocol error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// Invalid state for the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(ErrorKind::from_io(&refused), ErrorKind::ConnectionRefused);

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(ErrorKind::from_io(&reset), ErrorKind::RemoteHostClosed);

        let timeout = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(ErrorKind::from_io(&timeout), ErrorKind::Timeout);

        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_io(&other), ErrorKind::Other);
    }

    #[test]
    fn test_error_classification() {
        let parse = Error::Parse {
            position: 3,
            message: "bad".to_string(),
        };
        assert_eq!(ErrorKind::from(&parse), ErrorKind::Other);
        assert_eq!(ErrorKind::from(&Error::ConnectTimeout), ErrorKind::Timeout);
    }
}
