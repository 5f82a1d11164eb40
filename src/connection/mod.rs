//! Connection handling for IMAP sessions.
//!
//! This module provides:
//! - Configuration (host, port, security mode, TLS version constraint)
//! - The plaintext/TLS stream carrying a session
//! - TLS connector construction with certificate-error capture
//! - The [`Transport`] abstraction the session engine drives

mod config;
mod stream;
pub(crate) mod tls;
mod transport;

pub use config::{Config, ConfigBuilder, Security};
pub use stream::SessionStream;
pub use tls::{CertificateIssue, TlsSummary, TlsVersion};
pub use transport::{TcpTransport, Transport};
