//! TLS configuration and certificate-error capture.
//!
//! Certificate problems are not fatal during the handshake: the verifier
//! records them and lets the handshake complete, so the session can surface
//! the error set to a higher-level handler and act on its accept/reject
//! decision. Handshake-level failures (no shared protocol version, bad
//! signatures) still abort and feed the version-fallback logic.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// TLS protocol version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// Let the library pick; arms version fallback when negotiation is
    /// driven through the session.
    #[default]
    Any,
    /// TLS 1.3 only.
    Tls13,
    /// TLS 1.2 only.
    Tls12,
}

impl TlsVersion {
    /// Maps a negotiated protocol version back to a constraint value.
    #[must_use]
    pub fn from_protocol(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::TLSv1_3 => Some(Self::Tls13),
            rustls::ProtocolVersion::TLSv1_2 => Some(Self::Tls12),
            _ => None,
        }
    }
}

/// A certificate problem observed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateIssue {
    /// The certificate has expired.
    Expired,
    /// The certificate is not yet valid.
    NotValidYet,
    /// The certificate chain does not lead to a trusted root.
    UnknownIssuer,
    /// The certificate is not valid for the contacted host name.
    HostnameMismatch,
    /// The certificate has been revoked.
    Revoked,
    /// Any other certificate or verification problem.
    Other(String),
}

impl From<&rustls::Error> for CertificateIssue {
    fn from(error: &rustls::Error) -> Self {
        match error {
            rustls::Error::InvalidCertificate(cert_error) => match cert_error {
                CertificateError::Expired => Self::Expired,
                CertificateError::NotValidYet => Self::NotValidYet,
                CertificateError::UnknownIssuer => Self::UnknownIssuer,
                CertificateError::NotValidForName => Self::HostnameMismatch,
                CertificateError::Revoked => Self::Revoked,
                other => Self::Other(format!("{other:?}")),
            },
            other => Self::Other(other.to_string()),
        }
    }
}

/// Negotiated TLS parameters plus any captured certificate issues.
#[derive(Debug, Clone, Default)]
pub struct TlsSummary {
    /// The negotiated protocol version.
    pub version: Option<TlsVersion>,
    /// The negotiated cipher suite, if any.
    pub cipher: Option<String>,
    /// Certificate issues recorded during the handshake.
    pub issues: Vec<CertificateIssue>,
}

/// Shared sink for certificate issues recorded by the verifier.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapturedIssues(Arc<Mutex<Vec<CertificateIssue>>>);

impl CapturedIssues {
    /// Drains and returns everything recorded so far.
    pub fn take(&self) -> Vec<CertificateIssue> {
        match self.0.lock() {
            Ok(mut issues) => std::mem::take(&mut *issues),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn push(&self, issue: CertificateIssue) {
        match self.0.lock() {
            Ok(mut issues) => issues.push(issue),
            Err(poisoned) => poisoned.into_inner().push(issue),
        }
    }
}

/// Certificate verifier that records failures instead of aborting.
#[derive(Debug)]
struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    captured: CapturedIssues,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(error) => {
                self.captured.push(CertificateIssue::from(&error));
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Builds a connector constrained to `version`, plus the issue sink its
/// verifier records into.
pub(crate) fn connector(version: TlsVersion) -> Result<(TlsConnector, CapturedIssues)> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let inner = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::TlsConfig(e.to_string()))?;

    let captured = CapturedIssues::default();
    let verifier = CapturingVerifier {
        inner,
        captured: captured.clone(),
    };

    let builder = match version {
        TlsVersion::Any => ClientConfig::builder(),
        TlsVersion::Tls13 => {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        }
        TlsVersion::Tls12 => {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        }
    };
    let config = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok((TlsConnector::from(Arc::new(config)), captured))
}

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
    fn test_connector_builds_for_every_version() {
        assert!(connector(TlsVersion::Any).is_ok());
        assert!(connector(TlsVersion::Tls13).is_ok());
        assert!(connector(TlsVersion::Tls12).is_ok());
    }

    #[test]
    fn test_issue_mapping() {
        let expired = rustls::Error::InvalidCertificate(CertificateError::Expired);
        assert_eq!(CertificateIssue::from(&expired), CertificateIssue::Expired);

        let name = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        assert_eq!(
            CertificateIssue::from(&name),
            CertificateIssue::HostnameMismatch
        );

        let other = rustls::Error::HandshakeNotComplete;
        assert!(matches!(
            CertificateIssue::from(&other),
            CertificateIssue::Other(_)
        ));
    }

    #[test]
    fn test_captured_issues_take_drains() {
        let captured = CapturedIssues::default();
        captured.push(CertificateIssue::Expired);
        captured.push(CertificateIssue::UnknownIssuer);

        let taken = captured.take();
        assert_eq!(taken.len(), 2);
        assert!(captured.take().is_empty());
    }

    #[test]
    fn test_version_from_protocol() {
        assert_eq!(
            TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_3),
            Some(TlsVersion::Tls13)
        );
        assert_eq!(
            TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_2),
            Some(TlsVersion::Tls12)
        );
        assert_eq!(
            TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_0),
            None
        );
    }
}
