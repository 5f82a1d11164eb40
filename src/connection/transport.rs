//! Transport abstraction.
//!
//! The session engine drives an abstract transport: something that can open
//! a connection, open it encrypted from the first byte, or upgrade an
//! established plaintext connection in place (STARTTLS). Production sessions
//! use [`TcpTransport`]; tests substitute transports backed by in-memory
//! duplex pipes.

use std::future::Future;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::Config;
use super::stream::SessionStream;
use super::tls::{self, TlsSummary, TlsVersion};
use crate::error::{Error, Result};

/// A bidirectional byte stream factory with TLS-upgrade capability.
pub trait Transport: Send + 'static {
    /// The stream type this transport produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a plaintext connection.
    fn connect(&mut self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Opens a connection that is TLS from the first byte.
    fn connect_tls(
        &mut self,
        version: TlsVersion,
    ) -> impl Future<Output = Result<(Self::Stream, TlsSummary)>> + Send;

    /// Upgrades an established plaintext connection in place.
    fn start_tls(
        &mut self,
        stream: Self::Stream,
        version: TlsVersion,
    ) -> impl Future<Output = Result<(Self::Stream, TlsSummary)>> + Send;
}

/// TCP transport for real connections.
#[derive(Debug)]
pub struct TcpTransport {
    config: Config,
}

impl TcpTransport {
    /// Creates a transport for the configured host and port.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn tcp_connect(&self) -> Result<TcpStream> {
        let address = (self.config.host.clone(), self.config.port);
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(Error::Io(error)),
            Err(_) => Err(Error::ConnectTimeout),
        }
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        version: TlsVersion,
    ) -> Result<(SessionStream, TlsSummary)> {
        let (connector, captured) = tls::connector(version)?;
        let server_name = ServerName::try_from(self.config.host.clone())?;
        let tls_stream = connector.connect(server_name, tcp).await?;

        let stream = SessionStream::Tls(Box::new(tls_stream));
        let mut summary = stream.tls_summary().unwrap_or_default();
        summary.issues = captured.take();
        Ok((stream, summary))
    }
}

impl Transport for TcpTransport {
    type Stream = SessionStream;

    fn connect(&mut self) -> impl Future<Output = Result<SessionStream>> + Send {
        async move {
            let tcp = self.tcp_connect().await?;
            Ok(SessionStream::Plain(tcp))
        }
    }

    fn connect_tls(
        &mut self,
        version: TlsVersion,
    ) -> impl Future<Output = Result<(SessionStream, TlsSummary)>> + Send {
        async move {
            let tcp = self.tcp_connect().await?;
            self.handshake(tcp, version).await
        }
    }

    fn start_tls(
        &mut self,
        stream: SessionStream,
        version: TlsVersion,
    ) -> impl Future<Output = Result<(SessionStream, TlsSummary)>> + Send {
        async move {
            match stream {
                SessionStream::Plain(tcp) => self.handshake(tcp, version).await,
                SessionStream::Tls(_) => Err(Error::InvalidState(
                    "stream is already encrypted".to_string(),
                )),
            }
        }
    }
}
