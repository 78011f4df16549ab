//! Connector for the local service side of a worker.
//!
//! Plain TCP by default; TLS (optionally mutual, optionally unverified) when
//! configured. The TLS connector is built once when the tunnel opens so PEM
//! problems surface as configuration errors instead of per-connect failures.

use std::fs;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Reusable dialer for the local service.
pub(crate) struct LocalConnector {
    host: String,
    port: u16,
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl LocalConnector {
    /// Build a connector from the tunnel configuration.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` when a PEM file cannot be read or parsed, or when the
    /// TLS backend rejects the combination.
    pub fn from_config(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let tls = if config.local_tls {
            Some(build_tls_connector(config)?)
        } else {
            None
        };
        Ok(Self {
            host: config.local_dial_host().to_string(),
            port: config.local_port,
            tls,
        })
    }

    /// Hostname this connector dials.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this connector dials.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open one connection to the local service.
    pub async fn connect(&self) -> io::Result<LocalStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        match &self.tls {
            None => Ok(LocalStream::Plain(tcp)),
            Some(connector) => {
                let stream = connector
                    .connect(&self.host, tcp)
                    .await
                    .map_err(io::Error::other)?;
                Ok(LocalStream::Tls(Box::new(stream)))
            }
        }
    }
}

/// Build the native-tls connector for the local service.
fn build_tls_connector(
    config: &TunnelConfig,
) -> Result<tokio_native_tls::TlsConnector, TunnelError> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.local_insecure {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(ca_path) = &config.local_ca {
        let pem = fs::read(ca_path).map_err(|e| {
            TunnelError::config(format!("cannot read localCa {}: {e}", ca_path.display()))
        })?;
        let ca = native_tls::Certificate::from_pem(&pem).map_err(|e| {
            TunnelError::config(format!("invalid localCa {}: {e}", ca_path.display()))
        })?;
        builder.add_root_certificate(ca);
    }

    match (&config.local_cert, &config.local_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).map_err(|e| {
                TunnelError::config(format!(
                    "cannot read localCert {}: {e}",
                    cert_path.display()
                ))
            })?;
            let key = fs::read(key_path).map_err(|e| {
                TunnelError::config(format!("cannot read localKey {}: {e}", key_path.display()))
            })?;
            let identity = native_tls::Identity::from_pkcs8(&cert, &key).map_err(|e| {
                TunnelError::config(format!("invalid local client certificate: {e}"))
            })?;
            builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(TunnelError::config(
                "localCert and localKey must be configured together",
            ));
        }
    }

    let connector = builder
        .build()
        .map_err(|e| TunnelError::config(format!("cannot initialize local TLS: {e}")))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

/// A connection to the local service, plain or TLS.
#[derive(Debug)]
pub(crate) enum LocalStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
