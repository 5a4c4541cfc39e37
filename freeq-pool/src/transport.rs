//! Byte transports a [`Connection`](crate::connection::Connection) runs over.
//!
//! The client asks its [`Connector`] for a fresh stream every time it opens a
//! connection. [`TcpConnector`] dials the configured server (plain or TLS);
//! [`MemoryConnector`] hands the far end of an in-memory duplex pipe to an
//! in-process peer, which is how the integration tests script a server.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::ClientConfig;

/// Buffer size of each in-memory pipe direction.
const DUPLEX_BUFFER: usize = 16384;

/// A stream that has completed transport setup but not IRC login.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Duplex(DuplexStream),
}

/// Opens transport streams on demand.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, io::Result<EstablishedConnection>>;
}

/// Dials `server_addr` over TCP, upgrading to TLS when configured (or when
/// the port is 6697). The TLS client config is built once and shared by every
/// connection.
#[derive(Clone)]
pub struct TcpConnector {
    server_addr: String,
    tls: Option<TlsConnector>,
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("server_addr", &self.server_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl TcpConnector {
    pub fn new(server_addr: impl Into<String>, tls: bool, tls_insecure: bool) -> Self {
        let server_addr = server_addr.into();
        let tls = (tls || server_addr.ends_with(":6697"))
            .then(|| TlsConnector::from(Arc::new(tls_client_config(tls_insecure))));
        Self { server_addr, tls }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_addr.clone(), config.tls, config.tls_insecure)
    }

    async fn establish(self) -> io::Result<EstablishedConnection> {
        let addr = self.server_addr.as_str();
        tracing::debug!("Resolving {addr}...");
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("TCP connect to {addr} failed: {e}")))?;
        tcp.set_nodelay(true)?;

        let Some(tls) = self.tls.as_ref() else {
            tracing::debug!("TCP connected to {addr} (plain)");
            return Ok(EstablishedConnection::Plain(tcp));
        };
        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("TLS handshake with {addr} failed: {e}")))?;
        tracing::debug!("TLS session established with {addr}");
        Ok(EstablishedConnection::Tls(Box::new(stream)))
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<EstablishedConnection>> {
        Box::pin(self.clone().establish())
    }
}

/// Client config trusting the webpki roots, or any certificate at all when
/// `insecure`.
fn tls_client_config(insecure: bool) -> rustls::ClientConfig {
    // Fails harmlessly when a provider is already installed.
    #[cfg(feature = "ring")]
    let _ = rustls::crypto::ring::default_provider().install_default();
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let builder = rustls::ClientConfig::builder();
    if insecure {
        tracing::debug!("TLS certificate verification disabled");
        let schemes = rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default();
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { schemes }))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    }
}

/// Verifier for `tls_insecure`: every certificate and signature passes.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// In-process transport. Every `connect` creates a duplex pipe and sends the
/// peer end to the receiver returned by [`MemoryConnector::new`].
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<EstablishedConnection>> {
        let peers = self.peers.clone();
        Box::pin(async move {
            let (client_side, server_side) = tokio::io::duplex(DUPLEX_BUFFER);
            peers.send(server_side).map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "in-memory peer is gone")
            })?;
            Ok(EstablishedConnection::Duplex(client_side))
        })
    }
}
