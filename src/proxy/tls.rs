//! TLS termination toward clients and certificate handling toward upstreams.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::Acceptor;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error};

use crate::ca::{CaError, CertCache};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS acceptor that presents a leaf certificate minted for the client's SNI.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    cert_cache: Arc<CertCache>,
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor with the given certificate cache.
    pub fn new(cert_cache: Arc<CertCache>) -> Result<Self, rustls::Error> {
        let config = Self::create_config(Arc::clone(&cert_cache))?;
        Ok(Self { config, cert_cache })
    }

    /// Creates a rustls ServerConfig with dynamic certificate resolution.
    fn create_config(cert_cache: Arc<CertCache>) -> Result<Arc<ServerConfig>, rustls::Error> {
        let resolver = Arc::new(CertResolver { cache: cert_cache });
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        Ok(Arc::new(config))
    }

    /// Accepts a TLS connection and returns the stream with the client's SNI.
    ///
    /// The ClientHello is read first so that the leaf certificate can be minted
    /// on the blocking pool before the handshake continues. Clients that send
    /// no SNI are rejected.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, String), AcceptError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(AcceptError::Handshake)?;

        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_owned)
            .ok_or(AcceptError::NoSni)?;
        debug!("client hello received, SNI: {}", sni);

        if self.cert_cache.get(&sni).is_none() {
            let cache = Arc::clone(&self.cert_cache);
            let hostname = sni.clone();
            tokio::task::spawn_blocking(move || cache.issue(&hostname))
                .await
                .map_err(AcceptError::IssueTask)?
                .map_err(AcceptError::Certificate)?;
        }

        let tls_stream = start
            .into_stream(Arc::clone(&self.config))
            .await
            .map_err(AcceptError::Handshake)?;

        debug!("TLS handshake completed for {}", sni);

        Ok((tls_stream, sni))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("no SNI provided")]
    NoSni,
    #[error("failed to issue certificate: {0}")]
    Certificate(#[source] CaError),
    #[error("certificate task failed: {0}")]
    IssueTask(#[source] JoinError),
}

/// Certificate resolver that serves leaf certificates from the cache by SNI.
struct CertResolver {
    cache: Arc<CertCache>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let sni = client_hello.server_name()?;
        debug!("resolving certificate for SNI: {}", sni);
        match self.cache.issue(sni) {
            Ok(issued) => Some(Arc::clone(issued.certified_key())),
            Err(e) => {
                error!("failed to generate certificate for {}: {}", sni, e);
                None
            }
        }
    }
}

/// Builds the client config used toward upstream servers.
///
/// Upstream certificates are accepted without validation. Handshake
/// signatures are still checked against the presented key.
pub(crate) fn upstream_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = crypto_provider();
    let verifier = Arc::new(NoVerifier {
        algorithms: provider.signature_verification_algorithms,
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
