//! TLS client configuration.
//!
//! The server certificate chain is checked against the pinned CA only; the
//! platform or webpki root stores are never consulted.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::TlsSecurity;
use crate::error::{Error, Result};

/// ALPN protocol id of the binary protocol.
pub const ALPN_PROTOCOL: &[u8] = b"edgedb-binary";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
pub fn parse_pem_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse CA certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config("No certificate found in tls_ca".into()));
    }
    Ok(certs)
}

fn root_store(ca_pem: &str) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in parse_pem_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(Arc::new(roots))
}

/// Build the client configuration for a security mode.
///
/// `Strict` and `NoHostVerification` need a pinned CA; `Insecure` ignores it.
pub fn client_config(ca_pem: Option<&str>, security: TlsSecurity) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS protocol version error: {}", e)))?;

    let mut config = match security {
        TlsSecurity::Strict => {
            let ca = ca_pem.ok_or_else(|| {
                Error::Config("TLS security 'strict' requires a pinned CA certificate".into())
            })?;
            builder
                .with_root_certificates(root_store(ca)?)
                .with_no_client_auth()
        }
        TlsSecurity::NoHostVerification => {
            let ca = ca_pem.ok_or_else(|| {
                Error::Config(
                    "TLS security 'no_host_verification' requires a pinned CA certificate".into(),
                )
            })?;
            let inner = WebPkiServerVerifier::builder_with_provider(root_store(ca)?, provider())
                .build()
                .map_err(|e| Error::Config(format!("Failed to build verifier: {}", e)))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostname { inner }))
                .with_no_client_auth()
        }
        TlsSecurity::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    };

    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(Arc::new(config))
}

/// Run the TLS handshake over an established stream.
pub async fn connect<S>(stream: S, host: &str, config: Arc<ClientConfig>) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Config(format!("Invalid server name {:?}: {}", host, e)))?;

    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Connection(format!("TLS handshake with {} failed: {}", host, e)))?;

    let (_, session) = stream.get_ref();
    match session.alpn_protocol() {
        Some(proto) if proto == ALPN_PROTOCOL => {}
        other => debug!(
            host,
            alpn = ?other.map(String::from_utf8_lossy),
            "Server did not select the binary protocol ALPN id"
        ),
    }

    Ok(stream)
}

// ============================================================================
// Verifiers
// ============================================================================

/// Checks the chain against the pinned roots but accepts any host name.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
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

/// Accepts any certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
