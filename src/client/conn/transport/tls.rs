//! Wrap a TCP stream with TLS

use std::sync::Arc;

use rustls::ClientConfig as TlsClientConfig;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{Instrument as _, trace};

use super::TlsConnectionError;
use crate::stream::tcp::TcpStream;

/// Performs TLS handshakes over established TCP streams.
///
/// Two client configurations are kept: the one supplied by the caller, and a copy sharing its
/// crypto provider which accepts any server certificate, used when verification is disabled.
#[derive(Clone)]
pub struct TlsTransport {
    verified: Arc<TlsClientConfig>,
    unverified: Arc<TlsClientConfig>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport").finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// Create a new `TlsTransport`
    pub fn new(config: Arc<TlsClientConfig>) -> Self {
        let provider = config.crypto_provider().clone();
        let mut unverified = TlsClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map(|builder| {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                    .with_no_client_auth()
            })
            .unwrap_or_else(|_| (*config).clone());
        unverified.alpn_protocols = config.alpn_protocols.clone();

        Self {
            verified: config,
            unverified: Arc::new(unverified),
        }
    }

    /// Returns a reference to the TLS configuration used for verified connections.
    pub fn config(&self) -> &Arc<TlsClientConfig> {
        &self.verified
    }

    /// Run the client handshake for `domain` over `stream`.
    pub async fn handshake(
        &self,
        domain: &str,
        stream: TcpStream,
        verify: bool,
    ) -> Result<TlsStream<TcpStream>, TlsConnectionError> {
        let server_name = ServerName::try_from(domain.to_owned())
            .map_err(|_| TlsConnectionError::InvalidDomain(domain.to_owned()))?;

        let config = if verify {
            self.verified.clone()
        } else {
            self.unverified.clone()
        };

        let span = tracing::trace_span!("tls", %domain, verify);
        async move {
            trace!("Transport connected. TLS handshake starting");
            let stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|error| {
                    trace!(?error, "Transport handshake error");
                    TlsConnectionError::Handshake(error)
                })?;
            trace!("TLS handshake complete");
            Ok(stream)
        }
        .instrument(span)
        .await
    }
}

/// Accepts any server certificate, while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(TlsTransport: Send, Sync, Clone);

    #[tokio::test]
    async fn rejects_invalid_server_names() {
        let transport = TlsTransport::new(Arc::new(crate::client::default_tls_config()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let stream = TcpStream::client(stream, addr);

        let error = transport
            .handshake("not a hostname", stream, true)
            .await
            .unwrap_err();
        assert!(matches!(error, TlsConnectionError::InvalidDomain(_)));
    }

    #[test]
    fn unverified_config_keeps_alpn() {
        let transport = TlsTransport::new(Arc::new(crate::client::default_tls_config()));
        assert_eq!(
            transport.unverified.alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }
}
