//! STARTTLS support: rustls configuration and in-place stream upgrades.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

use super::BoxedIo;
use crate::error::EngineError;

/// Install the ring crypto provider as the process default (idempotent).
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Verifier behind `accept_invalid_certs`.
///
/// The certificate chain still goes through normal validation against the
/// native roots when they are available. A chain that fails it is accepted
/// with a warning naming the server and the reason. Handshake signatures are
/// always checked, so the peer must hold the key of the certificate it
/// presents.
#[derive(Debug)]
struct PermissiveVerifier {
    validator: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl PermissiveVerifier {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        let validator = native_roots().ok().and_then(|roots| {
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .ok()
        });
        Self {
            validator,
            provider,
        }
    }
}

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(validator) = &self.validator else {
            warn!(server_name = ?server_name, "No trust roots, accepting certificate unverified");
            return Ok(ServerCertVerified::assertion());
        };
        match validator.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(reason)) => {
                warn!(server_name = ?server_name, reason = ?reason, "Accepting invalid certificate");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn native_roots() -> Result<RootCertStore, EngineError> {
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(EngineError::Tls(
            "No system root certificates found. Ensure CA certificates are installed \
             (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    let mut roots = RootCertStore::empty();
    for cert in native_certs.certs {
        roots
            .add(cert)
            .map_err(|e| EngineError::Tls(format!("Failed to add cert: {}", e)))?;
    }
    Ok(roots)
}

/// Client TLS configuration backed by the system's native root certificates.
pub fn client_tls_config(accept_invalid_certs: bool) -> Result<Arc<ClientConfig>, EngineError> {
    init_crypto_provider();

    if accept_invalid_certs {
        warn!("TLS certificate verification relaxed (accept_invalid_certs)");
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveVerifier::new(provider)))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(native_roots()?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// How a connection upgrades itself when STARTTLS is negotiated.
#[derive(Clone)]
pub(crate) enum TlsUpgrade {
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Server {
        acceptor: TlsAcceptor,
    },
    Unavailable,
}

impl TlsUpgrade {
    pub(crate) fn client(config: Arc<ClientConfig>, domain: &str) -> Result<Self, EngineError> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| EngineError::Tls(format!("Invalid server name {}: {}", domain, e)))?;
        Ok(Self::Client {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> Self {
        Self::Server {
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    /// Run the TLS handshake over `io` and return the encrypted stream.
    pub(crate) async fn upgrade(&self, io: BoxedIo) -> Result<BoxedIo, EngineError> {
        match self {
            Self::Client {
                connector,
                server_name,
            } => {
                let stream = connector
                    .connect(server_name.clone(), io)
                    .await
                    .map_err(|e| {
                        error!(server_name = ?server_name, error = %e, "TLS handshake failed");
                        EngineError::Tls(e.to_string())
                    })?;
                info!(server_name = ?server_name, "TLS established");
                Ok(Box::new(stream))
            }
            Self::Server { acceptor } => {
                let stream = acceptor.accept(io).await.map_err(|e| {
                    error!(error = %e, "TLS accept failed");
                    EngineError::Tls(e.to_string())
                })?;
                info!("TLS established");
                Ok(Box::new(stream))
            }
            Self::Unavailable => Err(EngineError::Tls("TLS is not configured".to_string())),
        }
    }
}
