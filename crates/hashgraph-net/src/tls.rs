//! Mutually authenticated TLS for peer links
//!
//! Every roster member owns a certificate that the roster file pins. A
//! dialer only accepts the exact certificate pinned for the peer it dials,
//! and a listener only accepts client certificates pinned for some roster
//! member. A finished handshake therefore authenticates the remote
//! [`NodeId`] independently of what the peer later claims in its hello.

use hashgraph_core::types::NodeId;
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS setup errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("No certificate found in PEM input")]
    MissingCertificate,
    #[error("No private key found in PEM input")]
    MissingKey,
}

/// Certificate and private key this node presents to its peers
#[derive(Debug)]
pub struct TlsIdentity {
    certificate: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certificate: self.certificate.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    /// Parse the first certificate and private key of PEM documents
    pub fn from_pem(certificate_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certificate = rustls_pemfile::certs(&mut &certificate_pem[..])
            .next()
            .ok_or(TlsError::MissingCertificate)??;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or(TlsError::MissingKey)?;
        Ok(Self { certificate, key })
    }

    /// Read a PEM certificate file and a PEM key file
    pub fn load(certificate_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certificate = std::fs::read(certificate_path)?;
        let key = std::fs::read(key_path)?;
        Self::from_pem(&certificate, &key)
    }

    /// DER bytes of the certificate, as pinned in the roster
    pub fn certificate(&self) -> &[u8] {
        self.certificate.as_ref()
    }
}

/// Pinned certificate per roster member
type Pins = Arc<RwLock<HashMap<Vec<u8>, NodeId>>>;

/// Builds dialers and the acceptor for one node
pub struct TlsContext {
    identity: TlsIdentity,
    provider: Arc<CryptoProvider>,
    pins: Pins,
    acceptor: TlsAcceptor,
}

impl TlsContext {
    pub fn new(identity: TlsIdentity) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let pins: Pins = Arc::default();
        let verifier = RosterClientVerifier {
            pins: Arc::clone(&pins),
            algorithms: provider.signature_verification_algorithms,
        };
        let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(vec![identity.certificate.clone()], identity.key.clone_key())?;
        Ok(Self {
            identity,
            provider,
            pins,
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    pub fn identity(&self) -> &TlsIdentity {
        &self.identity
    }

    /// Accept `certificate` as the identity of `node`
    pub fn pin(&self, node: NodeId, certificate: Vec<u8>) {
        let mut pins = self.pins.write();
        pins.retain(|_, pinned| *pinned != node);
        pins.insert(certificate, node);
    }

    /// Roster member owning `certificate`
    pub fn node_of(&self, certificate: &[u8]) -> Option<NodeId> {
        self.pins.read().get(certificate).copied()
    }

    /// Dialer that only completes against `certificate`
    pub fn connector(&self, certificate: &[u8]) -> Result<TlsConnector, TlsError> {
        let verifier = PinnedServerVerifier {
            certificate: certificate.to_vec(),
            algorithms: self.provider.signature_verification_algorithms,
        };
        let client = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                vec![self.identity.certificate.clone()],
                self.identity.key.clone_key(),
            )?;
        Ok(TlsConnector::from(Arc::new(client)))
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

// =============================================================================
// VERIFIERS
// =============================================================================

/// Server side: the peer we dial must present its pinned certificate
#[derive(Debug)]
struct PinnedServerVerifier {
    certificate: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.certificate.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client side: any roster member may dial, nobody else
#[derive(Debug)]
struct RosterClientVerifier {
    pins: Pins,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for RosterClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.pins.read().contains_key(end_entity.as_ref()) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Fixed self-signed identities for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::TlsIdentity;

    const CERTIFICATES: [&str; 4] = [
        include_str!("../testdata/node0.crt.pem"),
        include_str!("../testdata/node1.crt.pem"),
        include_str!("../testdata/node2.crt.pem"),
        include_str!("../testdata/node3.crt.pem"),
    ];
    const KEYS: [&str; 4] = [
        include_str!("../testdata/node0.key.pem"),
        include_str!("../testdata/node1.key.pem"),
        include_str!("../testdata/node2.key.pem"),
        include_str!("../testdata/node3.key.pem"),
    ];

    /// Number of distinct identities available
    pub const IDENTITIES: usize = CERTIFICATES.len();

    /// Identity `index`, wrapping around past [`IDENTITIES`]
    pub fn identity(index: usize) -> TlsIdentity {
        let i = index % IDENTITIES;
        TlsIdentity::from_pem(CERTIFICATES[i].as_bytes(), KEYS[i].as_bytes())
            .expect("test identity")
    }
}
