// TLS 1.3 transport with certificate-digest pinning

use crate::crypto::KeyHash;
use crate::smp::address::SmpServer;
use crate::transport::tcp::{StreamRead, StreamWrite};
use crate::transport::{Transport, TransportError, HANDSHAKE_TIMEOUT};
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server-side TLS identity: the rustls acceptor plus the certificate
/// digest clients pin through the address `#key_hash` fragment.
#[derive(Clone)]
pub struct TlsIdentity {
    pub acceptor: TlsAcceptor,
    pub key_hash: KeyHash,
}

impl TlsIdentity {
    pub fn from_files(cert_file: &Path, key_file: &Path) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(
            &mut std::io::BufReader::new(
                std::fs::File::open(cert_file)
                    .with_context(|| format!("opening {}", cert_file.display()))?,
            ),
        )
        .collect::<Result<_, _>>()
        .context("reading certificate file")?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
            std::fs::File::open(key_file)
                .with_context(|| format!("opening {}", key_file.display()))?,
        ))
        .context("reading private key file")?
        .context("no private key in key file")?;
        Self::from_der(certs, key)
    }

    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let end_entity = certs.first().context("empty certificate chain")?;
        let key_hash = KeyHash::of_certificate(end_entity.as_ref());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building server TLS config")?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            key_hash,
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<Transport, TransportError> {
        let tls = timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::Tls("handshake timeout".to_string()))?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let (r, w) = tokio::io::split(tls);
        Ok(Transport::new(
            Box::new(StreamRead::new(r)),
            Box::new(StreamWrite::new(w)),
        ))
    }
}

/// Connects to `server`, verifying the presented certificate against the
/// address key hash. An address without a hash accepts any certificate
/// (test mode only).
pub async fn connect(server: &SmpServer) -> Result<Transport, TransportError> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
            expected: server.key_hash,
        }))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect((server.host.as_str(), server.port_or_default())).await?;
    let name = ServerName::try_from(server.host.clone())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let tls = connector
        .connect(name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let (r, w) = tokio::io::split(tls);
    Ok(Transport::new(
        Box::new(StreamRead::new(r)),
        Box::new(StreamWrite::new(w)),
    ))
}

/// Accepts exactly the certificate whose digest matches the pinned hash;
/// with no pin, accepts anything. Chain and hostname checks are replaced
/// by the pin, which is the authentication in this protocol.
#[derive(Debug)]
struct PinnedVerifier {
    expected: Option<KeyHash>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.expected {
            let presented = KeyHash::of_certificate(end_entity.as_ref());
            if presented != *expected {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
