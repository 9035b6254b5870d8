//! TLS upgrades
//!
//! Both sides of a connection present their self-signed device certificate
//! (mutual TLS). Which certificate check applies depends on the peer's
//! trust state:
//!
//! - **Trusted peer**: the presented certificate must be byte-identical to
//!   the one on file for that device id (pinning).
//! - **Unknown peer**: any certificate is accepted for first-contact
//!   pairing; the application layer stores it once the handshake completes.
//!
//! Role assignment follows the TCP connection: the side that accepted the
//! TCP connection runs the TLS server, the side that dialed runs the TLS
//! client. The side that receives a UDP broadcast dials back and therefore
//! becomes the TLS client.

use crate::crypto::CertificateInfo;
use crate::error::{LinkError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ServerConfig};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

fn supported_schemes() -> Vec<rustls::SignatureScheme> {
    vec![
        rustls::SignatureScheme::RSA_PKCS1_SHA256,
        rustls::SignatureScheme::RSA_PKCS1_SHA384,
        rustls::SignatureScheme::RSA_PKCS1_SHA512,
        rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
        rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
        rustls::SignatureScheme::RSA_PSS_SHA256,
        rustls::SignatureScheme::RSA_PSS_SHA384,
        rustls::SignatureScheme::RSA_PSS_SHA512,
    ]
}

fn pin_mismatch() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

/// Server-certificate verifier for first contact: accepts any certificate.
/// Fingerprint verification happens at the application layer.
#[derive(Debug)]
struct TofuServerVerifier;

/// Server-certificate verifier for trusted peers: the presented leaf must
/// match the stored certificate exactly.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: CertificateDer<'static>,
}

impl rustls::client::danger::ServerCertVerifier for TofuServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            warn!("peer presented a certificate that does not match the stored one");
            Err(pin_mismatch())
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

/// Client-certificate verifier for first contact (mutual TLS still
/// required; any certificate accepted)
#[derive(Debug)]
struct TofuClientVerifier;

/// Client-certificate verifier for trusted peers (pinned)
#[derive(Debug)]
struct PinnedClientVerifier {
    pinned: CertificateDer<'static>,
}

impl rustls::server::danger::ClientCertVerifier for TofuClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl rustls::server::danger::ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(rustls::server::danger::ClientCertVerified::assertion())
        } else {
            warn!("peer presented a certificate that does not match the stored one");
            Err(pin_mismatch())
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

fn local_keys(
    local: &CertificateInfo,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_der = CertificateDer::from(local.certificate.clone());
    let key_der = PrivateKeyDer::try_from(local.private_key.clone())
        .map_err(|e| LinkError::certificate(format!("invalid private key: {:?}", e)))?;
    Ok((vec![cert_der], key_der))
}

/// Build a client config presenting the local certificate.
///
/// With `pinned` set the server certificate must match it; otherwise any
/// certificate is accepted (first contact).
pub fn client_config(local: &CertificateInfo, pinned: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let (certs, key) = local_keys(local)?;
    let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> = match pinned {
        Some(der) => Arc::new(PinnedServerVerifier {
            pinned: CertificateDer::from(der.to_vec()),
        }),
        None => Arc::new(TofuServerVerifier),
    };
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| LinkError::certificate(format!("failed to build client config: {}", e)))?;
    Ok(Arc::new(config))
}

/// Build a server config presenting the local certificate and requiring a
/// client certificate (pinned when the peer is trusted).
pub fn server_config(local: &CertificateInfo, pinned: Option<&[u8]>) -> Result<Arc<ServerConfig>> {
    let (certs, key) = local_keys(local)?;
    let verifier: Arc<dyn rustls::server::danger::ClientCertVerifier> = match pinned {
        Some(der) => Arc::new(PinnedClientVerifier {
            pinned: CertificateDer::from(der.to_vec()),
        }),
        None => Arc::new(TofuClientVerifier),
    };
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| LinkError::certificate(format!("failed to build server config: {}", e)))?;
    Ok(Arc::new(config))
}

/// Upgrade a dialed TCP stream to TLS as the client
pub async fn upgrade_client(
    stream: TcpStream,
    peer_ip: IpAddr,
    config: Arc<ClientConfig>,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(config);
    // Peers have no DNS names; the IP string stands in for SNI
    let server_name = ServerName::try_from(peer_ip.to_string())
        .map_err(|e| LinkError::tls(format!("invalid server name: {}", e)))?;

    let tls = timeout(handshake_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| LinkError::Timeout)?
        .map_err(|e| LinkError::tls(format!("client handshake failed: {}", e)))?;

    debug!(peer = %peer_ip, "TLS client handshake complete");
    Ok(TlsStream::Client(tls))
}

/// Upgrade an accepted TCP stream to TLS as the server
pub async fn upgrade_server(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let acceptor = TlsAcceptor::from(config);

    let tls = timeout(handshake_timeout, acceptor.accept(stream))
        .await
        .map_err(|_| LinkError::Timeout)?
        .map_err(|e| LinkError::tls(format!("server handshake failed: {}", e)))?;

    debug!("TLS server handshake complete");
    Ok(TlsStream::Server(tls))
}

/// Extract the peer's leaf certificate from an established TLS session
pub fn peer_certificate(stream: &TlsStream<TcpStream>) -> Option<Vec<u8>> {
    let (_, session) = stream.get_ref();
    session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
}
