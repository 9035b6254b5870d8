//! Device certificates
//!
//! Each device owns one self-signed RSA 2048-bit certificate whose Common
//! Name is the device id. Trust is established on first use: the first
//! handshake stores the peer certificate, and every later handshake must
//! present the same one.
//!
//! Key generation goes through the `rsa` crate because rcgen 0.12 cannot
//! generate RSA keys itself; the key is then imported into an rcgen
//! `KeyPair` for signing.

use crate::error::{LinkError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: u32 = 10;

/// Organization name in the certificate DN
const CERT_ORG: &str = "lanlink";

/// Organizational unit in the certificate DN
const CERT_ORG_UNIT: &str = "LAN link";

/// A device certificate with its private key
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device id, stored as the certificate Common Name
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key (PKCS#8)
    pub private_key: Vec<u8>,

    /// SHA-256 fingerprint, colon-separated uppercase hex
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        info!(device_id = %device_id, "generating RSA 2048-bit device certificate");

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| LinkError::certificate(format!("failed to generate RSA key: {}", e)))?;

        let private_key_der = private_key
            .to_pkcs8_der()
            .map_err(|e| LinkError::certificate(format!("failed to encode private key: {}", e)))?;

        let key_pair = KeyPair::from_der(private_key_der.as_bytes())
            .map_err(|e| LinkError::certificate(format!("failed to import key pair: {}", e)))?;

        let mut params = CertificateParams::new(vec![device_id.clone()]);
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CERT_ORG);
        dn.push(DnType::OrganizationalUnitName, CERT_ORG_UNIT);
        dn.push(DnType::CommonName, device_id.clone());
        params.distinguished_name = dn;

        let validity = Duration::from_secs(CERT_VALIDITY_YEARS as u64 * 365 * 24 * 60 * 60);
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + validity;

        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
            rcgen::KeyUsagePurpose::KeyAgreement,
        ];

        let cert = rcgen::Certificate::from_params(params)?;
        let certificate_der = cert
            .serialize_der()
            .map_err(|e| LinkError::certificate(format!("failed to serialize certificate: {}", e)))?;
        let private_key_der = cert.serialize_private_key_der();

        let fingerprint = Self::calculate_fingerprint(&certificate_der);

        debug!(device_id = %device_id, fingerprint = %fingerprint, "certificate generated");

        Ok(Self {
            device_id,
            certificate: certificate_der,
            private_key: private_key_der,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint of a DER certificate as `XX:XX:...:XX`
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        let hash = hasher.finalize();
        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<String>>()
            .join(":")
    }

    /// Write certificate and private key as PEM files.
    ///
    /// Parent directories are created as needed.
    pub fn save_pem(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cert_pem = pem::encode(&pem::Pem::new(
            "CERTIFICATE".to_string(),
            self.certificate.clone(),
        ));
        let key_pem = pem::encode(&pem::Pem::new(
            "PRIVATE KEY".to_string(),
            self.private_key.clone(),
        ));

        fs::write(cert_path, cert_pem.as_bytes())?;
        fs::write(key_path, key_pem.as_bytes())?;

        info!(cert = ?cert_path, key = ?key_path, "saved device certificate");
        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_pem(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!(cert = ?cert_path, "loading device certificate");

        let cert_pem = pem::parse(fs::read(cert_path)?)
            .map_err(|e| LinkError::certificate(format!("failed to parse certificate PEM: {}", e)))?;
        if cert_pem.tag() != "CERTIFICATE" {
            return Err(LinkError::certificate(format!(
                "expected CERTIFICATE tag, got {}",
                cert_pem.tag()
            )));
        }
        let certificate = cert_pem.contents().to_vec();

        let key_pem = pem::parse(fs::read(key_path)?)
            .map_err(|e| LinkError::certificate(format!("failed to parse private key PEM: {}", e)))?;
        if key_pem.tag() != "PRIVATE KEY" && key_pem.tag() != "RSA PRIVATE KEY" {
            return Err(LinkError::certificate(format!(
                "expected PRIVATE KEY tag, got {}",
                key_pem.tag()
            )));
        }
        let private_key = key_pem.contents().to_vec();

        Self::from_der(certificate, private_key)
    }

    /// Build from DER bytes, extracting the device id from the CN
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self> {
        let device_id = Self::extract_device_id(&cert_der)?;
        let fingerprint = Self::calculate_fingerprint(&cert_der);
        Ok(Self {
            device_id,
            certificate: cert_der,
            private_key: key_der,
            fingerprint,
        })
    }

    /// Extract the device id (Common Name) from a DER certificate
    pub fn extract_device_id(cert_der: &[u8]) -> Result<String> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| LinkError::certificate(format!("failed to parse certificate: {}", e)))?;

        for rdn in cert.subject().iter() {
            for attr in rdn.iter() {
                if attr.attr_type() == &x509_parser::oid_registry::OID_X509_COMMON_NAME {
                    let cn = attr
                        .as_str()
                        .map_err(|e| LinkError::certificate(format!("failed to extract CN: {}", e)))?;
                    return Ok(cn.to_string());
                }
            }
        }

        Err(LinkError::certificate(
            "certificate does not contain a Common Name",
        ))
    }

    /// Validate the certificate: parseable, inside its validity window,
    /// RSA-keyed.
    pub fn validate(&self) -> Result<()> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(&self.certificate)
            .map_err(|e| LinkError::certificate(format!("failed to parse certificate: {}", e)))?;

        let now = ::time::OffsetDateTime::now_utc();
        if now < cert.validity().not_before.to_datetime() {
            return Err(LinkError::certificate("certificate not yet valid"));
        }
        if now > cert.validity().not_after.to_datetime() {
            return Err(LinkError::certificate("certificate has expired"));
        }

        let algo = &cert.public_key().algorithm.algorithm;
        if algo != &x509_parser::oid_registry::OID_PKCS1_RSAENCRYPTION {
            return Err(LinkError::certificate(format!(
                "expected RSA encryption, got OID {:?}",
                algo
            )));
        }

        Ok(())
    }
}
