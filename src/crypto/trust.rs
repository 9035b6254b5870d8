//! Trust store collaborator
//!
//! Certificate persistence is the host application's concern; the link
//! subsystem only needs to ask whether a device is trusted, fetch the
//! pinned certificate, and record what it learns from successful
//! handshakes. A device is trusted iff a certificate is on file for its id.
//!
//! [`MemoryTrustStore`] is the bundled non-persistent implementation, used
//! by tests and by embedders that handle persistence elsewhere.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Storage collaborator for per-device trust state
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Whether a certificate is on file for this device
    async fn is_trusted(&self, device_id: &str) -> bool {
        self.certificate_for(device_id).await.is_some()
    }

    /// The stored DER certificate for this device, if any
    async fn certificate_for(&self, device_id: &str) -> Option<Vec<u8>>;

    /// Store the certificate observed in a successful handshake.
    ///
    /// Called once per device on first contact (trust-on-first-use); later
    /// handshakes validate against the stored copy instead.
    async fn remember_certificate(&self, device_id: &str, cert_der: &[u8]);

    /// The protocol version recorded at the last successful handshake
    async fn last_protocol_version(&self, device_id: &str) -> Option<i32>;

    /// Record the protocol version of a successful handshake
    async fn record_protocol_version(&self, device_id: &str, version: i32);
}

#[derive(Debug, Default, Clone)]
struct TrustEntry {
    certificate: Option<Vec<u8>>,
    protocol_version: Option<i32>,
}

/// In-memory trust store
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    entries: Mutex<HashMap<String, TrustEntry>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-trust a device, as if it had paired before
    pub fn preload(&self, device_id: &str, cert_der: &[u8], protocol_version: i32) {
        let mut entries = self.entries.lock().expect("trust store lock poisoned");
        entries.insert(
            device_id.to_string(),
            TrustEntry {
                certificate: Some(cert_der.to_vec()),
                protocol_version: Some(protocol_version),
            },
        );
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn certificate_for(&self, device_id: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("trust store lock poisoned");
        entries.get(device_id).and_then(|e| e.certificate.clone())
    }

    async fn remember_certificate(&self, device_id: &str, cert_der: &[u8]) {
        let mut entries = self.entries.lock().expect("trust store lock poisoned");
        entries
            .entry(device_id.to_string())
            .or_default()
            .certificate = Some(cert_der.to_vec());
    }

    async fn last_protocol_version(&self, device_id: &str) -> Option<i32> {
        let entries = self.entries.lock().expect("trust store lock poisoned");
        entries.get(device_id).and_then(|e| e.protocol_version)
    }

    async fn record_protocol_version(&self, device_id: &str, version: i32) {
        let mut entries = self.entries.lock().expect("trust store lock poisoned");
        entries
            .entry(device_id.to_string())
            .or_default()
            .protocol_version = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_untrusted_until_certificate_stored() {
        let store = MemoryTrustStore::new();
        assert!(!store.is_trusted("dev_x").await);

        store.remember_certificate("dev_x", b"cert-bytes").await;
        assert!(store.is_trusted("dev_x").await);
        assert_eq!(
            store.certificate_for("dev_x").await,
            Some(b"cert-bytes".to_vec())
        );
    }

    #[tokio::test]
    async fn test_protocol_version_tracking() {
        let store = MemoryTrustStore::new();
        assert_eq!(store.last_protocol_version("dev_x").await, None);

        store.record_protocol_version("dev_x", 7).await;
        assert_eq!(store.last_protocol_version("dev_x").await, Some(7));

        store.record_protocol_version("dev_x", 8).await;
        assert_eq!(store.last_protocol_version("dev_x").await, Some(8));
    }

    #[tokio::test]
    async fn test_preload() {
        let store = MemoryTrustStore::new();
        store.preload("dev_x", b"cert", 8);
        assert!(store.is_trusted("dev_x").await);
        assert_eq!(store.last_protocol_version("dev_x").await, Some(8));
    }
}
