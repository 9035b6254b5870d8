//! lanlink
//!
//! LAN device discovery, trust-on-first-use TLS links, and packet
//! transport.
//!
//! Two devices on the same local network discover each other via UDP
//! identity broadcasts, mutually authenticate with self-signed
//! certificates pinned on first use, and exchange newline-delimited JSON
//! packets over a long-lived TLS connection. Bulk binary payloads travel
//! out-of-band on ephemeral side-channel connections.
//!
//! ## Architecture
//!
//! - `protocol`: wire types (packets, device identities)
//! - `network`: discovery, handshake negotiation, links, queues, payloads
//! - `crypto`: device certificates, TLS upgrades, the trust store seam
//!
//! ## Example
//!
//! ```no_run
//! use lanlink::{CertificateInfo, DeviceType, LinkConfig, LinkProvider, MemoryTrustStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> lanlink::Result<()> {
//! let config = LinkConfig::new("dev_1234", "My Desktop", DeviceType::Desktop);
//! let certificate = CertificateInfo::generate("dev_1234")?;
//! let trust = Arc::new(MemoryTrustStore::new());
//!
//! let (provider, mut events) = LinkProvider::new(config, certificate, trust)?;
//! provider.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event.device_id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod protocol;

// Re-export commonly used types
pub use config::LinkConfig;
pub use crypto::certificate::CertificateInfo;
pub use crypto::trust::{MemoryTrustStore, TrustStore};
pub use error::{LinkError, Result};
pub use network::events::{LinkDirection, LinkEvent};
pub use network::link::Link;
pub use network::payload::{InboundPayload, PayloadSource};
pub use network::provider::LinkProvider;
pub use network::queue::{NoopCallback, SendCallback, NO_REPLACE};
pub use protocol::identity::{DeviceIdentity, DeviceType};
pub use protocol::packet::{Packet, TransferInfo};
pub use protocol::PROTOCOL_VERSION;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
