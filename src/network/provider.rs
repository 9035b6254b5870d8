//! Link provider
//!
//! The orchestrator: owns the visible-device registry, wires the discovery
//! beacon, negotiator, and links together, and surfaces connection events
//! upward. The registry is the only state shared across the acceptor,
//! negotiator, and per-link tasks; every insert, remove, and reset goes
//! through one critical section here so no two links can ever exist for
//! the same device id.

use crate::config::LinkConfig;
use crate::crypto::certificate::CertificateInfo;
use crate::crypto::trust::TrustStore;
use crate::error::{LinkError, Result};
use crate::network::bind_first_free;
use crate::network::discovery::DiscoveryBeacon;
use crate::network::events::{LinkDirection, LinkEvent};
use crate::network::link::Link;
use crate::network::negotiator::Negotiator;
use crate::network::throttle::Throttle;
use crate::protocol::identity::DeviceIdentity;
use crate::protocol::PROTOCOL_VERSION;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

/// Shared state threaded through every component of one provider
pub(crate) struct LinkHub {
    pub config: LinkConfig,
    pub certificate: CertificateInfo,
    pub trust: Arc<dyn TrustStore>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub handshake_throttle: Throttle<String>,
    pub discovery_throttle: Throttle<IpAddr>,
    links: Mutex<HashMap<String, Arc<Link>>>,
    tcp_port: AtomicU16,
}

impl LinkHub {
    /// The identity we announce, with the current capability sets
    pub fn local_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            device_type: self.config.device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: self.config.incoming_capabilities.clone(),
            outgoing_capabilities: self.config.outgoing_capabilities.clone(),
        }
    }

    /// The bound control-channel port, 0 before start
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::SeqCst)
    }

    pub fn set_tcp_port(&self, port: u16) {
        self.tcp_port.store(port, Ordering::SeqCst);
    }

    /// Register the outcome of a successful handshake: reset the existing
    /// link for this device or create a new one, then emit
    /// ConnectionAccepted. The registry lookup-or-insert runs under one
    /// lock, keeping the one-link-per-device invariant.
    pub(crate) async fn establish(
        self: Arc<Self>,
        identity: DeviceIdentity,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        direction: LinkDirection,
        peer_cert: Vec<u8>,
    ) -> Result<()> {
        let link = {
            let mut links = self.links.lock().expect("registry lock poisoned");
            match links.get(&identity.device_id) {
                Some(existing) => existing.clone(),
                None => {
                    let link = Link::spawn(self.clone(), identity.clone(), direction);
                    links.insert(identity.device_id.clone(), link.clone());
                    link
                }
            }
        };

        let replaced = link
            .clone()
            .reset(stream, addr, identity.clone(), direction, peer_cert)
            .await;
        if replaced {
            debug!(device_id = %identity.device_id, "existing link rebound to new socket");
        }

        let _ = self.events.send(LinkEvent::ConnectionAccepted {
            identity,
            direction,
        });
        Ok(())
    }

    /// Drop a link whose socket died, unless a newer socket generation has
    /// already replaced it.
    pub(crate) async fn link_lost(&self, device_id: &str, generation: u64) {
        let link = {
            let mut links = self.links.lock().expect("registry lock poisoned");
            match links.get(device_id) {
                Some(link) if link.current_generation() == generation => links.remove(device_id),
                _ => None,
            }
        };

        if let Some(link) = link {
            info!(device_id = %device_id, "link removed from registry");
            let _ = self.events.send(LinkEvent::ConnectionLost {
                device_id: device_id.to_string(),
            });
            link.teardown().await;
        }
    }

    pub(crate) fn link_for(&self, device_id: &str) -> Option<Arc<Link>> {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .get(device_id)
            .cloned()
    }

    pub(crate) fn visible_devices(&self) -> Vec<String> {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn snapshot_links(&self) -> Vec<Arc<Link>> {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// The LAN link provider
///
/// Construction hands back the event receiver; [`start`](Self::start)
/// binds the listeners and sends the first broadcast.
pub struct LinkProvider {
    hub: Arc<LinkHub>,
    negotiator: Arc<Negotiator>,
    beacon: Arc<DiscoveryBeacon>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkProvider {
    /// Build a provider for the given local device.
    ///
    /// The certificate must belong to the configured device id; trust
    /// decisions are delegated to the given store.
    pub fn new(
        config: LinkConfig,
        certificate: CertificateInfo,
        trust: Arc<dyn TrustStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        if certificate.device_id != config.device_id {
            return Err(LinkError::certificate(format!(
                "certificate belongs to {} but the local device is {}",
                certificate.device_id, config.device_id
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let hub = Arc::new(LinkHub {
            handshake_throttle: Throttle::new(config.throttle_cooldown, config.throttle_capacity),
            discovery_throttle: Throttle::new(config.throttle_cooldown, config.throttle_capacity),
            config,
            certificate,
            trust,
            events,
            links: Mutex::new(HashMap::new()),
            tcp_port: AtomicU16::new(0),
        });
        let negotiator = Negotiator::new(hub.clone());
        let beacon = DiscoveryBeacon::new(hub.clone(), negotiator.clone());

        Ok((
            Self {
                hub,
                negotiator,
                beacon,
                tasks: Mutex::new(Vec::new()),
            },
            receiver,
        ))
    }

    /// Bind the TCP acceptor and UDP listener, then announce ourselves
    pub async fn start(&self) -> Result<()> {
        {
            let tasks = self.tasks.lock().expect("task lock poisoned");
            if !tasks.is_empty() {
                return Ok(());
            }
        }

        let listener = bind_first_free(
            self.hub.config.tcp_port_start,
            self.hub.config.tcp_port_end,
        )
        .await?;
        let port = listener.local_addr()?.port();
        self.hub.set_tcp_port(port);
        info!(port, "control channel listening");
        let accept_task = tokio::spawn(self.negotiator.clone().accept_loop(listener));

        let udp = UdpSocket::bind(("0.0.0.0", self.hub.config.discovery_port)).await?;
        info!(port = udp.local_addr()?.port(), "discovery listening");
        let listen_task = tokio::spawn(self.beacon.clone().listen_loop(udp));

        self.tasks
            .lock()
            .expect("task lock poisoned")
            .extend([accept_task, listen_task]);

        if let Err(e) = self.beacon.broadcast().await {
            warn!(error = %e, "initial broadcast failed");
        }
        Ok(())
    }

    /// Stop the listeners and disconnect every link
    pub async fn stop(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        for link in self.hub.snapshot_links() {
            link.disconnect().await;
        }
        info!("link provider stopped");
    }

    /// Debounced re-announcement for connectivity-change notifications
    pub async fn on_network_change(&self) {
        if let Err(e) = self.beacon.broadcast_debounced().await {
            warn!(error = %e, "network-change broadcast failed");
        }
    }

    /// Dial a discovery candidate directly.
    ///
    /// The normal path goes through the UDP listener; this entry point
    /// serves directed announcements and tests.
    pub async fn dial(&self, candidate: DeviceIdentity, addr: SocketAddr) -> Result<()> {
        self.negotiator.connect_to(candidate, addr).await
    }

    /// Device ids with a registered link
    pub fn visible_devices(&self) -> Vec<String> {
        self.hub.visible_devices()
    }

    /// The link for a device, if one is registered
    pub fn link_for(&self, device_id: &str) -> Option<Arc<Link>> {
        self.hub.link_for(device_id)
    }

    /// The bound control-channel port, 0 before start
    pub fn tcp_port(&self) -> u16 {
        self.hub.tcp_port()
    }

    /// The identity currently announced by this provider
    pub fn local_identity(&self) -> DeviceIdentity {
        self.hub.local_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::trust::MemoryTrustStore;
    use crate::protocol::identity::DeviceType;

    #[test]
    fn test_certificate_must_match_device_id() {
        let config = LinkConfig::new("dev_a", "Device A", DeviceType::Desktop);
        let wrong_cert = CertificateInfo::generate("dev_b").unwrap();
        let result = LinkProvider::new(config, wrong_cert, Arc::new(MemoryTrustStore::new()));
        assert!(matches!(result, Err(LinkError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_registry_empty_before_any_handshake() {
        let config = LinkConfig::new("dev_a", "Device A", DeviceType::Desktop);
        let cert = CertificateInfo::generate("dev_a").unwrap();
        let (provider, _events) =
            LinkProvider::new(config, cert, Arc::new(MemoryTrustStore::new())).unwrap();

        assert!(provider.visible_devices().is_empty());
        assert!(provider.link_for("dev_missing").is_none());
        assert_eq!(provider.tcp_port(), 0);
    }

    #[tokio::test]
    async fn test_local_identity_reflects_config() {
        let mut config = LinkConfig::new("dev_a", "Device A", DeviceType::Laptop);
        config
            .incoming_capabilities
            .insert("lanlink.ping".to_string());
        let cert = CertificateInfo::generate("dev_a").unwrap();
        let (provider, _events) =
            LinkProvider::new(config, cert, Arc::new(MemoryTrustStore::new())).unwrap();

        let identity = provider.local_identity();
        assert_eq!(identity.device_id, "dev_a");
        assert_eq!(identity.device_type, DeviceType::Laptop);
        assert_eq!(identity.protocol_version, PROTOCOL_VERSION);
        assert!(identity
            .incoming_capabilities
            .contains("lanlink.ping"));
    }
}
