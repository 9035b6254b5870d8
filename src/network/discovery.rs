//! Discovery beacon
//!
//! Announces the local identity over UDP and watches for peers doing the
//! same. A validated announcement becomes a dial-back candidate for the
//! negotiator. Broadcast requests triggered by connectivity changes are
//! debounced so notification storms do not flood the segment.

use crate::error::Result;
use crate::network::negotiator::Negotiator;
use crate::network::provider::LinkHub;
use crate::protocol::identity::{DeviceIdentity, IDENTITY_PACKET_TYPE};
use crate::protocol::packet::Packet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// True for addresses a LAN peer can legitimately announce from:
/// link-local, site-local (RFC 1918 / unique-local), or loopback.
pub(crate) fn is_lan_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Broadcasts and receives UDP identity announcements
pub(crate) struct DiscoveryBeacon {
    hub: Arc<LinkHub>,
    negotiator: Arc<Negotiator>,
    last_broadcast: Mutex<Option<Instant>>,
}

impl DiscoveryBeacon {
    pub fn new(hub: Arc<LinkHub>, negotiator: Arc<Negotiator>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            negotiator,
            last_broadcast: Mutex::new(None),
        })
    }

    /// Send the local identity (with our TCP listening port) to the
    /// network broadcast address and every configured static target. Opens
    /// a transient socket per call.
    pub async fn broadcast(&self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;

        let packet = self
            .hub
            .local_identity()
            .to_packet(self.hub.tcp_port());
        let bytes = packet.to_bytes()?;

        let mut targets = vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            self.hub.config.discovery_port,
        )];
        targets.extend(self.hub.config.static_targets.iter().copied());

        for target in targets {
            if let Err(e) = socket.send_to(&bytes, target).await {
                warn!(target = %target, error = %e, "identity broadcast failed");
            } else {
                trace!(target = %target, "identity broadcast sent");
            }
        }
        Ok(())
    }

    /// Broadcast unless one was sent within the debounce interval.
    /// Connectivity-change notifications arrive in bursts; only the first
    /// of each burst reaches the wire.
    pub async fn broadcast_debounced(&self) -> Result<()> {
        {
            let mut last = self.last_broadcast.lock().expect("broadcast lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < self.hub.config.broadcast_debounce {
                    debug!("broadcast suppressed by debounce");
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        self.broadcast().await
    }

    /// Receive announcements forever on the long-lived discovery socket
    pub async fn listen_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; self.hub.config.identity_line_cap];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let packet = match Packet::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping unparseable datagram");
                return;
            }
        };

        if !packet.is_type(IDENTITY_PACKET_TYPE) {
            debug!(from = %from, packet_type = %packet.packet_type, "dropping non-identity datagram");
            return;
        }

        if !is_lan_address(&from.ip()) {
            warn!(from = %from, "dropping announcement from non-local address");
            return;
        }

        if !self.hub.discovery_throttle.admit(from.ip()) {
            trace!(from = %from, "announcement inside cool-down, dropped");
            return;
        }

        let identity = match DeviceIdentity::from_packet(&packet) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping invalid identity announcement");
                return;
            }
        };

        if identity.device_id == self.hub.config.device_id {
            trace!("ignoring our own announcement");
            return;
        }

        if let Some(target) = DeviceIdentity::target_device_id(&packet) {
            if target != self.hub.config.device_id {
                trace!(target = %target, "announcement directed elsewhere, dropped");
                return;
            }
        }

        let Some(tcp_port) = DeviceIdentity::tcp_port(&packet) else {
            debug!(from = %from, "announcement has no tcpPort, cannot dial back");
            return;
        };

        let candidate_addr = SocketAddr::new(from.ip(), tcp_port);
        debug!(
            device_id = %identity.device_id,
            addr = %candidate_addr,
            "discovered peer, dialing back"
        );

        let negotiator = self.negotiator.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiator.connect_to(identity, candidate_addr).await {
                if e.is_rate_limited() {
                    debug!(addr = %candidate_addr, "{}", e);
                } else {
                    warn!(addr = %candidate_addr, error = %e, "dial-back failed");
                }
            }
        });
    }
}
