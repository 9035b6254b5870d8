//! Link subsystem configuration
//!
//! All tunables for discovery, negotiation, and transfer live in
//! [`LinkConfig`]. The defaults mirror the reference protocol constants;
//! tests override the port fields with high ephemeral ranges.

use crate::protocol::identity::DeviceType;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Well-known UDP port for identity broadcasts
pub const DISCOVERY_PORT: u16 = 1716;

/// First TCP port tried for the control-channel listener
pub const TCP_PORT_START: u16 = 1716;

/// Last TCP port tried for the control-channel listener
pub const TCP_PORT_END: u16 = 1764;

/// First port tried for ephemeral payload listeners
pub const PAYLOAD_PORT_START: u16 = 1739;

/// Last port tried for ephemeral payload listeners
pub const PAYLOAD_PORT_END: u16 = 1764;

/// Size cap for the mandatory pre-authentication identity line (512 KiB)
pub const IDENTITY_LINE_CAP: usize = 512 * 1024;

/// Hard size cap for post-authentication control lines (32 MiB)
pub const CONTROL_LINE_CAP: usize = 32 * 1024 * 1024;

/// Configuration for a [`LinkProvider`](crate::network::provider::LinkProvider)
///
/// Carries the local device's announced identity plus every port range,
/// timeout, and cool-down the subsystem uses.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Stable, immutable identifier announced in identity packets
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Announced device class
    pub device_type: DeviceType,

    /// Packet types this device can receive (opaque strings)
    pub incoming_capabilities: BTreeSet<String>,

    /// Packet types this device can send (opaque strings)
    pub outgoing_capabilities: BTreeSet<String>,

    /// UDP port bound by the discovery listener and targeted by broadcasts.
    /// Port 0 binds an ephemeral port, effectively disabling undirected
    /// discovery (used by tests and directed-only deployments).
    pub discovery_port: u16,

    /// Additional unicast discovery targets announced to on every broadcast
    pub static_targets: Vec<SocketAddr>,

    /// Control-channel listener port range (first free port is bound)
    pub tcp_port_start: u16,
    pub tcp_port_end: u16,

    /// Payload side-channel listener port range
    pub payload_port_start: u16,
    pub payload_port_end: u16,

    /// Cool-down applied per sender IP (discovery) and per device id
    /// (handshakes) before another attempt is admitted
    pub throttle_cooldown: Duration,

    /// Maximum number of entries retained by a throttle map before old
    /// entries are purged
    pub throttle_capacity: usize,

    /// Minimum interval between on-network-change broadcasts
    pub broadcast_debounce: Duration,

    /// Budget for one complete handshake attempt (identity read, TLS
    /// upgrade, secure re-exchange)
    pub handshake_timeout: Duration,

    /// How long a payload listener waits for the peer to dial back
    pub payload_accept_timeout: Duration,

    /// Minimum interval between progress callbacks during payload transfer
    pub progress_interval: Duration,

    /// How long a dead socket waits for a replacement before the link is
    /// reported lost
    pub reset_grace: Duration,

    /// Byte cap for the pre-TLS identity line
    pub identity_line_cap: usize,

    /// Byte cap for post-authentication control lines
    pub control_line_cap: usize,
}

impl LinkConfig {
    /// Create a configuration with the reference defaults for the given
    /// local device identity.
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
            discovery_port: DISCOVERY_PORT,
            static_targets: Vec::new(),
            tcp_port_start: TCP_PORT_START,
            tcp_port_end: TCP_PORT_END,
            payload_port_start: PAYLOAD_PORT_START,
            payload_port_end: PAYLOAD_PORT_END,
            throttle_cooldown: Duration::from_millis(1000),
            throttle_capacity: 255,
            broadcast_debounce: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(30),
            payload_accept_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_millis(500),
            reset_grace: Duration::from_secs(1),
            identity_line_cap: IDENTITY_LINE_CAP,
            control_line_cap: CONTROL_LINE_CAP,
        }
    }
}
