//! Device identity
//!
//! Identity packets announce a device's id, name, type, protocol version,
//! and capability sets. They appear three times in the protocol: in UDP
//! discovery broadcasts (with `tcpPort`), as the mandatory first plaintext
//! line of a TCP connection, and re-exchanged inside TLS for protocol v8+.

use crate::error::{LinkError, Result};
use crate::protocol::packet::Packet;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Packet type for identity announcements
pub const IDENTITY_PACKET_TYPE: &str = "lanlink.identity";

/// Announced device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Phone,
    Tablet,
    Desktop,
    Laptop,
    Tv,
}

impl DeviceType {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a wire string; unknown values fall back to `Desktop` (the wire
    /// is lenient, the enum is closed)
    pub fn parse(value: &str) -> Self {
        match value {
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "laptop" => DeviceType::Laptop,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer's announced identity
///
/// Immutable once constructed; rebuilt from scratch on every identity
/// exchange and compared field-by-field against previously stored values
/// for downgrade detection. Capability strings are opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Stable, immutable identifier
    pub device_id: String,

    /// Human-readable name
    pub device_name: String,

    /// Announced device class
    pub device_type: DeviceType,

    /// Protocol version the peer speaks
    pub protocol_version: i32,

    /// Packet types the peer can receive
    pub incoming_capabilities: BTreeSet<String>,

    /// Packet types the peer can send
    pub outgoing_capabilities: BTreeSet<String>,
}

impl DeviceIdentity {
    /// Build the identity packet for this device.
    ///
    /// `tcp_port` is included for discovery broadcasts and the plaintext
    /// connection opener so the receiver knows where to dial back; pass 0 to
    /// omit it (in-TLS re-exchange).
    pub fn to_packet(&self, tcp_port: u16) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities.iter().collect::<Vec<_>>(),
            "outgoingCapabilities": self.outgoing_capabilities.iter().collect::<Vec<_>>(),
        });
        if tcp_port != 0 {
            body["tcpPort"] = json!(tcp_port);
        }
        Packet::new(IDENTITY_PACKET_TYPE, body)
    }

    /// Build an identity packet directed at one specific peer.
    ///
    /// Directed announcements carry `targetDeviceId`/`targetProtocolVersion`
    /// so other listeners on the segment can ignore them.
    pub fn to_directed_packet(
        &self,
        tcp_port: u16,
        target_device_id: &str,
        target_protocol_version: i32,
    ) -> Packet {
        let mut packet = self.to_packet(tcp_port);
        packet
            .body
            .insert("targetDeviceId".into(), json!(target_device_id));
        packet.body.insert(
            "targetProtocolVersion".into(),
            json!(target_protocol_version),
        );
        packet
    }

    /// Parse and validate an identity packet.
    ///
    /// Rejects wrong packet types and blank `deviceId`/`deviceName`; both
    /// are mandatory before a connection may proceed.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(IDENTITY_PACKET_TYPE) {
            return Err(LinkError::malformed(format!(
                "expected {} packet, got {}",
                IDENTITY_PACKET_TYPE, packet.packet_type
            )));
        }

        let device_id = string_field(packet, "deviceId")?;
        let device_name = string_field(packet, "deviceName")?;

        let device_type = packet
            .body
            .get("deviceType")
            .and_then(Value::as_str)
            .map(DeviceType::parse)
            .unwrap_or(DeviceType::Desktop);

        let protocol_version = packet
            .body
            .get("protocolVersion")
            .and_then(Value::as_i64)
            .ok_or_else(|| LinkError::malformed("identity packet missing protocolVersion"))?
            as i32;

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities: capability_set(packet, "incomingCapabilities"),
            outgoing_capabilities: capability_set(packet, "outgoingCapabilities"),
        })
    }

    /// The TCP port announced for dial-back, if present
    pub fn tcp_port(packet: &Packet) -> Option<u16> {
        packet
            .body
            .get("tcpPort")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    /// The device this announcement is directed at, if any
    pub fn target_device_id(packet: &Packet) -> Option<&str> {
        packet.body.get("targetDeviceId").and_then(Value::as_str)
    }
}

fn string_field(packet: &Packet, key: &str) -> Result<String> {
    let value = packet
        .body
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if value.is_empty() {
        return Err(LinkError::malformed(format!(
            "identity packet missing or blank {}",
            key
        )));
    }
    Ok(value.to_string())
}

fn capability_set(packet: &Packet, key: &str) -> BTreeSet<String> {
    packet
        .body
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev_abc123".into(),
            device_name: "Workstation".into(),
            device_type: DeviceType::Laptop,
            protocol_version: 8,
            incoming_capabilities: ["lanlink.ping".to_string()].into_iter().collect(),
            outgoing_capabilities: ["lanlink.ping".to_string(), "lanlink.share".to_string()]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_identity_round_trip() {
        let identity = sample_identity();
        let packet = identity.to_packet(1716);

        assert_eq!(packet.packet_type, IDENTITY_PACKET_TYPE);
        assert_eq!(DeviceIdentity::tcp_port(&packet), Some(1716));

        let parsed = DeviceIdentity::from_packet(&packet).unwrap();
        assert_eq!(parsed, identity);
    }

    #[test]
    fn test_tcp_port_omitted_when_zero() {
        let packet = sample_identity().to_packet(0);
        assert_eq!(DeviceIdentity::tcp_port(&packet), None);
    }

    #[test]
    fn test_blank_device_id_rejected() {
        let mut packet = sample_identity().to_packet(1716);
        packet.body.insert("deviceId".into(), json!("   "));
        assert!(DeviceIdentity::from_packet(&packet).is_err());
    }

    #[test]
    fn test_blank_device_name_rejected() {
        let mut packet = sample_identity().to_packet(1716);
        packet.body.insert("deviceName".into(), json!(""));
        assert!(DeviceIdentity::from_packet(&packet).is_err());
    }

    #[test]
    fn test_wrong_packet_type_rejected() {
        let packet = Packet::new("lanlink.ping", json!({}));
        assert!(DeviceIdentity::from_packet(&packet).is_err());
    }

    #[test]
    fn test_unknown_device_type_falls_back_to_desktop() {
        let mut packet = sample_identity().to_packet(1716);
        packet.body.insert("deviceType".into(), json!("toaster"));
        let parsed = DeviceIdentity::from_packet(&packet).unwrap();
        assert_eq!(parsed.device_type, DeviceType::Desktop);
    }

    #[test]
    fn test_directed_packet_carries_target() {
        let packet = sample_identity().to_directed_packet(1716, "dev_other", 8);
        assert_eq!(
            DeviceIdentity::target_device_id(&packet),
            Some("dev_other")
        );
        // still parses as a normal identity
        assert!(DeviceIdentity::from_packet(&packet).is_ok());
    }

    #[test]
    fn test_capabilities_compare_as_sets() {
        let a = sample_identity();
        let mut b = sample_identity();
        b.outgoing_capabilities = ["lanlink.share".to_string(), "lanlink.ping".to_string()]
            .into_iter()
            .collect();
        assert_eq!(a, b);
    }
}
