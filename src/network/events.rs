//! Link event system
//!
//! Events emitted upward by the link provider: connection lifecycle changes
//! and received packets. Consumers take the receiver end of the event
//! channel at provider construction.

use crate::network::payload::InboundPayload;
use crate::protocol::identity::DeviceIdentity;
use crate::protocol::packet::Packet;

/// Who opened the exchange that produced a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// The peer answered our broadcast and dialed our TCP acceptor
    LocallyInitiated,
    /// We received the peer's broadcast and dialed back
    RemotelyInitiated,
}

/// Events emitted by the link provider
#[derive(Debug)]
pub enum LinkEvent {
    /// A handshake completed and a link is registered for the device.
    /// Fires again on every reconnect handshake that resets the link.
    ConnectionAccepted {
        identity: DeviceIdentity,
        direction: LinkDirection,
    },

    /// The device's socket died and no replacement arrived in time
    ConnectionLost { device_id: String },

    /// A packet arrived on a link, with its payload stream attached when
    /// the packet announced one
    PacketReceived {
        device_id: String,
        packet: Packet,
        payload: Option<InboundPayload>,
    },
}

impl LinkEvent {
    /// Check if this is a connection accepted event
    pub fn is_connection_accepted(&self) -> bool {
        matches!(self, LinkEvent::ConnectionAccepted { .. })
    }

    /// Check if this is a connection lost event
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, LinkEvent::ConnectionLost { .. })
    }

    /// Get the device id this event concerns
    pub fn device_id(&self) -> &str {
        match self {
            LinkEvent::ConnectionAccepted { identity, .. } => &identity.device_id,
            LinkEvent::ConnectionLost { device_id } => device_id,
            LinkEvent::PacketReceived { device_id, .. } => device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::identity::DeviceType;
    use std::collections::BTreeSet;

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: id.to_string(),
            device_name: "Test".to_string(),
            device_type: DeviceType::Desktop,
            protocol_version: 8,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
        }
    }

    #[test]
    fn test_event_type_checking() {
        let accepted = LinkEvent::ConnectionAccepted {
            identity: identity("dev_1"),
            direction: LinkDirection::LocallyInitiated,
        };
        assert!(accepted.is_connection_accepted());
        assert!(!accepted.is_connection_lost());

        let lost = LinkEvent::ConnectionLost {
            device_id: "dev_1".to_string(),
        };
        assert!(lost.is_connection_lost());
    }

    #[test]
    fn test_device_id_extraction() {
        let accepted = LinkEvent::ConnectionAccepted {
            identity: identity("dev_abc"),
            direction: LinkDirection::RemotelyInitiated,
        };
        assert_eq!(accepted.device_id(), "dev_abc");

        let lost = LinkEvent::ConnectionLost {
            device_id: "dev_lost".to_string(),
        };
        assert_eq!(lost.device_id(), "dev_lost");
    }
}
