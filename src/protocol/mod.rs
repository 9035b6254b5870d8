//! Protocol module
//!
//! Core wire types for the LAN link protocol.
//!
//! This module contains:
//! - `packet`: newline-delimited JSON packet codec
//! - `identity`: device identity packets and validation

pub mod identity;
pub mod packet;

// Re-exports for convenience
pub use identity::{DeviceIdentity, DeviceType, IDENTITY_PACKET_TYPE};
pub use packet::{Packet, TransferInfo, PAYLOAD_SIZE_UNKNOWN};

/// Protocol version implemented by this library.
///
/// Version 8 adds the in-TLS identity re-exchange; version 7 peers are still
/// accepted and simply skip that step.
pub const PROTOCOL_VERSION: i32 = 8;

/// First protocol version that re-exchanges identities inside TLS
pub const SECURE_IDENTITY_MIN_VERSION: i32 = 8;
