//! Error types for lanlink

use std::io;
use thiserror::Error;

/// Result type alias using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors produced by the LAN link subsystem.
///
/// Nothing here is fatal to the hosting process: connection-scoped errors
/// abort only the connection attempt they belong to, and payload errors are
/// reported through the send callback rather than tearing down the link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line failed to parse as a packet or lacks required fields
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Identity/TLS handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer announced a lower protocol version than previously recorded
    #[error("Protocol downgrade refused: {0}")]
    ProtocolDowngrade(String),

    /// Post-TLS identity does not match the pre-TLS announcement
    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// No socket is currently attached to the link
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Payload side-channel failure (not fatal to the link)
    #[error("Payload transfer failed: {0}")]
    Payload(String),

    /// Payload transfer was cancelled cooperatively
    #[error("Payload transfer cancelled")]
    PayloadCancelled,

    /// Duplicate attempt inside the cool-down window, silently discarded
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl LinkError {
    /// Create a MalformedPacket error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }

    /// Create a HandshakeFailed error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Create a Tls error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a Certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a NotConnected error
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create a Payload error
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// True for failures that abort a single attempt without being worth
    /// more than a debug log (duplicate handshakes inside the cool-down)
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

// Implement From for common error types
impl From<rustls::Error> for LinkError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for LinkError {
    fn from(err: rcgen::Error) -> Self {
        Self::Certificate(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
