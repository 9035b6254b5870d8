//! Network module
//!
//! The concurrency and transport layer of the subsystem.
//!
//! This module contains:
//! - `discovery`: UDP identity broadcast and receive
//! - `negotiator`: the handshake state machine
//! - `link`: the durable per-device channel
//! - `queue`: the per-device outgoing packet queue
//! - `payload`: the binary payload side-channel
//! - `provider`: registry, events, and component wiring
//! - `throttle`: the bounded recency map rate limiter

pub mod discovery;
pub mod events;
pub mod link;
pub mod negotiator;
pub mod payload;
pub mod provider;
pub mod queue;
pub mod throttle;

// Re-exports for convenience
pub use events::{LinkDirection, LinkEvent};
pub use link::Link;
pub use negotiator::HandshakeState;
pub use payload::{InboundPayload, PayloadSource};
pub use provider::LinkProvider;
pub use queue::{NoopCallback, PacketQueue, QueuedPacket, SendCallback, NO_REPLACE};
pub use throttle::Throttle;

use crate::error::{LinkError, Result};
use std::io;
use tokio::net::TcpListener;
use tracing::debug;

/// Bind the first free port in an inclusive range
pub(crate) async fn bind_first_free(start: u16, end: u16) -> Result<TcpListener> {
    for port in start..=end {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if port != start {
                    debug!(port, "bound after skipping busy ports");
                }
                return Ok(listener);
            }
            Err(_) => continue,
        }
    }
    Err(LinkError::Io(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in {}..={}", start, end),
    )))
}
