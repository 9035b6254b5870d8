//! Device packet queue
//!
//! Each link drains one of these: a FIFO of outgoing packets with
//! replace-by-id collapsing. A caller emitting rapid updates of the same
//! logical event tags them with a shared non-negative replace id; only the
//! most recent unsent one is ever transmitted, so the queue cannot grow
//! without bound under update storms. Exactly one packet is in flight at a
//! time per device, which also bounds concurrent payload side-channels per
//! device to one.

use crate::error::LinkError;
use crate::network::payload::PayloadSource;
use crate::protocol::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::trace;

/// Replace id meaning "never collapse"
pub const NO_REPLACE: i64 = -1;

/// Sink for the outcome of a queued send
///
/// `on_success` fires once the control line is written; a payload failure
/// after that point is reported through `on_payload_failure` only, because
/// the control packet has already reached the peer. The callback doubles as
/// the cooperative cancellation token for an in-flight payload transfer.
pub trait SendCallback: Send + Sync {
    fn on_success(&self) {}
    fn on_failure(&self, _error: &LinkError) {}
    fn on_progress(&self, _sent: u64, _total: i64) {}
    fn on_payload_failure(&self, _error: &LinkError) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Callback that ignores every signal
pub struct NoopCallback;

impl SendCallback for NoopCallback {}

/// One entry in the queue
pub struct QueuedPacket {
    pub packet: Packet,
    pub payload: Option<PayloadSource>,
    pub replace_id: i64,
    pub callback: Arc<dyn SendCallback>,
}

impl QueuedPacket {
    pub fn new(packet: Packet, replace_id: i64, callback: Arc<dyn SendCallback>) -> Self {
        Self {
            packet,
            payload: None,
            replace_id,
            callback,
        }
    }

    pub fn with_payload(
        packet: Packet,
        payload: PayloadSource,
        replace_id: i64,
        callback: Arc<dyn SendCallback>,
    ) -> Self {
        Self {
            packet,
            payload: Some(payload),
            replace_id,
            callback,
        }
    }
}

/// Per-device FIFO with replace-by-id collapsing
#[derive(Default)]
pub struct PacketQueue {
    items: Mutex<VecDeque<QueuedPacket>>,
    notify: Notify,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet.
    ///
    /// A non-negative replace id first removes any unsent packet with the
    /// same id; the superseded packet is discarded without invoking its
    /// callbacks. Negative ids never collapse.
    pub fn enqueue(&self, item: QueuedPacket) {
        {
            let mut items = self.items.lock().expect("queue lock poisoned");
            if item.replace_id >= 0 {
                let before = items.len();
                items.retain(|queued| queued.replace_id != item.replace_id);
                if items.len() != before {
                    trace!(replace_id = item.replace_id, "collapsed superseded packet");
                }
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Atomically remove and return a still-unsent packet with this replace
    /// id. Empty if it was already sent or never queued.
    pub fn get_and_remove_unsent(&self, replace_id: i64) -> Option<QueuedPacket> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        let pos = items
            .iter()
            .position(|queued| queued.replace_id == replace_id)?;
        items.remove(pos)
    }

    /// Wait for and dequeue the next packet. Once returned, the packet
    /// counts as sent for collapsing purposes.
    pub async fn next(&self) -> QueuedPacket {
        loop {
            if let Some(item) = self
                .items
                .lock()
                .expect("queue lock poisoned")
                .pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Drain every remaining packet (link teardown); the caller fails them
    pub fn drain(&self) -> Vec<QueuedPacket> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
