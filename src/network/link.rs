//! Link
//!
//! A `Link` is the durable addressable channel to one device. The
//! authenticated socket underneath it is replaceable: when the peer
//! reconnects, the negotiator calls [`Link::reset`] with the new socket and
//! every holder of the `Arc<Link>` keeps working without noticing. A
//! generation counter on the socket slot resolves the race between a dying
//! socket and an arriving replacement: connection-lost is only reported if
//! the generation is still current after the grace window.

use crate::error::{LinkError, Result};
use crate::network::events::{LinkDirection, LinkEvent};
use crate::network::payload::{self, PayloadSource};
use crate::network::provider::LinkHub;
use crate::network::queue::{PacketQueue, QueuedPacket, SendCallback};
use crate::network::bind_first_free;
use crate::protocol::identity::DeviceIdentity;
use crate::protocol::packet::{read_packet_line, Packet, PAYLOAD_SIZE_UNKNOWN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

struct SocketSlot {
    writer: WriteHalf<TlsStream<TcpStream>>,
    peer_addr: SocketAddr,
    generation: u64,
    reader_task: Option<JoinHandle<()>>,
}

/// The stable per-device handle over a (possibly replaced) authenticated
/// socket
pub struct Link {
    device_id: String,
    hub: Arc<LinkHub>,
    identity: StdMutex<DeviceIdentity>,
    direction: StdMutex<LinkDirection>,
    peer_cert: StdMutex<Vec<u8>>,
    slot: Mutex<Option<SocketSlot>>,
    generation: AtomicU64,
    queue: PacketQueue,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Create the link and start its queue drain worker. The socket is
    /// attached separately via [`Link::reset`].
    pub(crate) fn spawn(
        hub: Arc<LinkHub>,
        identity: DeviceIdentity,
        direction: LinkDirection,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            device_id: identity.device_id.clone(),
            hub,
            identity: StdMutex::new(identity),
            direction: StdMutex::new(direction),
            peer_cert: StdMutex::new(Vec::new()),
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
            queue: PacketQueue::new(),
            worker: StdMutex::new(None),
        });
        let worker = tokio::spawn(Self::worker_loop(link.clone()));
        *link.worker.lock().expect("worker lock poisoned") = Some(worker);
        link
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The identity bound at the most recent handshake
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.lock().expect("identity lock poisoned").clone()
    }

    /// Direction of the most recent handshake
    pub fn direction(&self) -> LinkDirection {
        *self.direction.lock().expect("direction lock poisoned")
    }

    /// Whether a socket is currently attached
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Atomically swap in a freshly authenticated socket.
    ///
    /// The previous socket (if any) is closed, terminating its receive
    /// loop, and a new receive loop starts on the replacement. Returns
    /// whether a previous socket was replaced.
    pub(crate) async fn reset(
        self: Arc<Self>,
        stream: TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        identity: DeviceIdentity,
        direction: LinkDirection,
        peer_cert: Vec<u8>,
    ) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = tokio::io::split(stream);

        *self.identity.lock().expect("identity lock poisoned") = identity;
        *self.direction.lock().expect("direction lock poisoned") = direction;
        *self.peer_cert.lock().expect("peer cert lock poisoned") = peer_cert;

        let old = {
            let mut slot = self.slot.lock().await;
            slot.replace(SocketSlot {
                writer: write_half,
                peer_addr,
                generation,
                reader_task: None,
            })
        };

        let replaced = old.is_some();
        if let Some(mut old) = old {
            debug!(
                device_id = %self.device_id,
                old_generation = old.generation,
                "replacing active socket"
            );
            if let Some(task) = old.reader_task.take() {
                task.abort();
            }
            let _ = old.writer.shutdown().await;
        }

        let task = tokio::spawn(Self::receive_loop(
            self.clone(),
            read_half,
            generation,
            peer_addr,
        ));
        {
            let mut slot = self.slot.lock().await;
            match slot.as_mut() {
                // a racing newer reset may already have superseded us
                Some(current) if current.generation == generation => {
                    current.reader_task = Some(task);
                }
                _ => task.abort(),
            }
        }

        replaced
    }

    /// Enqueue a packet for transmission.
    ///
    /// A non-negative `replace_id` supersedes any unsent packet with the
    /// same id. The queue survives socket replacement; packets enqueued
    /// while disconnected are sent once a new socket arrives.
    pub fn enqueue(&self, packet: Packet, replace_id: i64, callback: Arc<dyn SendCallback>) {
        self.queue
            .enqueue(QueuedPacket::new(packet, replace_id, callback));
    }

    /// Enqueue a packet with an attached binary payload
    pub fn enqueue_with_payload(
        &self,
        packet: Packet,
        payload: PayloadSource,
        replace_id: i64,
        callback: Arc<dyn SendCallback>,
    ) {
        self.queue
            .enqueue(QueuedPacket::with_payload(packet, payload, replace_id, callback));
    }

    /// Remove a still-unsent packet, for cancellation
    pub fn cancel_unsent(&self, replace_id: i64) -> Option<QueuedPacket> {
        self.queue.get_and_remove_unsent(replace_id)
    }

    /// Send one packet now.
    ///
    /// Fails immediately when no socket is attached. With a payload: binds
    /// an ephemeral listener, stamps the packet's transfer info, writes the
    /// control line, then streams the payload to the peer when it dials
    /// back. `on_success` fires once the control line is written; payload
    /// failures after that are reported through `on_payload_failure` only.
    pub async fn send_packet(
        &self,
        mut packet: Packet,
        payload: Option<PayloadSource>,
        callback: Arc<dyn SendCallback>,
    ) -> Result<()> {
        let config = &self.hub.config;

        // the listener must exist before the control line advertises it
        let payload_setup = match payload {
            Some(source) => {
                let listener =
                    match bind_first_free(config.payload_port_start, config.payload_port_end).await
                    {
                        Ok(listener) => listener,
                        Err(e) => {
                            callback.on_failure(&e);
                            return Err(e);
                        }
                    };
                let port = match listener.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(e) => {
                        let e = LinkError::from(e);
                        callback.on_failure(&e);
                        return Err(e);
                    }
                };
                packet.set_payload_info(source.size, port);
                Some((listener, source))
            }
            None => None,
        };

        let line = match packet.to_bytes() {
            Ok(line) => line,
            Err(e) => {
                callback.on_failure(&e);
                return Err(e);
            }
        };

        {
            let mut slot = self.slot.lock().await;
            let Some(slot) = slot.as_mut() else {
                let e = LinkError::not_connected(format!(
                    "no socket attached for {}",
                    self.device_id
                ));
                callback.on_failure(&e);
                return Err(e);
            };
            let written = async {
                slot.writer.write_all(&line).await?;
                slot.writer.flush().await
            }
            .await;
            if let Err(e) = written {
                let e = LinkError::from(e);
                warn!(device_id = %self.device_id, error = %e, "control write failed");
                callback.on_failure(&e);
                return Err(e);
            }
        }

        debug!(
            device_id = %self.device_id,
            packet_type = %packet.packet_type,
            "packet sent"
        );
        callback.on_success();

        if let Some((listener, source)) = payload_setup {
            let peer_cert = self
                .peer_cert
                .lock()
                .expect("peer cert lock poisoned")
                .clone();
            let served = payload::serve_payload(
                listener,
                &self.hub.certificate,
                &peer_cert,
                source,
                callback.clone(),
                config.payload_accept_timeout,
                config.progress_interval,
            )
            .await;
            match served {
                Ok(sent) => {
                    debug!(device_id = %self.device_id, sent, "payload streamed");
                }
                Err(e) => {
                    // not fatal to the link; the control packet already went out
                    warn!(device_id = %self.device_id, error = %e, "payload transfer failed");
                    callback.on_payload_failure(&e);
                }
            }
        }

        Ok(())
    }

    /// Explicit teardown: close the socket and report the link lost now
    pub async fn disconnect(&self) {
        let old = self.slot.lock().await.take();
        if let Some(mut old) = old {
            if let Some(task) = old.reader_task.take() {
                task.abort();
            }
            let _ = old.writer.shutdown().await;
        }
        self.hub
            .link_lost(&self.device_id, self.current_generation())
            .await;
    }

    /// Release everything owned by the link. Called by the provider when
    /// the link leaves the registry; remaining queued packets fail with
    /// NotConnected.
    pub(crate) async fn teardown(&self) {
        if let Some(worker) = self.worker.lock().expect("worker lock poisoned").take() {
            worker.abort();
        }
        let closed = LinkError::not_connected("link closed");
        for item in self.queue.drain() {
            item.callback.on_failure(&closed);
        }
        let old = self.slot.lock().await.take();
        if let Some(mut old) = old {
            let _ = old.writer.shutdown().await;
            // last: when called from the receive loop this aborts ourselves
            if let Some(task) = old.reader_task.take() {
                task.abort();
            }
        }
    }

    async fn worker_loop(link: Arc<Link>) {
        loop {
            let item = link.queue.next().await;
            let QueuedPacket {
                packet,
                payload,
                callback,
                ..
            } = item;
            if let Err(e) = link.send_packet(packet, payload, callback).await {
                debug!(device_id = %link.device_id, error = %e, "queued send failed");
            }
        }
    }

    async fn receive_loop(
        link: Arc<Link>,
        read_half: ReadHalf<TlsStream<TcpStream>>,
        generation: u64,
        peer_addr: SocketAddr,
    ) {
        let cap = link.hub.config.control_line_cap;
        let mut reader = BufReader::new(read_half);

        loop {
            match read_packet_line(&mut reader, cap).await {
                Ok(Some(line)) => match Packet::from_line(&line) {
                    Ok(packet) => link.deliver(packet, peer_addr).await,
                    Err(e) => {
                        // post-handshake lines may be garbage without
                        // poisoning the connection
                        warn!(device_id = %link.device_id, error = %e, "dropping malformed line");
                    }
                },
                Ok(None) => {
                    debug!(device_id = %link.device_id, "socket closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(device_id = %link.device_id, error = %e, "socket read failed");
                    break;
                }
            }
        }

        // give a racing reset a chance to install a replacement first
        tokio::time::sleep(link.hub.config.reset_grace).await;
        if link.current_generation() == generation {
            info!(device_id = %link.device_id, "no replacement socket arrived, link lost");
            link.hub.link_lost(&link.device_id, generation).await;
        }
    }

    async fn deliver(&self, packet: Packet, peer_addr: SocketAddr) {
        let payload = match &packet.payload_transfer_info {
            Some(info) => {
                let size = packet.payload_size.unwrap_or(PAYLOAD_SIZE_UNKNOWN);
                let peer_cert = self
                    .peer_cert
                    .lock()
                    .expect("peer cert lock poisoned")
                    .clone();
                let addr = SocketAddr::new(peer_addr.ip(), info.port);
                match payload::fetch_payload(
                    addr,
                    &self.hub.certificate,
                    &peer_cert,
                    size,
                    self.hub.config.payload_accept_timeout,
                )
                .await
                {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!(
                            device_id = %self.device_id,
                            error = %e,
                            "failed to attach payload stream"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let _ = self.hub.events.send(LinkEvent::PacketReceived {
            device_id: self.device_id.clone(),
            packet,
            payload,
        });
    }
}
