//! Payload side-channel
//!
//! Bulk binary payloads never travel on the JSON control channel. The
//! sender binds an ephemeral TCP listener in the payload port range and
//! advertises the port in the control packet's `payloadTransferInfo`; the
//! receiver dials back, the connection is upgraded to TLS (sender as
//! server, dialing receiver as client, pinned to the already-authenticated
//! device certificate), and the bytes are streamed over it. The listener
//! accepts exactly one connection and is torn down when the transfer ends,
//! on every exit path.

use crate::crypto::certificate::CertificateInfo;
use crate::crypto::tls;
use crate::error::{LinkError, Result};
use crate::network::queue::SendCallback;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Streaming source for an outbound payload
pub struct PayloadSource {
    /// The bytes to stream
    pub reader: Box<dyn AsyncRead + Send + Unpin>,

    /// Total size in bytes, [`PAYLOAD_SIZE_UNKNOWN`](crate::protocol::PAYLOAD_SIZE_UNKNOWN)
    /// if not known up front
    pub size: i64,
}

impl PayloadSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, size: i64) -> Self {
        Self {
            reader: Box::new(reader),
            size,
        }
    }

    /// Convenience constructor for in-memory payloads
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as i64;
        Self::new(std::io::Cursor::new(bytes), size)
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSource")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Incoming payload stream attached to a received packet
pub struct InboundPayload {
    /// TLS stream positioned at the first payload byte; read `size` bytes
    pub stream: Box<dyn AsyncRead + Send + Unpin>,

    /// Announced size in bytes, -1 if the sender did not know it
    pub size: i64,
}

impl InboundPayload {
    /// Read the entire payload into memory. Only sensible for payloads with
    /// a known, small size.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        if self.size >= 0 {
            let mut limited = self.stream.take(self.size as u64);
            limited.read_to_end(&mut bytes).await?;
        } else {
            self.stream.read_to_end(&mut bytes).await?;
        }
        Ok(bytes)
    }
}

impl fmt::Debug for InboundPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundPayload")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Stream an outbound payload to the peer (sender side).
///
/// Waits up to `accept_timeout` for the peer to dial the advertised port,
/// upgrades the connection to TLS as the server, then copies the source to
/// the socket. Progress is reported at most once per `progress_interval`
/// and cancellation is checked before every read/write iteration. The
/// listener and the source stream are dropped on every exit path.
pub(crate) async fn serve_payload(
    listener: TcpListener,
    local_cert: &CertificateInfo,
    peer_cert: &[u8],
    mut source: PayloadSource,
    callback: Arc<dyn SendCallback>,
    accept_timeout: Duration,
    progress_interval: Duration,
) -> Result<u64> {
    let (tcp, peer_addr) = timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| LinkError::Timeout)??;
    // one connection per transfer; stop listening immediately
    drop(listener);

    debug!(peer = %peer_addr, size = source.size, "payload connection accepted");

    let config = tls::server_config(local_cert, Some(peer_cert))?;
    let mut stream = tls::upgrade_server(tcp, config, accept_timeout).await?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut sent: u64 = 0;
    let mut last_progress = Instant::now();

    loop {
        if callback.is_cancelled() {
            debug!(peer = %peer_addr, sent, "payload transfer cancelled");
            return Err(LinkError::PayloadCancelled);
        }
        let n = source.reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;

        if last_progress.elapsed() >= progress_interval {
            callback.on_progress(sent, source.size);
            last_progress = Instant::now();
        }
    }

    stream.flush().await?;
    stream.shutdown().await?;
    callback.on_progress(sent, source.size);

    debug!(peer = %peer_addr, sent, "payload transfer complete");
    Ok(sent)
}

/// Dial back to a sender's advertised payload port (receiver side).
///
/// The connection is upgraded to TLS as the client, pinned to the device
/// certificate learned during the link handshake.
pub(crate) async fn fetch_payload(
    addr: SocketAddr,
    local_cert: &CertificateInfo,
    peer_cert: &[u8],
    size: i64,
    connect_timeout: Duration,
) -> Result<InboundPayload> {
    let tcp = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| LinkError::Timeout)?
        .map_err(|e| {
            warn!(addr = %addr, error = %e, "payload dial-back failed");
            LinkError::payload(format!("failed to connect to payload port: {}", e))
        })?;

    let config = tls::client_config(local_cert, Some(peer_cert))?;
    let stream = tls::upgrade_client(tcp, addr.ip(), config, connect_timeout).await?;

    debug!(addr = %addr, size, "payload stream attached");
    Ok(InboundPayload {
        stream: Box::new(stream),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::queue::NoopCallback;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct CountingCallback {
        progress_calls: AtomicU64,
        cancelled: AtomicBool,
    }

    impl CountingCallback {
        fn new() -> Self {
            Self {
                progress_calls: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
            }
        }
    }

    impl SendCallback for CountingCallback {
        fn on_progress(&self, _sent: u64, _total: i64) {
            self.progress_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_payload_round_trip_exact_bytes() {
        let sender_cert = CertificateInfo::generate("dev_sender").unwrap();
        let receiver_cert = CertificateInfo::generate("dev_receiver").unwrap();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let size = data.len() as i64;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver_der = receiver_cert.certificate.clone();
        let sender_task = {
            let sender_cert = sender_cert.clone();
            tokio::spawn(async move {
                serve_payload(
                    listener,
                    &sender_cert,
                    &receiver_der,
                    PayloadSource::from_bytes(data),
                    Arc::new(CountingCallback::new()),
                    Duration::from_secs(5),
                    Duration::from_millis(500),
                )
                .await
            })
        };

        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let payload = fetch_payload(
            addr,
            &receiver_cert,
            &sender_cert.certificate,
            size,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let received = payload.read_to_end().await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        let sent = sender_task.await.unwrap().unwrap();
        assert_eq!(sent, size as u64);
    }

    #[tokio::test]
    async fn test_accept_timeout_when_peer_never_dials() {
        let cert = CertificateInfo::generate("dev_lonely").unwrap();
        let peer = CertificateInfo::generate("dev_ghost").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = serve_payload(
            listener,
            &cert,
            &peer.certificate,
            PayloadSource::from_bytes(vec![1, 2, 3]),
            Arc::new(NoopCallback),
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
        .await;

        assert!(matches!(result, Err(LinkError::Timeout)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_write() {
        let sender_cert = CertificateInfo::generate("dev_sender").unwrap();
        let receiver_cert = CertificateInfo::generate("dev_receiver").unwrap();

        let callback = Arc::new(CountingCallback::new());
        callback.cancelled.store(true, Ordering::SeqCst);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver_der = receiver_cert.certificate.clone();
        let cb = callback.clone();
        let sender_cert2 = sender_cert.clone();
        let sender_task = tokio::spawn(async move {
            serve_payload(
                listener,
                &sender_cert2,
                &receiver_der,
                PayloadSource::from_bytes(vec![0u8; 4096]),
                cb,
                Duration::from_secs(5),
                Duration::from_millis(500),
            )
            .await
        });

        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let _payload = fetch_payload(
            addr,
            &receiver_cert,
            &sender_cert.certificate,
            4096,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let result = sender_task.await.unwrap();
        assert!(matches!(result, Err(LinkError::PayloadCancelled)));
    }
}
