//! End-to-end scenarios over loopback
//!
//! Two providers run in-process and talk over 127.0.0.1. Discovery
//! candidates are injected with `dial` instead of real UDP broadcasts so
//! the tests stay hermetic; everything from the plaintext identity line
//! through TLS, secure re-identification, registry updates, resets, and
//! payload side-channels is exercised for real.

use lanlink::network::NO_REPLACE;
use lanlink::{
    CertificateInfo, DeviceIdentity, DeviceType, LinkConfig, LinkError, LinkEvent, LinkProvider,
    MemoryTrustStore, NoopCallback, Packet, PayloadSource, SendCallback, TrustStore,
    PROTOCOL_VERSION,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn test_config(device_id: &str, name: &str, base_port: u16) -> LinkConfig {
    let mut config = LinkConfig::new(device_id, name, DeviceType::Desktop);
    // ephemeral discovery port: no cross-talk between concurrent tests
    config.discovery_port = 0;
    config.tcp_port_start = base_port;
    config.tcp_port_end = base_port + 20;
    config.payload_port_start = base_port + 21;
    config.payload_port_end = base_port + 48;
    config.throttle_cooldown = Duration::from_millis(50);
    config.reset_grace = Duration::from_millis(200);
    config
}

struct Endpoint {
    provider: LinkProvider,
    events: UnboundedReceiver<LinkEvent>,
    trust: Arc<MemoryTrustStore>,
    certificate: CertificateInfo,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn endpoint_with_config(device_id: &str, config: LinkConfig) -> Endpoint {
    init_tracing();
    let certificate = CertificateInfo::generate(device_id).unwrap();
    let trust = Arc::new(MemoryTrustStore::new());
    let (provider, events) =
        LinkProvider::new(config, certificate.clone(), trust.clone()).unwrap();
    provider.start().await.unwrap();
    Endpoint {
        provider,
        events,
        trust,
        certificate,
    }
}

async fn endpoint(device_id: &str, name: &str, base_port: u16) -> Endpoint {
    endpoint_with_config(device_id, test_config(device_id, name, base_port)).await
}

/// The discovery candidate another endpoint would learn from this
/// provider's UDP announcement
fn candidate_for(endpoint: &Endpoint) -> (DeviceIdentity, SocketAddr) {
    let identity = endpoint.provider.local_identity();
    let addr: SocketAddr = format!("127.0.0.1:{}", endpoint.provider.tcp_port())
        .parse()
        .unwrap();
    (identity, addr)
}

async fn expect_event(
    events: &mut UnboundedReceiver<LinkEvent>,
    what: &str,
    predicate: impl Fn(&LinkEvent) -> bool,
) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

#[derive(Default)]
struct RecordingCallback {
    success: AtomicBool,
    failure: AtomicBool,
    payload_failure: AtomicBool,
}

impl SendCallback for RecordingCallback {
    fn on_success(&self) {
        self.success.store(true, Ordering::SeqCst);
    }
    fn on_failure(&self, _error: &LinkError) {
        self.failure.store(true, Ordering::SeqCst);
    }
    fn on_payload_failure(&self, _error: &LinkError) {
        self.payload_failure.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn handshake_registers_links_on_both_sides() {
    let mut alice = endpoint("dev_alice", "Alice", 46000).await;
    let mut bob = endpoint("dev_bob", "Bob", 46100).await;

    // bob heard alice's announcement and dials back
    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();

    let accepted = expect_event(&mut bob.events, "bob sees alice", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_alice"
    })
    .await;
    if let LinkEvent::ConnectionAccepted { identity, .. } = accepted {
        assert_eq!(identity.device_name, "Alice");
        assert_eq!(identity.protocol_version, PROTOCOL_VERSION);
    }

    expect_event(&mut alice.events, "alice sees bob", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    assert_eq!(alice.provider.visible_devices(), vec!["dev_bob"]);
    assert_eq!(bob.provider.visible_devices(), vec!["dev_alice"]);
    assert!(alice.provider.link_for("dev_bob").is_some());
    assert!(bob.provider.link_for("dev_alice").is_some());

    // trust-on-first-use: both sides stored the real peer certificate
    assert_eq!(
        alice.trust.certificate_for("dev_bob").await,
        Some(bob.certificate.certificate.clone())
    );
    assert_eq!(
        bob.trust.certificate_for("dev_alice").await,
        Some(alice.certificate.certificate.clone())
    );

    alice.provider.stop().await;
    bob.provider.stop().await;
}

#[tokio::test]
async fn packet_flows_over_established_link() {
    let mut alice = endpoint("dev_alice", "Alice", 46200).await;
    let mut bob = endpoint("dev_bob", "Bob", 46300).await;

    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();
    expect_event(&mut alice.events, "alice sees bob", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    let callback = Arc::new(RecordingCallback::default());
    let link = bob.provider.link_for("dev_alice").unwrap();
    link.enqueue(
        Packet::new("lanlink.ping", json!({"message": "hello"})),
        NO_REPLACE,
        callback.clone(),
    );

    let received = expect_event(&mut alice.events, "ping delivery", |e| {
        matches!(e, LinkEvent::PacketReceived { packet, .. } if packet.is_type("lanlink.ping"))
    })
    .await;
    if let LinkEvent::PacketReceived { packet, payload, .. } = received {
        assert_eq!(
            packet.body.get("message").and_then(|v| v.as_str()),
            Some("hello")
        );
        assert!(payload.is_none());
    }

    assert!(callback.success.load(Ordering::SeqCst));
    assert!(!callback.failure.load(Ordering::SeqCst));

    alice.provider.stop().await;
    bob.provider.stop().await;
}

#[tokio::test]
async fn reconnect_resets_link_and_new_socket_carries_traffic() {
    let mut alice = endpoint("dev_alice", "Alice", 46400).await;
    let mut bob = endpoint("dev_bob", "Bob", 46500).await;

    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider
        .dial(alice_identity.clone(), alice_addr)
        .await
        .unwrap();
    expect_event(&mut alice.events, "first handshake", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    let link_before = bob.provider.link_for("dev_alice").unwrap();

    // the peer reconnects: same device, fresh socket
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();
    expect_event(&mut alice.events, "second handshake", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    // still exactly one link per device, and it is the same instance
    assert_eq!(bob.provider.visible_devices(), vec!["dev_alice"]);
    assert_eq!(alice.provider.visible_devices(), vec!["dev_bob"]);
    let link_after = bob.provider.link_for("dev_alice").unwrap();
    assert!(Arc::ptr_eq(&link_before, &link_after));

    // a packet enqueued through the pre-reset handle arrives on the new
    // socket
    link_before.enqueue(
        Packet::new("lanlink.ping", json!({"message": "after reset"})),
        NO_REPLACE,
        Arc::new(NoopCallback),
    );
    expect_event(&mut alice.events, "delivery after reset", |e| {
        matches!(e, LinkEvent::PacketReceived { packet, .. }
            if packet.body.get("message").and_then(|v| v.as_str()) == Some("after reset"))
    })
    .await;

    // the replaced sockets died silently: no connection-lost on either side
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(bob.provider.visible_devices(), vec!["dev_alice"]);
    assert_eq!(alice.provider.visible_devices(), vec!["dev_bob"]);

    alice.provider.stop().await;
    bob.provider.stop().await;
}

#[tokio::test]
async fn payload_delivered_byte_exact() {
    let mut alice = endpoint("dev_alice", "Alice", 46600).await;
    let mut bob = endpoint("dev_bob", "Bob", 46700).await;

    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();
    expect_event(&mut alice.events, "handshake", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 199) as u8).collect();
    let expected = data.clone();

    let callback = Arc::new(RecordingCallback::default());
    let link = bob.provider.link_for("dev_alice").unwrap();
    link.enqueue_with_payload(
        Packet::new("lanlink.share", json!({"filename": "blob.bin"})),
        PayloadSource::from_bytes(data),
        NO_REPLACE,
        callback.clone(),
    );

    let received = expect_event(&mut alice.events, "payload packet", |e| {
        matches!(e, LinkEvent::PacketReceived { packet, .. } if packet.is_type("lanlink.share"))
    })
    .await;

    let LinkEvent::PacketReceived { packet, payload, .. } = received else {
        unreachable!();
    };
    assert_eq!(packet.payload_size, Some(expected.len() as i64));
    let payload = payload.expect("payload stream attached");
    assert_eq!(payload.size, expected.len() as i64);

    let bytes = payload.read_to_end().await.unwrap();
    assert_eq!(bytes.len(), expected.len());
    assert_eq!(bytes, expected);

    assert!(callback.success.load(Ordering::SeqCst));
    assert!(!callback.payload_failure.load(Ordering::SeqCst));

    alice.provider.stop().await;
    bob.provider.stop().await;
}

#[tokio::test]
async fn downgrade_rejected_before_any_connection() {
    let bob = endpoint("dev_bob", "Bob", 46800).await;

    // alice is trusted at protocol 9; today she announces 8
    let alice_cert = CertificateInfo::generate("dev_alice").unwrap();
    bob.trust
        .preload("dev_alice", &alice_cert.certificate, PROTOCOL_VERSION + 1);

    let candidate = DeviceIdentity {
        device_id: "dev_alice".to_string(),
        device_name: "Alice".to_string(),
        device_type: DeviceType::Laptop,
        protocol_version: PROTOCOL_VERSION,
        incoming_capabilities: BTreeSet::new(),
        outgoing_capabilities: BTreeSet::new(),
    };

    // the target address is unreachable on purpose: rejection must happen
    // before any TCP dial, so no Io error can surface
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let result = bob.provider.dial(candidate, unreachable).await;
    assert!(matches!(result, Err(LinkError::ProtocolDowngrade(_))));

    bob.provider.stop().await;
}

#[tokio::test]
async fn explicit_disconnect_reports_loss_on_both_sides() {
    let mut alice = endpoint("dev_alice", "Alice", 46900).await;
    let mut bob = endpoint("dev_bob", "Bob", 47000).await;

    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();
    expect_event(&mut alice.events, "handshake", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    alice
        .provider
        .link_for("dev_bob")
        .unwrap()
        .disconnect()
        .await;

    expect_event(&mut alice.events, "local loss", |e| {
        e.is_connection_lost() && e.device_id() == "dev_bob"
    })
    .await;
    assert!(alice.provider.visible_devices().is_empty());

    // bob's socket died and no replacement arrives inside the grace window
    expect_event(&mut bob.events, "remote loss", |e| {
        e.is_connection_lost() && e.device_id() == "dev_alice"
    })
    .await;
    assert!(bob.provider.visible_devices().is_empty());

    alice.provider.stop().await;
    bob.provider.stop().await;
}

#[tokio::test]
async fn duplicate_dial_inside_cooldown_is_rate_limited() {
    let mut alice = endpoint("dev_alice", "Alice", 47100).await;

    // bob gets a long cool-down so the whole first handshake (TLS included)
    // finishes well inside the window
    let mut bob_config = test_config("dev_bob", "Bob", 47200);
    bob_config.throttle_cooldown = Duration::from_secs(3);
    let bob = endpoint_with_config("dev_bob", bob_config).await;

    let (alice_identity, alice_addr) = candidate_for(&alice);
    bob.provider
        .dial(alice_identity.clone(), alice_addr)
        .await
        .unwrap();
    expect_event(&mut alice.events, "handshake", |e| {
        e.is_connection_accepted() && e.device_id() == "dev_bob"
    })
    .await;

    // second attempt inside the cool-down trips bob's per-device limiter
    let result = bob.provider.dial(alice_identity.clone(), alice_addr).await;
    assert!(matches!(result, Err(LinkError::RateLimited(_))));

    // after the cool-down the same peer is admitted again
    tokio::time::sleep(Duration::from_millis(3100)).await;
    bob.provider.dial(alice_identity, alice_addr).await.unwrap();

    alice.provider.stop().await;
    bob.provider.stop().await;
}
