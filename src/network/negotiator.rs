//! Link negotiator
//!
//! Turns a raw socket plus an identity packet into an authenticated link.
//! Every attempt walks the same state machine:
//!
//! 1. **AwaitIdentity** — exactly one plaintext identity line; invalid or
//!    blank identities abort the connection. Attempts are rate limited per
//!    device id, independently of discovery's per-IP limiter.
//! 2. **DowngradeCheck** — a trusted peer announcing a lower protocol
//!    version than previously recorded is refused before any TLS starts.
//! 3. **TlsUpgrade** — the TCP acceptor runs the TLS server, the dialer
//!    runs the TLS client. Trusted peers must present their stored
//!    certificate; unknown peers get first-contact acceptance.
//! 4. **SecureIdentityExchange** (v8+) — identities are re-exchanged inside
//!    the encrypted channel; device id or protocol version changing since
//!    the plaintext announcement aborts the connection.
//! 5. **Established** — the peer certificate is bound to the identity and
//!    the link is created or reset.
//!
//! Each attempt runs on its own task so the accept loop keeps accepting
//! while TLS handshakes block.

use crate::error::{LinkError, Result};
use crate::network::events::LinkDirection;
use crate::network::provider::LinkHub;
use crate::protocol::identity::DeviceIdentity;
use crate::protocol::packet::{read_line_unbuffered, Packet};
use crate::protocol::SECURE_IDENTITY_MIN_VERSION;
use crate::crypto::tls;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

/// Handshake progression, one state per protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitIdentity,
    DowngradeCheck,
    TlsUpgrade,
    SecureIdentityExchange,
    Established,
}

/// Refuse a trusted peer that announces a lower protocol version than the
/// last one recorded for it. Runs before any TLS handshake.
pub(crate) fn check_downgrade(
    trusted: bool,
    last_version: Option<i32>,
    identity: &DeviceIdentity,
) -> Result<()> {
    if !trusted {
        return Ok(());
    }
    if let Some(last) = last_version {
        if identity.protocol_version < last {
            return Err(LinkError::ProtocolDowngrade(format!(
                "{} announced protocol {} but {} was previously recorded",
                identity.device_id, identity.protocol_version, last
            )));
        }
    }
    Ok(())
}

/// The identity re-sent inside TLS must agree with the plaintext
/// announcement on the fields an on-path attacker could have substituted.
pub(crate) fn verify_secure_identity(
    pre_tls: &DeviceIdentity,
    secure: &DeviceIdentity,
) -> Result<()> {
    if secure.device_id != pre_tls.device_id {
        return Err(LinkError::IdentityMismatch(format!(
            "device id changed across TLS: {} then {}",
            pre_tls.device_id, secure.device_id
        )));
    }
    if secure.protocol_version != pre_tls.protocol_version {
        return Err(LinkError::IdentityMismatch(format!(
            "protocol version changed across TLS: {} then {}",
            pre_tls.protocol_version, secure.protocol_version
        )));
    }
    Ok(())
}

pub(crate) struct Negotiator {
    hub: Arc<LinkHub>,
}

impl Negotiator {
    pub fn new(hub: Arc<LinkHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }

    /// Accept inbound connections forever, one handshake task each
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((tcp, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_inbound(tcp, addr).await {
                            if e.is_rate_limited() {
                                debug!(peer = %addr, "{}", e);
                            } else {
                                warn!(peer = %addr, error = %e, "inbound handshake aborted");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle one inbound connection (we accepted TCP, so we are the TLS
    /// server)
    pub async fn handle_inbound(&self, tcp: TcpStream, addr: SocketAddr) -> Result<()> {
        timeout(
            self.hub.config.handshake_timeout,
            self.inbound_handshake(tcp, addr),
        )
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    async fn inbound_handshake(&self, mut tcp: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut state = HandshakeState::AwaitIdentity;
        debug!(peer = %addr, state = ?state, "inbound connection");

        // the mandatory first packet; anything malformed aborts the
        // connection
        let line = read_line_unbuffered(&mut tcp, self.hub.config.identity_line_cap).await?;
        let packet = Packet::from_line(&line)?;
        let pre_identity = DeviceIdentity::from_packet(&packet)?;

        if pre_identity.device_id == self.hub.config.device_id {
            return Err(LinkError::handshake("connection carries our own device id"));
        }
        if !self
            .hub
            .handshake_throttle
            .admit(pre_identity.device_id.clone())
        {
            return Err(LinkError::RateLimited(format!(
                "duplicate handshake from {}",
                pre_identity.device_id
            )));
        }

        state = HandshakeState::DowngradeCheck;
        debug!(peer = %addr, device_id = %pre_identity.device_id, state = ?state, "identity accepted");
        let trusted_cert = self
            .hub
            .trust
            .certificate_for(&pre_identity.device_id)
            .await;
        let last_version = self
            .hub
            .trust
            .last_protocol_version(&pre_identity.device_id)
            .await;
        check_downgrade(trusted_cert.is_some(), last_version, &pre_identity)?;

        state = HandshakeState::TlsUpgrade;
        debug!(peer = %addr, state = ?state, trusted = trusted_cert.is_some(), "upgrading as TLS server");
        let config = tls::server_config(&self.hub.certificate, trusted_cert.as_deref())?;
        let stream = tls::upgrade_server(tcp, config, self.hub.config.handshake_timeout).await?;
        let peer_cert = tls::peer_certificate(&stream)
            .ok_or_else(|| LinkError::handshake("peer presented no certificate"))?;

        let (stream, identity) = self.exchange_secure_identity(stream, &pre_identity).await?;

        state = HandshakeState::Established;
        info!(
            peer = %addr,
            device_id = %identity.device_id,
            state = ?state,
            "inbound handshake complete"
        );
        self.finish(
            identity,
            stream,
            addr,
            LinkDirection::LocallyInitiated,
            peer_cert,
            trusted_cert.is_none(),
        )
        .await
    }

    /// Dial back to a device that announced itself (we initiate TCP, so we
    /// are the TLS client)
    pub async fn connect_to(&self, candidate: DeviceIdentity, addr: SocketAddr) -> Result<()> {
        timeout(
            self.hub.config.handshake_timeout,
            self.outbound_handshake(candidate, addr),
        )
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    async fn outbound_handshake(
        &self,
        candidate: DeviceIdentity,
        addr: SocketAddr,
    ) -> Result<()> {
        // AwaitIdentity is already satisfied: the candidate identity came
        // from the validated announcement
        if !self
            .hub
            .handshake_throttle
            .admit(candidate.device_id.clone())
        {
            return Err(LinkError::RateLimited(format!(
                "duplicate handshake to {}",
                candidate.device_id
            )));
        }

        let mut state = HandshakeState::DowngradeCheck;
        debug!(peer = %addr, device_id = %candidate.device_id, state = ?state, "dialing back");
        let trusted_cert = self.hub.trust.certificate_for(&candidate.device_id).await;
        let last_version = self
            .hub
            .trust
            .last_protocol_version(&candidate.device_id)
            .await;
        check_downgrade(trusted_cert.is_some(), last_version, &candidate)?;

        let mut tcp = TcpStream::connect(addr).await?;

        // our identity goes out in plaintext before the TLS upgrade
        let ours = self
            .hub
            .local_identity()
            .to_packet(self.hub.tcp_port())
            .to_bytes()?;
        tcp.write_all(&ours).await?;
        tcp.flush().await?;

        state = HandshakeState::TlsUpgrade;
        debug!(peer = %addr, state = ?state, trusted = trusted_cert.is_some(), "upgrading as TLS client");
        let config = tls::client_config(&self.hub.certificate, trusted_cert.as_deref())?;
        let stream =
            tls::upgrade_client(tcp, addr.ip(), config, self.hub.config.handshake_timeout).await?;
        let peer_cert = tls::peer_certificate(&stream)
            .ok_or_else(|| LinkError::handshake("peer presented no certificate"))?;

        let (stream, identity) = self.exchange_secure_identity(stream, &candidate).await?;

        state = HandshakeState::Established;
        info!(
            peer = %addr,
            device_id = %identity.device_id,
            state = ?state,
            "outbound handshake complete"
        );
        self.finish(
            identity,
            stream,
            addr,
            LinkDirection::RemotelyInitiated,
            peer_cert,
            trusted_cert.is_none(),
        )
        .await
    }

    /// v8+: re-exchange identities inside the encrypted channel. Both sides
    /// send first, then read, so neither blocks the other. For v7 peers the
    /// plaintext identity stands.
    async fn exchange_secure_identity(
        &self,
        mut stream: TlsStream<TcpStream>,
        pre_identity: &DeviceIdentity,
    ) -> Result<(TlsStream<TcpStream>, DeviceIdentity)> {
        if pre_identity.protocol_version < SECURE_IDENTITY_MIN_VERSION {
            return Ok((stream, pre_identity.clone()));
        }

        debug!(
            device_id = %pre_identity.device_id,
            state = ?HandshakeState::SecureIdentityExchange,
            "re-exchanging identity inside TLS"
        );

        let ours = self.hub.local_identity().to_packet(0).to_bytes()?;
        stream.write_all(&ours).await?;
        stream.flush().await?;

        let line =
            read_line_unbuffered(&mut stream, self.hub.config.identity_line_cap).await?;
        let packet = Packet::from_line(&line)?;
        let secure = DeviceIdentity::from_packet(&packet)?;
        verify_secure_identity(pre_identity, &secure)?;

        // the secure copy is authoritative from here on
        Ok((stream, secure))
    }

    async fn finish(
        &self,
        identity: DeviceIdentity,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        direction: LinkDirection,
        peer_cert: Vec<u8>,
        first_contact: bool,
    ) -> Result<()> {
        if first_contact {
            info!(
                device_id = %identity.device_id,
                "storing peer certificate on first use"
            );
            self.hub
                .trust
                .remember_certificate(&identity.device_id, &peer_cert)
                .await;
        }
        self.hub
            .trust
            .record_protocol_version(&identity.device_id, identity.protocol_version)
            .await;

        self.hub
            .clone()
            .establish(identity, stream, addr, direction, peer_cert)
            .await
    }
}
