//! Primary transport: MQTT over QUIC
//!
//! A bidirectional control stream carries CONNECT, CONNACK, PINGREQ and
//! DISCONNECT. Every PUBLISH goes out on its own unidirectional stream, so
//! concurrent publishes never queue behind one another. Packets are encoded
//! with `rumqttc`'s packet types; only the four-byte CONNACK is inspected
//! here. TLS 1.3 session tickets are kept by the shared rustls
//! client config, so a reconnect that presents a resumption token can be
//! attempted as 0-RTT.

use super::{
    BrokerEndpoint, Connector, Established, Handshake, HandshakeError, PublishFrame, Qos,
    SendError, Session, TransportKind,
};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::BytesMut;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::rustls;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// ALPN identifier for MQTT over QUIC
pub const ALPN_MQTT: &[u8] = b"mqtt";

const CONNACK_LEN: usize = 4;
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// Ticket handed back as the resumption token. The core treats it as
/// opaque bytes; it only tells a later handshake that resuming is worth
/// trying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResumptionTicket {
    client_id: String,
    broker: String,
    session_present: bool,
    issued_at: chrono::DateTime<chrono::Utc>,
}

/// Build the rustls/quinn client configuration from a PEM CA chain
pub fn client_config(ca_pem: &[u8]) -> Result<quinn::ClientConfig, ClientError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert =
            cert.map_err(|e| ClientError::transport_setup(format!("read CA chain: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ClientError::transport_setup(format!("add CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(ClientError::transport_setup(
            "CA chain contains no certificates",
        ));
    }

    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ClientError::transport_setup(format!("TLS 1.3 unavailable: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN_MQTT.to_vec()];
    tls.enable_early_data = true;

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| ClientError::transport_setup(format!("rustls to quinn: {e}")))?;

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(15)));

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Opens MQTT sessions over QUIC
pub struct QuicConnector {
    endpoint: BrokerEndpoint,
    config: quinn::ClientConfig,
    bind: SocketAddr,
}

impl QuicConnector {
    pub fn new(endpoint: BrokerEndpoint, config: quinn::ClientConfig) -> Self {
        Self {
            endpoint,
            config,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    /// Build from a PEM CA chain file
    pub fn from_ca_file(endpoint: BrokerEndpoint, ca_path: &Path) -> Result<Self, ClientError> {
        let pem = std::fs::read(ca_path).map_err(|e| {
            ClientError::transport_setup(format!("read {}: {e}", ca_path.display()))
        })?;
        Ok(Self::new(endpoint, client_config(&pem)?))
    }

    async fn resolve(&self) -> Result<SocketAddr, HandshakeError> {
        tokio::net::lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map_err(|e| unreachable(format!("resolve {}: {e}", self.endpoint)))?
            .next()
            .ok_or_else(|| unreachable(format!("{} resolved to no address", self.endpoint)))
    }

    async fn establish(
        &self,
        endpoint: &quinn::Endpoint,
        addr: SocketAddr,
        resume: bool,
    ) -> Result<quinn::Connection, HandshakeError> {
        let connecting = endpoint
            .connect(addr, &self.endpoint.host)
            .map_err(|e| unreachable(format!("connect: {e}")))?;

        if !resume {
            return connecting
                .await
                .map_err(|e| unreachable(format!("QUIC handshake: {e}")));
        }

        match connecting.into_0rtt() {
            Ok((connection, accepted)) => {
                let accepted = accepted.await;
                debug!(accepted, "0-RTT handshake finished");
                Ok(connection)
            }
            Err(connecting) => {
                debug!("No cached session ticket, full handshake");
                connecting
                    .await
                    .map_err(|e| unreachable(format!("QUIC handshake: {e}")))
            }
        }
    }
}

#[async_trait]
impl Connector for QuicConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn open(&self, handshake: &Handshake) -> Result<Established, HandshakeError> {
        let addr = self.resolve().await?;

        let mut endpoint = quinn::Endpoint::client(self.bind)
            .map_err(|e| unreachable(format!("bind UDP socket: {e}")))?;
        endpoint.set_default_client_config(self.config.clone());

        let resume = handshake.resumption_token.is_some();
        let connection = self.establish(&endpoint, addr, resume).await?;

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| unreachable(format!("open stream: {e}")))?;

        let connect = encode_connect(handshake).map_err(unreachable)?;
        send.write_all(&connect)
            .await
            .map_err(|e| unreachable(format!("send CONNECT: {e}")))?;

        let mut connack = [0u8; CONNACK_LEN];
        recv.read_exact(&mut connack)
            .await
            .map_err(|e| unreachable(format!("read CONNACK: {e}")))?;
        let session_present = match parse_connack(&connack) {
            Ok(session_present) => session_present,
            Err(e) => {
                connection.close(0u32.into(), b"connect refused");
                return Err(e);
            }
        };

        info!(
            broker = %self.endpoint,
            resumed = resume,
            session_present,
            "QUIC session established"
        );

        let ticket = ResumptionTicket {
            client_id: handshake.client_id.clone(),
            broker: self.endpoint.to_string(),
            session_present,
            issued_at: chrono::Utc::now(),
        };
        let resumption_token = serde_json::to_vec(&ticket)
            .map_err(|e| warn!(error = %e, "Could not encode resumption ticket"))
            .ok();

        let session = QuicSession::start(endpoint, connection, send, recv, handshake.keep_alive_secs);
        Ok(Established {
            session: Box::new(session),
            resumption_token,
        })
    }
}

fn unreachable<S: Into<String>>(reason: S) -> HandshakeError {
    HandshakeError::Unreachable(reason.into())
}

fn encode_connect(handshake: &Handshake) -> Result<BytesMut, String> {
    let mut connect = rumqttc::Connect::new(handshake.client_id.as_str());
    connect.keep_alive = handshake.keep_alive_secs;
    connect.clean_session = handshake.clean_session;
    connect.set_login(handshake.username.as_str(), handshake.credential.expose());

    let mut buf = BytesMut::new();
    connect
        .write(&mut buf)
        .map_err(|e| format!("encode CONNECT: {e}"))?;
    Ok(buf)
}

/// Returns the session-present flag, or the broker's refusal
fn parse_connack(bytes: &[u8; CONNACK_LEN]) -> Result<bool, HandshakeError> {
    if bytes[0] != 0x20 || bytes[1] != 0x02 {
        return Err(unreachable(format!(
            "expected CONNACK, got header {:#04x} {:#04x}",
            bytes[0], bytes[1]
        )));
    }
    match bytes[3] {
        0 => Ok(bytes[2] & 0x01 == 0x01),
        code => Err(HandshakeError::Rejected { code }),
    }
}

/// Packet ids for QoS 1/2 publishes, never zero
#[derive(Debug)]
struct PacketIds(AtomicU16);

impl PacketIds {
    fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    fn next(&self) -> u16 {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(id.checked_add(1).unwrap_or(1))
            })
            .unwrap_or(0);
        previous.checked_add(1).unwrap_or(1)
    }
}

struct QuicSession {
    connection: quinn::Connection,
    _endpoint: quinn::Endpoint,
    control: Arc<Mutex<quinn::SendStream>>,
    packet_ids: PacketIds,
    closed: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl QuicSession {
    fn start(
        endpoint: quinn::Endpoint,
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        keep_alive_secs: u16,
    ) -> Self {
        let control = Arc::new(Mutex::new(send));
        let mut tasks = vec![tokio::spawn(drain_inbound(recv))];
        if keep_alive_secs > 0 {
            tasks.push(tokio::spawn(ping_loop(
                Arc::clone(&control),
                Duration::from_secs(u64::from(keep_alive_secs)),
            )));
        }
        Self {
            connection,
            _endpoint: endpoint,
            control,
            packet_ids: PacketIds::new(),
            closed: AtomicBool::new(false),
            tasks,
        }
    }
}

/// Broker acks and PINGRESPs are read and dropped
async fn drain_inbound(mut recv: quinn::RecvStream) {
    let mut buf = vec![0u8; 4096];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => debug!(bytes = n, "Inbound frames from broker"),
            Ok(None) => {
                debug!("Broker finished the stream");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Inbound stream ended");
                break;
            }
        }
    }
}

async fn ping_loop(send: Arc<Mutex<quinn::SendStream>>, period: Duration) {
    let mut ping = BytesMut::new();
    if let Err(e) = rumqttc::PingReq.write(&mut ping) {
        warn!(error = %e, "Could not encode PINGREQ, keep-alive disabled");
        return;
    }

    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = send.lock().await.write_all(&ping).await {
            debug!(error = %e, "Keep-alive stopped");
            break;
        }
    }
}

#[async_trait]
impl Session for QuicSession {
    async fn publish(&self, frame: &PublishFrame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        let mut packet =
            rumqttc::Publish::new(frame.topic.as_str(), frame.qos.into(), frame.payload.to_vec());
        if frame.qos != Qos::AtMostOnce {
            packet.pkid = self.packet_ids.next();
        }

        let mut buf = BytesMut::new();
        packet
            .write(&mut buf)
            .map_err(|e| SendError::Encode(e.to_string()))?;

        let mut stream = self
            .connection
            .open_uni()
            .await
            .map_err(|e| SendError::Io(format!("open publish stream: {e}")))?;
        stream
            .write_all(&buf)
            .await
            .map_err(|e| SendError::Io(e.to_string()))?;
        stream
            .finish()
            .map_err(|e| SendError::Io(format!("finish publish stream: {e}")))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.close_reason().is_none()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut send = self.control.lock().await;
            let _ = send.write_all(&DISCONNECT).await;
            let _ = send.finish();
        }
        self.connection.close(0u32.into(), b"client shutdown");
        debug!("QUIC session closed");
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.connection.close(0u32.into(), b"session dropped");
    }
}
