//! Secondary transport: MQTT over TCP+TLS via `rumqttc`
//!
//! `rumqttc` reconnects on its own whenever the event loop is polled after
//! an error. Reconnection is owned by this crate instead, so the driver task
//! stops polling at the first error and marks the session dead.

use super::{
    BrokerEndpoint, Connector, Established, Handshake, HandshakeError, PublishFrame, SendError,
    Session, TransportKind,
};
use crate::error::ClientError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet,
    TlsConfiguration, Transport,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request queue depth between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// Opens MQTT sessions over TCP+TLS
pub struct TlsConnector {
    endpoint: BrokerEndpoint,
    ca_pem: Vec<u8>,
}

impl TlsConnector {
    pub fn new(endpoint: BrokerEndpoint, ca_pem: Vec<u8>) -> Self {
        Self { endpoint, ca_pem }
    }

    /// Build from a PEM CA chain file
    pub fn from_ca_file(endpoint: BrokerEndpoint, ca_path: &Path) -> Result<Self, ClientError> {
        let pem = std::fs::read(ca_path).map_err(|e| {
            ClientError::transport_setup(format!("read {}: {e}", ca_path.display()))
        })?;
        Ok(Self::new(endpoint, pem))
    }

    fn options(&self, handshake: &Handshake) -> MqttOptions {
        let mut options = MqttOptions::new(
            handshake.client_id.as_str(),
            self.endpoint.host.as_str(),
            self.endpoint.port,
        );
        options.set_credentials(handshake.username.as_str(), handshake.credential.expose());
        options.set_keep_alive(Duration::from_secs(u64::from(handshake.keep_alive_secs.max(5))));
        // Stream sessions never resume
        options.set_clean_session(true);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: self.ca_pem.clone(),
            alpn: None,
            client_auth: None,
        }));
        options
    }
}

#[async_trait]
impl Connector for TlsConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Secondary
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn open(&self, handshake: &Handshake) -> Result<Established, HandshakeError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(handshake), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => match return_code(ack.code) {
                    0 => break,
                    code => return Err(HandshakeError::Rejected { code }),
                },
                Ok(event) => debug!(?event, "Event before CONNACK"),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(HandshakeError::Rejected {
                        code: return_code(code),
                    });
                }
                Err(e) => return Err(HandshakeError::Unreachable(e.to_string())),
            }
        }

        info!(broker = %self.endpoint, "TLS session established");

        let alive = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&alive)));
        Ok(Established {
            session: Box::new(TlsSession {
                client,
                alive,
                driver,
            }),
            resumption_token: None,
        })
    }
}

/// MQTT 3.1.1 CONNACK return code
fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

async fn drive(mut eventloop: EventLoop, alive: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the TLS session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "TLS session lost");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

struct TlsSession {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl Session for TlsSession {
    async fn publish(&self, frame: &PublishFrame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.client
            .publish(
                frame.topic.as_str(),
                frame.qos.into(),
                false,
                frame.payload.to_vec(),
            )
            .await
            .map_err(|e| SendError::Io(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.driver.is_finished()
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
