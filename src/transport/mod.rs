//! Transport seams for the broker connection
//!
//! The core never speaks a wire protocol itself. A [`Connector`] opens a
//! secure session over one transport and performs the identity handshake; the
//! returned [`Session`] sends publish frames until it is dropped or closed.
//! The two concrete connectors live in [`quic`] (primary, datagram based) and
//! [`tls`] (secondary, stream based); [`selector`] decides between them.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

pub mod quic;
pub mod selector;
pub mod tls;

pub use selector::{SelectorConfig, TransportSelector};

/// Which transport backs the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Low-latency datagram transport (QUIC)
    Primary,
    /// Stream transport fallback (TCP+TLS)
    Secondary,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Primary => write!(f, "primary"),
            TransportKind::Secondary => write!(f, "secondary"),
        }
    }
}

/// Delivery guarantee level, passed verbatim to the protocol library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> rumqttc::QoS {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Password-equivalent secret. Opaque to the core and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for connectors only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Broker address for one transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `scheme://host[:port]`, using `default_port` when none is given
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid endpoint URL '{raw}': {e}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| format!("endpoint URL '{raw}' has no host"))?;
        Ok(Self::new(host, url.port().unwrap_or(default_port)))
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity handshake sent as the first frame of every session
#[derive(Debug, Clone)]
pub struct Handshake {
    pub client_id: String,
    pub username: String,
    pub credential: Credential,
    pub keep_alive_secs: u16,
    /// `false` asks the broker to resume the previous session
    pub clean_session: bool,
    /// Opaque token from an earlier primary handshake
    pub resumption_token: Option<Vec<u8>>,
}

/// One publish frame
#[derive(Debug, Clone)]
pub struct PublishFrame {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

/// Outcome of a successful handshake
pub struct Established {
    pub session: Box<dyn Session>,
    /// Token for an abbreviated handshake next time (primary only)
    pub resumption_token: Option<Vec<u8>>,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("resumption_token", &self.resumption_token.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Explicit negative acknowledgment. Not transport specific.
    #[error("handshake rejected with code {code}")]
    Rejected { code: u8 },

    /// Connection-level failure without an explicit answer
    #[error("transport unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("session closed")]
    Closed,

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("transport write failed: {0}")]
    Io(String),
}

/// Opens sessions over one transport
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &BrokerEndpoint;

    /// Open the secure session and perform the identity handshake.
    ///
    /// No timeout is applied here. Dropping the returned future releases
    /// every partially acquired resource.
    async fn open(&self, handshake: &Handshake) -> Result<Established, HandshakeError>;
}

/// An established broker session
#[async_trait]
pub trait Session: Send + Sync {
    /// Send one frame; resolves on local send confirmation
    async fn publish(&self, frame: &PublishFrame) -> Result<(), SendError>;

    /// Link-loss check
    fn is_open(&self) -> bool;

    /// Graceful release. Dropping the session also releases it.
    async fn close(&self);
}
