//! Per-device client context
//!
//! One [`ClientContext`] exists per logical device connection. It is built
//! once at startup, shared by reference between the publisher, the
//! reconnection controller and the health monitor, and torn down once with
//! [`ClientContext::shutdown`].
//!
//! All link state sits behind a single mutex. Critical sections only swap
//! handles and counters; sessions are always closed after the guard drops.

use crate::observability::stats::{StatsAggregator, StatsSnapshot};
use crate::transport::{Credential, Handshake, Session, TransportKind};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Connection state for the device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Device identity presented in every handshake
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub credential: Credential,
}

impl DeviceIdentity {
    pub fn new<S: Into<String>>(device_id: S, credential: Credential) -> Self {
        Self {
            device_id: device_id.into(),
            credential,
        }
    }
}

struct Link {
    state: ConnectionState,
    transport: Option<TransportKind>,
    session: Option<Arc<dyn Session>>,
    resumption_token: Option<Vec<u8>>,
    reconnect_attempts: u32,
}

/// Shared state of one device connection
pub struct ClientContext {
    identity: DeviceIdentity,
    keep_alive_secs: u16,
    link: Mutex<Link>,
    stats: Arc<StatsAggregator>,
}

impl ClientContext {
    pub fn new(identity: DeviceIdentity, keep_alive_secs: u16, stats: Arc<StatsAggregator>) -> Self {
        Self {
            identity,
            keep_alive_secs,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                transport: None,
                session: None,
                resumption_token: None,
                reconnect_attempts: 0,
            }),
            stats,
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    /// Transport of the current (or most recent) session
    pub fn transport(&self) -> Option<TransportKind> {
        self.link().transport
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Build the identity handshake; `resumption_token` is only passed for
    /// the primary transport
    pub fn handshake(&self, resumption_token: Option<Vec<u8>>) -> Handshake {
        Handshake {
            client_id: self.identity.device_id.clone(),
            username: self.identity.device_id.clone(),
            credential: self.identity.credential.clone(),
            keep_alive_secs: self.keep_alive_secs,
            clean_session: resumption_token.is_none(),
            resumption_token,
        }
    }

    /// Current session handle, only while connected
    pub fn session(&self) -> Result<(Arc<dyn Session>, TransportKind), ConnectionState> {
        let link = self.link();
        match (&link.session, link.transport, link.state) {
            (Some(session), Some(kind), ConnectionState::Connected) => Ok((session.clone(), kind)),
            (_, _, state) => Err(state),
        }
    }

    /// Disconnected -> Connecting. Reconnecting is left untouched so the
    /// controller's transition stays visible.
    pub fn begin_connecting(&self) {
        let mut link = self.link();
        if link.state == ConnectionState::Disconnected {
            link.state = ConnectionState::Connecting;
        }
    }

    pub fn mark_reconnecting(&self, attempt: u32) {
        let mut link = self.link();
        link.state = ConnectionState::Reconnecting;
        drop(link);
        info!(attempt, state = %ConnectionState::Reconnecting, "Link state changed");
    }

    /// Install a freshly established session and return the one it replaces
    pub fn install_session(
        &self,
        kind: TransportKind,
        session: Box<dyn Session>,
    ) -> Option<Arc<dyn Session>> {
        let mut link = self.link();
        let previous = link.session.replace(Arc::from(session));
        let from = link.state;
        link.state = ConnectionState::Connected;
        link.transport = Some(kind);
        drop(link);
        info!(transport = %kind, from = %from, state = %ConnectionState::Connected, "Link state changed");
        previous
    }

    /// Drop the session reference and move to Disconnected
    pub fn mark_disconnected(&self) -> Option<Arc<dyn Session>> {
        let mut link = self.link();
        let previous = link.session.take();
        let from = link.state;
        link.state = ConnectionState::Disconnected;
        let transport = link.transport;
        drop(link);
        if from != ConnectionState::Disconnected {
            info!(transport = ?transport, from = %from, state = %ConnectionState::Disconnected, "Link state changed");
        }
        previous
    }

    /// Connected -> Disconnected when the session reports link loss.
    /// Returns the dead session so the caller can close it outside the lock.
    pub fn detect_link_loss(&self) -> Option<Arc<dyn Session>> {
        let mut link = self.link();
        let lost = link.state == ConnectionState::Connected
            && link.session.as_ref().map_or(true, |session| !session.is_open());
        if !lost {
            return None;
        }
        let dead = link.session.take();
        link.state = ConnectionState::Disconnected;
        let transport = link.transport;
        drop(link);
        warn!(transport = ?transport, state = %ConnectionState::Disconnected, "Link loss detected");
        dead
    }

    pub fn resumption_token(&self) -> Option<Vec<u8>> {
        self.link().resumption_token.clone()
    }

    pub fn set_resumption_token(&self, token: Vec<u8>) {
        self.link().resumption_token = Some(token);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.link().reconnect_attempts
    }

    /// Returns the new attempt count
    pub fn increment_reconnect_attempts(&self) -> u32 {
        let mut link = self.link();
        link.reconnect_attempts = link.reconnect_attempts.saturating_add(1);
        link.reconnect_attempts
    }

    pub fn reset_reconnect_attempts(&self) {
        self.link().reconnect_attempts = 0;
    }

    /// Observability snapshot combining link state and statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        let (state, transport) = {
            let link = self.link();
            (link.state, link.transport)
        };
        StatsSnapshot::build(&self.stats.snapshot(), state, transport)
    }

    /// Release the session and the resumption token bytes
    pub async fn shutdown(&self) {
        let session = {
            let mut link = self.link();
            link.resumption_token = None;
            link.session.take()
        };
        self.mark_disconnected();
        if let Some(session) = session {
            session.close().await;
        }
        info!(device_id = %self.identity.device_id, "Client context shut down");
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link();
        f.debug_struct("ClientContext")
            .field("device_id", &self.identity.device_id)
            .field("state", &link.state)
            .field("transport", &link.transport)
            .field("reconnect_attempts", &link.reconnect_attempts)
            .finish_non_exhaustive()
    }
}
