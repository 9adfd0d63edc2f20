//! Primary-first transport selection with bounded fallback
//!
//! Only a timeout or a connection-level failure on the primary transport
//! justifies falling back: a middlebox silently dropping datagrams looks the
//! same as packet loss. An explicit rejection ends the attempt immediately
//! because the same identity will be refused on any transport.

use super::{Connector, Established, Handshake, HandshakeError, TransportKind};
use crate::connection_span;
use crate::context::ClientContext;
use crate::error::ConnectError;
use crate::resumption::ResumptionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Per-transport handshake deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(5),
            secondary_timeout: Duration::from_secs(10),
        }
    }
}

enum AttemptFailure {
    Rejected { code: u8 },
    Failed(String),
}

/// Chooses between the primary and secondary connectors
pub struct TransportSelector {
    primary: Arc<dyn Connector>,
    secondary: Arc<dyn Connector>,
    store: Option<ResumptionStore>,
    config: SelectorConfig,
}

impl TransportSelector {
    pub fn new(
        primary: Arc<dyn Connector>,
        secondary: Arc<dyn Connector>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            store: None,
            config,
        }
    }

    /// Persist and reuse primary resumption tokens through `store`
    pub fn with_resumption_store(mut self, store: ResumptionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> SelectorConfig {
        self.config
    }

    /// Establish a session, preferring the primary transport.
    ///
    /// On success the context is Connected and records which transport backs
    /// the session. Any failure leaves it Disconnected.
    pub async fn connect(&self, context: &ClientContext) -> Result<(), ConnectError> {
        let span = connection_span!(
            device_id = %context.identity().device_id,
            attempt = context.reconnect_attempts()
        );
        self.connect_inner(context).instrument(span).await
    }

    async fn connect_inner(&self, context: &ClientContext) -> Result<(), ConnectError> {
        context.begin_connecting();

        let token = self.resumption_token(context).await;
        let resumed = token.is_some();
        let primary_handshake = context.handshake(token);

        info!(
            transport = %TransportKind::Primary,
            endpoint = %self.primary.endpoint(),
            resumed,
            "Connecting"
        );
        let primary_reason = match self
            .attempt(&*self.primary, &primary_handshake, self.config.primary_timeout)
            .await
        {
            Ok(established) => {
                self.install(context, TransportKind::Primary, established).await;
                return Ok(());
            }
            Err(AttemptFailure::Rejected { code }) => {
                return Err(self.rejected(context, TransportKind::Primary, code).await);
            }
            Err(AttemptFailure::Failed(reason)) => reason,
        };

        warn!(
            transport = %TransportKind::Primary,
            error = %primary_reason,
            fallback = %TransportKind::Secondary,
            "Primary transport unavailable, falling back"
        );

        let secondary_handshake = context.handshake(None);
        info!(
            transport = %TransportKind::Secondary,
            endpoint = %self.secondary.endpoint(),
            "Connecting"
        );
        match self
            .attempt(&*self.secondary, &secondary_handshake, self.config.secondary_timeout)
            .await
        {
            Ok(established) => {
                self.install(context, TransportKind::Secondary, established)
                    .await;
                Ok(())
            }
            Err(AttemptFailure::Rejected { code }) => {
                Err(self.rejected(context, TransportKind::Secondary, code).await)
            }
            Err(AttemptFailure::Failed(secondary_reason)) => {
                warn!(
                    transport = %TransportKind::Secondary,
                    error = %secondary_reason,
                    "Secondary transport unavailable"
                );
                close_previous(context.mark_disconnected()).await;
                Err(ConnectError::TransportUnavailable {
                    primary: primary_reason,
                    secondary: secondary_reason,
                })
            }
        }
    }

    /// Token held in memory, else whatever the store has. A stored token is
    /// only offered to the handshake; the context adopts a token after a
    /// primary handshake succeeds.
    async fn resumption_token(&self, context: &ClientContext) -> Option<Vec<u8>> {
        if let Some(token) = context.resumption_token() {
            return Some(token);
        }
        self.store.as_ref()?.load().await
    }

    async fn attempt(
        &self,
        connector: &dyn Connector,
        handshake: &Handshake,
        deadline: Duration,
    ) -> Result<Established, AttemptFailure> {
        // The open future owns every partial resource; timing out drops it.
        match tokio::time::timeout(deadline, connector.open(handshake)).await {
            Ok(Ok(established)) => Ok(established),
            Ok(Err(HandshakeError::Rejected { code })) => Err(AttemptFailure::Rejected { code }),
            Ok(Err(HandshakeError::Unreachable(reason))) => Err(AttemptFailure::Failed(reason)),
            Err(_) => Err(AttemptFailure::Failed(format!(
                "no acknowledgment within {}ms",
                deadline.as_millis()
            ))),
        }
    }

    async fn install(&self, context: &ClientContext, kind: TransportKind, established: Established) {
        let Established {
            session,
            resumption_token,
        } = established;

        context.stats().record_connection(kind);
        close_previous(context.install_session(kind, session)).await;

        match (kind, resumption_token) {
            (TransportKind::Primary, Some(token)) => {
                context.set_resumption_token(token.clone());
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&token).await {
                        warn!(error = %e, "Failed to persist resumption token, next handshake will be full");
                    }
                }
            }
            (TransportKind::Secondary, Some(_)) => {
                debug!("Ignoring resumption token offered by secondary transport");
            }
            (_, None) => {}
        }
    }

    async fn rejected(&self, context: &ClientContext, transport: TransportKind, code: u8) -> ConnectError {
        warn!(transport = %transport, code, "Broker rejected identity handshake");
        close_previous(context.mark_disconnected()).await;
        ConnectError::AuthenticationRejected { transport, code }
    }
}

async fn close_previous(previous: Option<Arc<dyn super::Session>>) {
    if let Some(session) = previous {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConnectionState, DeviceIdentity};
    use crate::observability::stats::StatsAggregator;
    use crate::testing::mocks::{ConnectOutcome, MockConnector};
    use crate::transport::Credential;
    use tempfile::TempDir;

    fn context() -> ClientContext {
        ClientContext::new(
            DeviceIdentity::new("sensor-7", Credential::new("pw")),
            60,
            Arc::new(StatsAggregator::new()),
        )
    }

    fn selector(primary: &MockConnector, secondary: &MockConnector) -> TransportSelector {
        TransportSelector::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            SelectorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_primary_success() {
        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::accept_with_token(b"ticket"));
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        selector(&primary, &secondary).connect(&context).await.unwrap();

        assert_eq!(context.state(), ConnectionState::Connected);
        assert_eq!(context.transport(), Some(TransportKind::Primary));
        assert_eq!(context.resumption_token(), Some(b"ticket".to_vec()));
        assert_eq!(secondary.open_count(), 0);
        assert_eq!(context.stats().snapshot().primary_connections, 1);
    }

    #[tokio::test]
    async fn test_primary_rejection_skips_secondary() {
        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Reject { code: 5 });
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        let err = selector(&primary, &secondary)
            .connect(&context)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectError::AuthenticationRejected {
                transport: TransportKind::Primary,
                code: 5
            }
        ));
        assert_eq!(secondary.open_count(), 0);
        assert_eq!(context.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back() {
        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
        let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::accept_with_token(b"nope"));
        let context = context();

        selector(&primary, &secondary).connect(&context).await.unwrap();

        assert_eq!(context.transport(), Some(TransportKind::Secondary));
        // Secondary never yields a resumption token
        assert_eq!(context.resumption_token(), None);
        let stats = context.stats().snapshot();
        assert_eq!(stats.primary_connections, 0);
        assert_eq!(stats.secondary_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_unavailable() {
        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Hang);
        let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
        let context = context();

        let err = selector(&primary, &secondary)
            .connect(&context)
            .await
            .unwrap_err();

        match err {
            ConnectError::TransportUnavailable { primary, secondary } => {
                assert!(primary.contains("5000ms"));
                assert!(secondary.contains("refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(context.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_secondary_rejection_is_authentication_failure() {
        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
        let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Reject { code: 4 });
        let context = context();

        let err = selector(&primary, &secondary)
            .connect(&context)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::AuthenticationRejected {
                transport: TransportKind::Secondary,
                code: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_stored_token_is_presented_to_primary_only() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("ticket.bin"));
        store.save(b"saved-ticket").await.unwrap();

        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        selector(&primary, &secondary)
            .with_resumption_store(store)
            .connect(&context)
            .await
            .unwrap();

        let primary_hs = &primary.handshakes()[0];
        assert_eq!(primary_hs.resumption_token, Some(b"saved-ticket".to_vec()));
        assert!(!primary_hs.clean_session);

        let secondary_hs = &secondary.handshakes()[0];
        assert_eq!(secondary_hs.resumption_token, None);
        assert!(secondary_hs.clean_session);
    }

    #[tokio::test]
    async fn test_stored_token_not_adopted_after_fallback() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("ticket.bin"));
        store.save(b"old").await.unwrap();

        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        selector(&primary, &secondary)
            .with_resumption_store(store.clone())
            .connect(&context)
            .await
            .unwrap();

        assert_eq!(context.transport(), Some(TransportKind::Secondary));
        assert_eq!(context.resumption_token(), None);
        // The stored token stays on disk for a later primary attempt
        assert_eq!(store.load().await, Some(b"old".to_vec()));
    }

    #[tokio::test]
    async fn test_new_primary_token_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ticket.bin");

        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::accept_with_token(b"fresh"));
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        selector(&primary, &secondary)
            .with_resumption_store(ResumptionStore::new(&path))
            .connect(&context)
            .await
            .unwrap();

        assert_eq!(ResumptionStore::new(&path).load().await, Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::accept_with_token(b"fresh"));
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let context = context();

        selector(&primary, &secondary)
            .with_resumption_store(ResumptionStore::new(blocker.join("ticket.bin")))
            .connect(&context)
            .await
            .unwrap();
        assert!(context.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_closes_replaced_session() {
        let primary = MockConnector::accepting(TransportKind::Primary);
        let secondary = MockConnector::accepting(TransportKind::Secondary);
        let selector = selector(&primary, &secondary);
        let context = context();

        selector.connect(&context).await.unwrap();
        let first = primary.last_session().unwrap();
        selector.connect(&context).await.unwrap();

        assert!(first.was_closed());
        assert_eq!(primary.open_count(), 2);
    }
}
