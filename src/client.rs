//! Wiring of context, selector, controller, publisher and health monitor
//!
//! [`TelemetryClient`] owns the one [`ClientContext`] of the process and
//! hands out the components that share it.

use crate::config::TelemetryConfig;
use crate::context::{ClientContext, DeviceIdentity};
use crate::error::{ClientResult, ConnectError};
use crate::health_monitor::HealthMonitor;
use crate::observability::sink::SnapshotSink;
use crate::observability::stats::StatsAggregator;
use crate::publisher::Publisher;
use crate::reconnect::{ReconnectConfig, ReconnectionController};
use crate::resumption::ResumptionStore;
use crate::transport::quic::QuicConnector;
use crate::transport::tls::TlsConnector;
use crate::transport::TransportSelector;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct TelemetryClient {
    context: Arc<ClientContext>,
    selector: Arc<TransportSelector>,
    controller: Arc<ReconnectionController>,
    publisher: Publisher,
    health_interval: Duration,
}

impl TelemetryClient {
    /// Assemble a client from already-built parts
    pub fn new(
        identity: DeviceIdentity,
        keep_alive_secs: u16,
        selector: TransportSelector,
        reconnect: ReconnectConfig,
        max_fanout: usize,
        health_interval: Duration,
    ) -> Self {
        let context = Arc::new(ClientContext::new(
            identity,
            keep_alive_secs,
            Arc::new(StatsAggregator::new()),
        ));
        let selector = Arc::new(selector);
        let controller = Arc::new(ReconnectionController::new(Arc::clone(&selector), reconnect));
        let publisher = Publisher::new(Arc::clone(&context)).with_max_fanout(max_fanout);
        Self {
            context,
            selector,
            controller,
            publisher,
            health_interval,
        }
    }

    /// Build the QUIC and TLS connectors described by `config`
    pub fn from_config(config: &TelemetryConfig) -> ClientResult<Self> {
        let credential = config.credential()?;
        let ca_path = &config.transport.ca_path;

        let primary = QuicConnector::from_ca_file(config.primary_endpoint()?, ca_path)?;
        let secondary = TlsConnector::from_ca_file(config.secondary_endpoint()?, ca_path)?;

        let mut selector = TransportSelector::new(
            Arc::new(primary),
            Arc::new(secondary),
            config.selector_config(),
        );
        if config.resumption.enabled {
            selector = selector.with_resumption_store(ResumptionStore::new(&config.resumption.path));
        }

        info!(
            device_id = %config.device.id,
            primary = %config.transport.primary_url,
            secondary = %config.transport.secondary_url,
            resumption = config.resumption.enabled,
            "Client configured"
        );

        Ok(Self::new(
            DeviceIdentity::new(config.device.id.clone(), credential),
            config.transport.keep_alive_secs,
            selector,
            config.reconnect_config(),
            config.publish.max_fanout,
            Duration::from_millis(config.health.interval_ms),
        ))
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn controller(&self) -> &Arc<ReconnectionController> {
        &self.controller
    }

    /// Initial connect at startup
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.selector.connect(&self.context).await
    }

    pub fn health_monitor(&self, sink: Arc<dyn SnapshotSink>) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.context),
            Arc::clone(&self.controller),
            self.health_interval,
            sink,
        )
    }

    /// Close the session and release the resumption token
    pub async fn shutdown(&self) {
        let stats = self.context.snapshot();
        info!(
            messages_sent = stats.messages_sent,
            bytes_sent = stats.bytes_sent,
            reconnect_count = stats.reconnect_count,
            "Final statistics"
        );
        self.context.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionState;
    use crate::testing::mocks::{ConnectOutcome, MockConnector};
    use crate::transport::{Credential, SelectorConfig, TransportKind};

    #[tokio::test]
    async fn test_connect_and_shutdown() {
        let primary = MockConnector::accepting(TransportKind::Primary);
        let selector = TransportSelector::new(
            Arc::new(primary.clone()),
            Arc::new(MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable)),
            SelectorConfig::default(),
        );
        let client = TelemetryClient::new(
            DeviceIdentity::new("sensor-1", Credential::new("pw")),
            60,
            selector,
            ReconnectConfig::default(),
            3,
            Duration::from_secs(30),
        );

        client.connect().await.unwrap();
        assert!(client.context().is_connected());
        assert_eq!(client.publisher().max_fanout(), 3);

        client.shutdown().await;
        assert_eq!(client.context().state(), ConnectionState::Disconnected);
        assert!(primary.last_session().unwrap().was_closed());
    }

    #[test]
    fn test_from_config_requires_credential() {
        let mut config = TelemetryConfig::test_config();
        config.device.password_env = "QUICFALL_TEST_CLIENT_PASSWORD_UNSET".to_string();

        let err = TelemetryClient::from_config(&config).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_config_requires_ca_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = TelemetryConfig::test_config();
        config.device.password_env = "QUICFALL_TEST_CLIENT_PASSWORD_SET".to_string();
        config.transport.ca_path = dir.path().join("missing-ca.pem");
        std::env::set_var("QUICFALL_TEST_CLIENT_PASSWORD_SET", "pw");

        let err = TelemetryClient::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("missing-ca.pem"));
    }
}
