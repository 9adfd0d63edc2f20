//! Periodic health check driving snapshots and reconnection
//!
//! The monitor is the only component that starts a reconnection on its own.
//! Each tick it first checks the session for link loss, then reports
//! statistics while connected or runs the reconnection controller while
//! disconnected.

use crate::context::{ClientContext, ConnectionState};
use crate::error::ReconnectError;
use crate::observability::sink::SnapshotSink;
use crate::reconnect::{interruptible_sleep, ExhaustionPolicy, ReconnectionController};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheck {
    /// Connected; a snapshot was emitted
    Reported,
    /// Was disconnected; a reconnection sequence succeeded
    Reconnected,
    /// A connect is already in progress
    Busy,
}

pub struct HealthMonitor {
    context: Arc<ClientContext>,
    controller: Arc<ReconnectionController>,
    interval: Duration,
    sink: Arc<dyn SnapshotSink>,
}

impl HealthMonitor {
    pub fn new(
        context: Arc<ClientContext>,
        controller: Arc<ReconnectionController>,
        interval: Duration,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        Self {
            context,
            controller,
            interval,
            sink,
        }
    }

    /// One health tick
    pub async fn check_once(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<HealthCheck, ReconnectError> {
        if let Some(dead) = self.context.detect_link_loss() {
            dead.close().await;
        }

        match self.context.state() {
            ConnectionState::Connected => {
                self.sink.emit(&self.context.snapshot());
                Ok(HealthCheck::Reported)
            }
            ConnectionState::Disconnected => {
                self.prepare_restart();
                info!("Link down, starting reconnection");
                self.controller.run(&self.context, shutdown_rx).await?;
                self.sink.emit(&self.context.snapshot());
                Ok(HealthCheck::Reconnected)
            }
            state @ (ConnectionState::Connecting | ConnectionState::Reconnecting) => {
                debug!(state = %state, "Connect in progress, skipping health tick");
                Ok(HealthCheck::Busy)
            }
        }
    }

    /// Tick every interval until shutdown.
    ///
    /// Returns `Ok` on shutdown and an error for failures that need an
    /// operator: a rejected identity, or exhaustion under the give-up policy.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Result<(), ReconnectError> {
        info!(interval_ms = self.interval.as_millis() as u64, "Health monitor started");

        loop {
            if !interruptible_sleep(shutdown_rx.clone(), self.interval).await {
                info!("Health monitor stopping");
                return Ok(());
            }

            match self.check_once(shutdown_rx.clone()).await {
                Ok(_) => {}
                Err(ReconnectError::Cancelled) => {
                    info!("Health monitor stopping");
                    return Ok(());
                }
                Err(ReconnectError::Exhausted { attempts })
                    if self.controller.config().on_exhausted == ExhaustionPolicy::Restart =>
                {
                    warn!(attempts, "Reconnection exhausted, restarting sequence at next tick");
                }
                Err(e) => {
                    error!(error = %e, "Health monitor giving up");
                    return Err(e);
                }
            }
        }
    }

    fn prepare_restart(&self) {
        let config = self.controller.config();
        if config.on_exhausted == ExhaustionPolicy::Restart
            && self.context.reconnect_attempts() >= config.max_attempts
        {
            info!(
                attempts = self.context.reconnect_attempts(),
                "Resetting attempt counter for a new backoff sequence"
            );
            self.context.reset_reconnect_attempts();
        }
    }
}
