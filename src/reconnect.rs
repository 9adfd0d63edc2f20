//! Bounded exponential backoff with jitter
//!
//! The decision and delay calculations are pure functions so they can be
//! tested without a clock; [`ReconnectionController::run`] wires them to the
//! transport selector and the shutdown channel.

use crate::context::ClientContext;
use crate::error::ReconnectError;
use crate::observability::stats::Counter;
use crate::transport::TransportSelector;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What happens once `max_attempts` consecutive attempts have failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Stay disconnected and surface the failure
    #[default]
    GiveUp,
    /// Start a fresh backoff sequence at the next health check
    Restart,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            on_exhausted: ExhaustionPolicy::GiveUp,
        }
    }
}

impl ReconnectConfig {
    /// `min(base * 2^attempt, cap)` for a 0-indexed attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Backoff delay plus uniform jitter in `[0, delay / 2]`
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt);
        let half_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
        delay + Duration::from_millis(rng.random_range(0..=half_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("base delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max delay must not be smaller than base delay".to_string());
        }
        Ok(())
    }
}

/// Next step of the reconnection loop
#[derive(Debug, PartialEq)]
pub enum ReconnectDecision {
    /// `attempt` is 1-indexed, for logging
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortExhausted,
}

impl ReconnectConfig {
    /// Decide what to do after `failed_attempts` consecutive failures
    pub fn decide<R: Rng + ?Sized>(
        &self,
        failed_attempts: u32,
        shutdown_requested: bool,
        rng: &mut R,
    ) -> ReconnectDecision {
        if shutdown_requested {
            return ReconnectDecision::AbortShutdownRequested;
        }
        if failed_attempts >= self.max_attempts {
            return ReconnectDecision::AbortExhausted;
        }
        ReconnectDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: self.jittered_delay(failed_attempts, rng),
        }
    }
}

/// Drives the transport selector until a session is back or the budget runs out
pub struct ReconnectionController {
    selector: Arc<TransportSelector>,
    config: ReconnectConfig,
}

impl ReconnectionController {
    pub fn new(selector: Arc<TransportSelector>, config: ReconnectConfig) -> Self {
        Self { selector, config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Run one backoff sequence.
    ///
    /// Starts from the context's current attempt counter. On success the
    /// counter is reset and `reconnect_count` goes up by one. On exhaustion
    /// the counter is left at `max_attempts`.
    pub async fn run(
        &self,
        context: &ClientContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ReconnectError> {
        loop {
            let failed = context.reconnect_attempts();
            let decision = self
                .config
                .decide(failed, *shutdown_rx.borrow(), &mut rand::rng());

            match decision {
                ReconnectDecision::Proceed { attempt, delay } => {
                    context.mark_reconnecting(attempt);
                    info!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnection attempt"
                    );

                    if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        context.mark_disconnected();
                        return Err(ReconnectError::Cancelled);
                    }

                    match self.selector.connect(context).await {
                        Ok(()) => {
                            context.reset_reconnect_attempts();
                            context.stats().increment(Counter::ReconnectCount);
                            info!(
                                attempt,
                                transport = ?context.transport(),
                                "Reconnection successful"
                            );
                            return Ok(());
                        }
                        Err(e) if !e.is_retryable() => {
                            error!(attempt, error = %e, "Reconnection aborted");
                            return Err(ReconnectError::Rejected(e));
                        }
                        Err(e) => {
                            let failed = context.increment_reconnect_attempts();
                            warn!(attempt = failed, error = %e, "Reconnection attempt failed");
                        }
                    }
                }
                ReconnectDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, stopping reconnection");
                    context.mark_disconnected();
                    return Err(ReconnectError::Cancelled);
                }
                ReconnectDecision::AbortExhausted => {
                    error!(
                        attempts = failed,
                        policy = ?self.config.on_exhausted,
                        "Reconnection attempts exhausted"
                    );
                    context.mark_disconnected();
                    return Err(ReconnectError::Exhausted { attempts: failed });
                }
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
/// Returns true if the full delay elapsed.
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => match changed {
                Ok(()) if *shutdown_rx.borrow() => {
                    info!("Shutdown signal received during delay");
                    return false;
                }
                Ok(()) => continue,
                // Sender gone: nobody can request shutdown any more
                Err(_) => {
                    (&mut sleep).await;
                    return true;
                }
            },
        }
    }
}
