//! Thread-safe connection statistics
//!
//! Every mutation takes one short critical section over the whole
//! [`ConnectionStats`] record. No I/O ever happens while it is held.

use crate::context::ConnectionState;
use crate::transport::TransportKind;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Monotonic counters tracked by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    MessagesSent,
    BytesSent,
    ReconnectCount,
    PrimaryConnections,
    SecondaryConnections,
}

/// Raw statistics record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub reconnect_count: u64,
    pub primary_connections: u64,
    pub secondary_connections: u64,
    pub latency_sum_ms: f64,
    pub latency_count: u64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
}

impl ConnectionStats {
    /// Derived on every read, never stored
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_count == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.latency_count as f64
        }
    }

    fn counter_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::MessagesSent => &mut self.messages_sent,
            Counter::BytesSent => &mut self.bytes_sent,
            Counter::ReconnectCount => &mut self.reconnect_count,
            Counter::PrimaryConnections => &mut self.primary_connections,
            Counter::SecondaryConnections => &mut self.secondary_connections,
        }
    }
}

/// Shared statistics aggregator
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<ConnectionStats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        let mut stats = self.stats();
        let value = stats.counter_mut(counter);
        *value = value.saturating_add(amount);
    }

    /// Count one sent message and its payload size together
    pub fn record_publish(&self, payload_len: usize) {
        let mut stats = self.stats();
        stats.messages_sent = stats.messages_sent.saturating_add(1);
        stats.bytes_sent = stats.bytes_sent.saturating_add(payload_len as u64);
    }

    pub fn record_connection(&self, kind: TransportKind) {
        match kind {
            TransportKind::Primary => self.increment(Counter::PrimaryConnections),
            TransportKind::Secondary => self.increment(Counter::SecondaryConnections),
        }
    }

    pub fn update_latency(&self, latency_ms: f64) {
        let mut stats = self.stats();
        if stats.latency_count == 0 || latency_ms < stats.latency_min_ms {
            stats.latency_min_ms = latency_ms;
        }
        if latency_ms > stats.latency_max_ms {
            stats.latency_max_ms = latency_ms;
        }
        stats.latency_sum_ms += latency_ms;
        stats.latency_count += 1;
    }

    pub fn update_latency_duration(&self, latency: Duration) {
        self.update_latency(latency.as_secs_f64() * 1000.0);
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> ConnectionStats {
        self.stats().clone()
    }

    /// Every update leaves the record consistent, so a poisoned lock still
    /// holds valid counters.
    fn stats(&self) -> MutexGuard<'_, ConnectionStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-transport connection counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionsByTransport {
    pub primary: u64,
    pub secondary: u64,
}

/// Observability snapshot handed to external collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub transport_kind: Option<TransportKind>,
    pub state: ConnectionState,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub reconnect_count: u64,
    pub connections_by_transport: ConnectionsByTransport,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StatsSnapshot {
    pub fn build(
        stats: &ConnectionStats,
        state: ConnectionState,
        transport_kind: Option<TransportKind>,
    ) -> Self {
        Self {
            transport_kind,
            state,
            messages_sent: stats.messages_sent,
            bytes_sent: stats.bytes_sent,
            reconnect_count: stats.reconnect_count,
            connections_by_transport: ConnectionsByTransport {
                primary: stats.primary_connections,
                secondary: stats.secondary_connections,
            },
            avg_latency_ms: stats.avg_latency_ms(),
            min_latency_ms: stats.latency_min_ms,
            max_latency_ms: stats.latency_max_ms,
            timestamp: chrono::Utc::now(),
        }
    }
}
