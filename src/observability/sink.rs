//! Destinations for periodic statistics snapshots

use super::stats::StatsSnapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Receives one snapshot per health tick while connected
pub trait SnapshotSink: Send + Sync {
    fn emit(&self, snapshot: &StatsSnapshot);
}

/// Logs each snapshot as one structured event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SnapshotSink for TracingSink {
    fn emit(&self, snapshot: &StatsSnapshot) {
        info!(
            transport = ?snapshot.transport_kind,
            state = %snapshot.state,
            messages_sent = snapshot.messages_sent,
            bytes_sent = snapshot.bytes_sent,
            reconnect_count = snapshot.reconnect_count,
            primary_connections = snapshot.connections_by_transport.primary,
            secondary_connections = snapshot.connections_by_transport.secondary,
            avg_latency_ms = snapshot.avg_latency_ms,
            min_latency_ms = snapshot.min_latency_ms,
            max_latency_ms = snapshot.max_latency_ms,
            "Connection statistics"
        );
    }
}

/// Keeps the latest snapshot for pull consumers such as the HTTP server
#[derive(Debug)]
pub struct WatchSink {
    tx: watch::Sender<Option<StatsSnapshot>>,
}

impl WatchSink {
    pub fn new() -> (Self, watch::Receiver<Option<StatsSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StatsSnapshot>> {
        self.tx.subscribe()
    }
}

impl SnapshotSink for WatchSink {
    fn emit(&self, snapshot: &StatsSnapshot) {
        self.tx.send_replace(Some(snapshot.clone()));
    }
}

/// Forwards every snapshot to each inner sink in order
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn SnapshotSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl SnapshotSink for CompositeSink {
    fn emit(&self, snapshot: &StatsSnapshot) {
        for sink in &self.sinks {
            sink.emit(snapshot);
        }
    }
}
