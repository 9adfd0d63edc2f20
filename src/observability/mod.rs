//! Observability: structured logging, connection statistics, snapshot sinks
//! and the HTTP health endpoints.

pub mod health;
pub mod logging;
pub mod sink;
pub mod stats;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use sink::{CompositeSink, SnapshotSink, TracingSink, WatchSink};
pub use stats::{ConnectionStats, Counter, StatsAggregator, StatsSnapshot};

pub use logging::{connection_span, publish_span};
