//! quicfall - resilient MQTT telemetry client
//!
//! Publishes device telemetry to a broker over a low-latency QUIC transport
//! and falls back to MQTT over TCP+TLS when QUIC is unreachable.
//!
//! # Overview
//!
//! - [`transport::TransportSelector`] tries the primary transport within a
//!   deadline, then the secondary, and persists session resumption tokens
//! - [`publisher::Publisher`] sends single messages or fans a batch out over
//!   concurrent streams with a bounded degree of parallelism
//! - [`reconnect::ReconnectionController`] retries with exponential backoff
//!   and jitter
//! - [`health_monitor::HealthMonitor`] reports statistics on a fixed cadence
//!   and triggers reconnection when the link is gone
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quicfall::{TelemetryClient, TelemetryConfig};
//! use quicfall::transport::Qos;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::load_from_file("quicfall.toml".as_ref())?;
//! let client = TelemetryClient::from_config(&config)?;
//! client.connect().await?;
//! client
//!     .publisher()
//!     .single_publish(&config.telemetry_topic(), "{\"temperature\":21.5}".into(), Qos::AtLeastOnce)
//!     .await?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod health_monitor;
pub mod observability;
pub mod publisher;
pub mod reconnect;
pub mod resumption;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use client::TelemetryClient;
pub use config::{ConfigError, TelemetryConfig};
pub use context::{ClientContext, ConnectionState, DeviceIdentity};
pub use error::{
    ClientError, ClientResult, ConnectError, PublishError, ReconnectError, StoreError,
};
pub use health_monitor::{HealthCheck, HealthMonitor};
pub use publisher::{PublishTask, Publisher};
pub use reconnect::{ExhaustionPolicy, ReconnectConfig, ReconnectionController};
pub use resumption::ResumptionStore;
pub use transport::{Qos, TransportKind, TransportSelector};
