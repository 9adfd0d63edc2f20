//! Simulated sensor readings and the payloads built from them

use crate::publisher::PublishTask;
use crate::transport::{Qos, TransportKind};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
}

impl SensorReading {
    /// Temperature in [20.0, 30.0) and humidity in [40.0, 70.0), one decimal
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            temperature: 20.0 + f64::from(rng.random_range(0..100u32)) / 10.0,
            humidity: 40.0 + f64::from(rng.random_range(0..300u32)) / 10.0,
        }
    }
}

/// Payload of the periodic telemetry message
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMessage {
    pub timestamp: String,
    pub data: SensorReading,
    pub transport: Option<TransportKind>,
    pub message_id: u64,
}

impl TelemetryMessage {
    pub fn new(
        reading: SensorReading,
        transport: Option<TransportKind>,
        message_id: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data: reading,
            transport,
            message_id,
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// One task per sub-topic: temperature, humidity and status
pub fn fanout_tasks(
    device_id: &str,
    reading: SensorReading,
    message_id: u64,
    interval_secs: u64,
    qos: Qos,
) -> Result<Vec<PublishTask>, serde_json::Error> {
    let topic = |leaf: &str| format!("device/{device_id}/telemetry/{leaf}");

    let temperature = serde_json::json!({ "temperature": reading.temperature });
    let humidity = serde_json::json!({ "humidity": reading.humidity });
    let status = serde_json::json!({
        "status": "ok",
        "uptime": message_id.saturating_mul(interval_secs),
    });

    Ok(vec![
        PublishTask::new(topic("temperature"), serde_json::to_vec(&temperature)?, qos),
        PublishTask::new(topic("humidity"), serde_json::to_vec(&humidity)?, qos),
        PublishTask::new(topic("status"), serde_json::to_vec(&status)?, qos),
    ])
}
