//! HTTP health endpoints for operators and orchestrators
//!
//! - `GET /health` connection status, 200 when connected, else 503
//! - `GET /stats` live statistics snapshot
//! - `GET /live` liveness check

use super::stats::StatsSnapshot;
use crate::context::{ClientContext, ConnectionState};
use crate::transport::TransportKind;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    device_id: String,
    state: ConnectionState,
    transport: Option<TransportKind>,
    reconnect_attempts: u32,
    /// Time of the last snapshot pushed by the health monitor
    last_report: Option<chrono::DateTime<chrono::Utc>>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// HTTP health check server
pub struct HealthServer {
    context: Arc<ClientContext>,
    reports: watch::Receiver<Option<StatsSnapshot>>,
    port: u16,
}

impl HealthServer {
    pub fn new(
        context: Arc<ClientContext>,
        reports: watch::Receiver<Option<StatsSnapshot>>,
        port: u16,
    ) -> Self {
        Self {
            context,
            reports,
            port,
        }
    }

    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = Arc::clone(self);
        let with_server = warp::any().map(move || Arc::clone(&server));

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .map(|server: Arc<HealthServer>| server.health_reply());

        let stats = warp::path("stats")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .map(|server: Arc<HealthServer>| warp::reply::json(&server.context.snapshot()));

        let live = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: chrono::Utc::now(),
                })
            });

        health.or(stats).or(live)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        tracing::info!(port = self.port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], self.port)).await;
    }

    fn health_reply(&self) -> warp::reply::WithStatus<warp::reply::Json> {
        let state = self.context.state();
        let connected = state == ConnectionState::Connected;
        let last_report = self
            .reports
            .borrow()
            .as_ref()
            .map(|snapshot| snapshot.timestamp);

        let status = HealthStatus {
            status: if connected { "healthy" } else { "unhealthy" },
            device_id: self.context.identity().device_id.clone(),
            state,
            transport: self.context.transport(),
            reconnect_attempts: self.context.reconnect_attempts(),
            last_report,
            timestamp: chrono::Utc::now(),
        };
        let code = if connected {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        warp::reply::with_status(warp::reply::json(&status), code)
    }
}
