//! quicfall - telemetry client entry point

use bytes::Bytes;
use clap::{Parser, Subcommand};
use quicfall::observability::{
    init_default_logging, publish_span, CompositeSink, HealthServer, TracingSink, WatchSink,
};
use quicfall::reconnect::interruptible_sleep;
use quicfall::telemetry::{fanout_tasks, SensorReading, TelemetryMessage};
use quicfall::{ClientError, ReconnectError, TelemetryClient, TelemetryConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Resilient MQTT telemetry client with QUIC primary and TLS fallback
#[derive(Parser)]
#[command(name = "quicfall")]
#[command(about = "Resilient MQTT telemetry client with QUIC primary and TLS fallback")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "QUICFALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish telemetry until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting quicfall v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<TelemetryConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(TelemetryConfig::load_from_file(path)?);
    }

    for path_str in ["quicfall.toml", "config/quicfall.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(TelemetryConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create quicfall.toml".into())
}

async fn run_client(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(device_id = %config.device.id, "Client starting");

    let client = TelemetryClient::from_config(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (watch_sink, reports) = WatchSink::new();
    let sink = Arc::new(
        CompositeSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(watch_sink)),
    );

    if let Some(port) = config.health.http_port {
        let server = Arc::new(HealthServer::new(Arc::clone(client.context()), reports, port));
        tokio::spawn(server.start());
    }

    match client.connect().await {
        Ok(()) => {}
        Err(e) if !e.is_retryable() => {
            client.shutdown().await;
            return Err(ClientError::from(e).into());
        }
        // The health monitor picks up the Disconnected state on its first tick
        Err(e) => warn!(error = %e, "Initial connect failed, reconnecting in background"),
    }

    let monitor = client.health_monitor(sink);
    let monitor_rx = shutdown_rx.clone();
    let mut monitor_task = tokio::spawn(async move { monitor.run(monitor_rx).await });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Client running");

    let mut monitor_result = None;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        joined = &mut monitor_task => monitor_result = Some(joined),
        _ = publish_loop(&client, &config, shutdown_rx.clone()) => {}
    }

    let _ = shutdown_tx.send(true);
    let monitor_result = match monitor_result {
        Some(joined) => joined,
        None => monitor_task.await,
    };
    client.shutdown().await;

    match monitor_result {
        Ok(Ok(())) | Ok(Err(ReconnectError::Cancelled)) => Ok(()),
        Ok(Err(e)) => Err(ClientError::from(e).into()),
        Err(e) => Err(format!("health monitor task failed: {e}").into()),
    }
}

/// Publish one telemetry message per interval, with a parallel fan-out every
/// `parallel_every` messages. Returns once shutdown is signalled.
async fn publish_loop(
    client: &TelemetryClient,
    config: &TelemetryConfig,
    shutdown_rx: watch::Receiver<bool>,
) {
    let topic = config.telemetry_topic();
    let interval = Duration::from_millis(config.publish.interval_ms);
    let interval_secs = interval.as_secs().max(1);
    let qos = config.publish.qos;
    let publisher = client.publisher();
    let context = client.context();
    let mut message_id: u64 = 0;

    loop {
        if !context.is_connected() {
            if !interruptible_sleep(shutdown_rx.clone(), Duration::from_secs(1)).await {
                return;
            }
            continue;
        }

        message_id += 1;
        let reading = SensorReading::sample(&mut rand::rng());

        let cycle = async {
            let message =
                TelemetryMessage::new(reading, context.transport(), message_id, chrono::Utc::now());
            let payload: Bytes = match message.to_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to encode telemetry");
                    return;
                }
            };

            match publisher.single_publish(&topic, payload, qos).await {
                Ok(()) => info!(topic = %topic, "Telemetry sent"),
                Err(e) => warn!(error = %e, "Telemetry failed"),
            }
        };
        cycle
            .instrument(publish_span!(message_id = message_id))
            .await;

        if !interruptible_sleep(shutdown_rx.clone(), interval).await {
            return;
        }

        if config.publish.parallel_every > 0
            && message_id % config.publish.parallel_every == 0
            && context.is_connected()
        {
            let fanout = async {
                match fanout_tasks(&config.device.id, reading, message_id, interval_secs, qos) {
                    Ok(mut tasks) => {
                        let succeeded = publisher.parallel_publish(&mut tasks).await;
                        info!(succeeded, total = tasks.len(), "Parallel publish complete");
                    }
                    Err(e) => error!(error = %e, "Failed to encode fan-out payloads"),
                }
            };
            fanout
                .instrument(publish_span!(message_id = message_id, fanout = true))
                .await;
        }
    }
}

fn handle_config_command(
    config: &TelemetryConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
