//! End-to-end resilience scenarios against scripted connectors
//!
//! Timing-dependent tests run on a paused clock so deadlines and backoff
//! delays elapse instantly.

use bytes::Bytes;
use quicfall::observability::{StatsAggregator, WatchSink};
use quicfall::testing::mocks::{ConnectOutcome, MockConnector};
use quicfall::transport::{Credential, SelectorConfig};
use quicfall::{
    ClientContext, ConnectError, ConnectionState, DeviceIdentity, ExhaustionPolicy, HealthCheck,
    HealthMonitor, PublishError, PublishTask, Publisher, Qos, ReconnectConfig, ReconnectError,
    ReconnectionController, ResumptionStore, TransportKind, TransportSelector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Rig {
    context: Arc<ClientContext>,
    selector: Arc<TransportSelector>,
    monitor: HealthMonitor,
    publisher: Publisher,
}

fn rig(primary: &MockConnector, secondary: &MockConnector, max_attempts: u32) -> Rig {
    let context = Arc::new(ClientContext::new(
        DeviceIdentity::new("sensor-7", Credential::new("secret")),
        60,
        Arc::new(StatsAggregator::new()),
    ));
    let selector = Arc::new(TransportSelector::new(
        Arc::new(primary.clone()),
        Arc::new(secondary.clone()),
        SelectorConfig::default(),
    ));
    let controller = Arc::new(ReconnectionController::new(
        Arc::clone(&selector),
        ReconnectConfig {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            on_exhausted: ExhaustionPolicy::GiveUp,
        },
    ));
    let (sink, _reports) = WatchSink::new();
    let monitor = HealthMonitor::new(
        Arc::clone(&context),
        controller,
        Duration::from_secs(30),
        Arc::new(sink),
    );
    let publisher = Publisher::new(Arc::clone(&context)).with_max_fanout(4);
    Rig {
        context,
        selector,
        monitor,
        publisher,
    }
}

#[tokio::test(start_paused = true)]
async fn test_primary_timeout_falls_back_to_secondary() {
    let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Hang);
    let secondary = MockConnector::accepting(TransportKind::Secondary);
    let rig = rig(&primary, &secondary, 5);

    rig.selector.connect(&rig.context).await.unwrap();

    assert_eq!(rig.context.state(), ConnectionState::Connected);
    assert_eq!(rig.context.transport(), Some(TransportKind::Secondary));
    let stats = rig.context.stats().snapshot();
    assert_eq!(stats.primary_connections, 0);
    assert_eq!(stats.secondary_connections, 1);

    rig.publisher
        .single_publish("device/sensor-7/telemetry/sensors", Bytes::from_static(b"{}"), Qos::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(
        secondary.last_session().unwrap().delivered_topics(),
        vec!["device/sensor-7/telemetry/sensors"]
    );
}

#[tokio::test]
async fn test_rejected_identity_never_tries_secondary() {
    let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Reject { code: 5 });
    let secondary = MockConnector::accepting(TransportKind::Secondary);
    let rig = rig(&primary, &secondary, 5);

    let err = rig.selector.connect(&rig.context).await.unwrap_err();

    assert!(matches!(err, ConnectError::AuthenticationRejected { .. }));
    assert!(!err.is_retryable());
    assert_eq!(secondary.open_count(), 0);
    assert_eq!(rig.context.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_send_failures_then_link_loss_recovers_on_second_attempt() {
    let primary = MockConnector::scripted(
        TransportKind::Primary,
        vec![ConnectOutcome::accept(), ConnectOutcome::Unreachable],
        ConnectOutcome::accept(),
    );
    let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
    let rig = rig(&primary, &secondary, 5);

    rig.selector.connect(&rig.context).await.unwrap();
    let first = primary.last_session().unwrap();
    first.fail_next(3);

    for _ in 0..3 {
        let err = rig
            .publisher
            .single_publish("device/sensor-7/telemetry/sensors", Bytes::from_static(b"{}"), Qos::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::SendFailure { .. }));
    }
    assert_eq!(rig.context.stats().snapshot().messages_sent, 0);

    first.drop_link();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = rig.monitor.check_once(shutdown_rx).await.unwrap();

    assert_eq!(outcome, HealthCheck::Reconnected);
    assert_eq!(rig.context.state(), ConnectionState::Connected);
    assert_eq!(rig.context.transport(), Some(TransportKind::Primary));
    assert_eq!(rig.context.reconnect_attempts(), 0);
    assert_eq!(rig.context.stats().snapshot().reconnect_count, 1);
    assert_eq!(primary.open_count(), 3);
    assert!(first.was_closed());
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_leaves_attempts_at_max() {
    let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
    let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
    let rig = rig(&primary, &secondary, 3);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = rig.monitor.check_once(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, ReconnectError::Exhausted { attempts: 3 }));
    assert_eq!(rig.context.reconnect_attempts(), 3);
    assert_eq!(rig.context.state(), ConnectionState::Disconnected);
    assert_eq!(primary.open_count(), 3);
    assert_eq!(secondary.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_cancels() {
    let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::Unreachable);
    let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
    let rig = rig(&primary, &secondary, 10);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = tokio::spawn(async move { rig.monitor.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_secs(45)).await;
    shutdown_tx.send(true).unwrap();

    assert!(monitor.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_publish_caps_in_flight() {
    let primary = MockConnector::accepting(TransportKind::Primary)
        .with_session_delay(Duration::from_millis(100));
    let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
    let rig = rig(&primary, &secondary, 5);
    rig.selector.connect(&rig.context).await.unwrap();

    let mut tasks: Vec<PublishTask> = (0..5)
        .map(|i| PublishTask::new(format!("device/sensor-7/telemetry/{i}"), "{}", Qos::AtLeastOnce))
        .collect();
    let succeeded = rig.publisher.parallel_publish(&mut tasks).await;

    let session = primary.last_session().unwrap();
    assert_eq!(succeeded, 5);
    assert_eq!(session.send_count(), 5);
    assert_eq!(session.max_concurrency(), 4);
    let mut starts = session.in_flight_at_start();
    starts.sort_unstable();
    assert_eq!(starts, vec![0, 0, 1, 2, 3]);
    assert!(tasks.iter().all(|t| t.succeeded()));
}

#[tokio::test]
async fn test_small_batches_send_each_task_once() {
    for n in 1..=4 {
        let primary = MockConnector::accepting(TransportKind::Primary);
        let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
        let rig = rig(&primary, &secondary, 5);
        rig.selector.connect(&rig.context).await.unwrap();

        let mut tasks: Vec<PublishTask> = (0..n)
            .map(|i| PublishTask::new(format!("t/{i}"), "x", Qos::AtMostOnce))
            .collect();
        assert_eq!(rig.publisher.parallel_publish(&mut tasks).await, n);
        assert_eq!(primary.last_session().unwrap().send_count(), n);
        assert_eq!(rig.context.stats().snapshot().messages_sent, n as u64);
    }
}

#[tokio::test]
async fn test_publish_while_disconnected_is_rejected() {
    let primary = MockConnector::accepting(TransportKind::Primary);
    let secondary = MockConnector::accepting(TransportKind::Secondary);
    let rig = rig(&primary, &secondary, 5);

    let err = rig
        .publisher
        .single_publish("t", Bytes::from_static(b"x"), Qos::AtMostOnce)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::NotConnected {
            state: ConnectionState::Disconnected
        }
    ));
}

#[tokio::test]
async fn test_resumption_token_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("session.bin");

    let primary = MockConnector::new(TransportKind::Primary, ConnectOutcome::accept_with_token(b"ticket-1"));
    let secondary = MockConnector::new(TransportKind::Secondary, ConnectOutcome::Unreachable);
    let first = rig(&primary, &secondary, 5);
    let selector = TransportSelector::new(
        Arc::new(primary.clone()),
        Arc::new(secondary.clone()),
        SelectorConfig::default(),
    )
    .with_resumption_store(ResumptionStore::new(&path));
    selector.connect(&first.context).await.unwrap();

    assert_eq!(ResumptionStore::new(&path).load().await, Some(b"ticket-1".to_vec()));

    // Fresh process: nothing in memory, token comes from disk
    let restarted_primary = MockConnector::accepting(TransportKind::Primary);
    let second = rig(&restarted_primary, &secondary, 5);
    let selector = TransportSelector::new(
        Arc::new(restarted_primary.clone()),
        Arc::new(secondary.clone()),
        SelectorConfig::default(),
    )
    .with_resumption_store(ResumptionStore::new(&path));
    selector.connect(&second.context).await.unwrap();

    let handshakes = restarted_primary.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].resumption_token, Some(b"ticket-1".to_vec()));
}
