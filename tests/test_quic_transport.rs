//! QUIC adapter against an in-process quinn broker on loopback
//!
//! Certificates under `tests/fixtures` are a throwaway CA and a leaf for
//! `localhost` / `127.0.0.1`.

use bytes::Bytes;
use quicfall::transport::quic::{client_config, QuicConnector, ALPN_MQTT};
use quicfall::transport::{
    BrokerEndpoint, Connector, Credential, Handshake, PublishFrame, Qos, Session,
};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::rustls;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const CA_PEM: &[u8] = include_bytes!("fixtures/ca.pem");
const SERVER_PEM: &[u8] = include_bytes!("fixtures/server.pem");
const SERVER_KEY: &[u8] = include_bytes!("fixtures/server.key");

fn broker() -> quinn::Endpoint {
    let certs = rustls_pemfile::certs(&mut &SERVER_PEM[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &SERVER_KEY[..])
        .unwrap()
        .unwrap();

    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    tls.alpn_protocols = vec![ALPN_MQTT.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).unwrap();
    quinn::Endpoint::server(
        quinn::ServerConfig::with_crypto(Arc::new(crypto)),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap()
}

fn handshake() -> Handshake {
    Handshake {
        client_id: "sensor-q1".to_string(),
        username: "sensor-q1".to_string(),
        credential: Credential::new("pw"),
        keep_alive_secs: 60,
        clean_session: true,
        resumption_token: None,
    }
}

fn frame(topic: &str) -> PublishFrame {
    PublishFrame {
        topic: topic.to_string(),
        payload: Bytes::from_static(b"{\"value\":1}"),
        qos: Qos::AtMostOnce,
    }
}

/// Topic name of a PUBLISH packet whose remaining length fits in one byte
fn publish_topic(packet: &[u8]) -> String {
    assert_eq!(packet[0] & 0xF0, 0x30, "not a PUBLISH packet");
    let len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    String::from_utf8(packet[4..4 + len].to_vec()).unwrap()
}

#[tokio::test]
async fn test_concurrent_publishes_use_separate_streams() {
    let server = broker();
    let port = server.local_addr().unwrap().port();

    let broker_task = tokio::spawn(async move {
        let connection = server.accept().await.unwrap().await.unwrap();

        let (mut control_tx, mut control_rx) = connection.accept_bi().await.unwrap();
        let mut header = [0u8; 1];
        control_rx.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x10, "first control frame must be CONNECT");
        control_tx.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut publishes = Vec::new();
        for _ in 0..3 {
            let mut stream = connection.accept_uni().await.unwrap();
            let id = stream.id();
            let bytes = stream.read_to_end(4096).await.unwrap();
            publishes.push((id, bytes));
        }
        publishes
    });

    let connector = QuicConnector::new(
        BrokerEndpoint::new("127.0.0.1", port),
        client_config(CA_PEM).unwrap(),
    );
    let established = connector.open(&handshake()).await.unwrap();
    let session = established.session;
    assert!(established.resumption_token.is_some());

    let (a, b, c) = (
        frame("device/sensor-q1/telemetry/temperature"),
        frame("device/sensor-q1/telemetry/humidity"),
        frame("device/sensor-q1/telemetry/status"),
    );
    let (ra, rb, rc) = tokio::join!(session.publish(&a), session.publish(&b), session.publish(&c));
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let publishes = tokio::time::timeout(Duration::from_secs(10), broker_task)
        .await
        .expect("broker did not see three publish streams")
        .unwrap();

    let ids: HashSet<_> = publishes.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids.len(), 3);

    let topics: HashSet<_> = publishes
        .iter()
        .map(|(_, bytes)| publish_topic(bytes))
        .collect();
    assert_eq!(
        topics,
        HashSet::from([
            a.topic.clone(),
            b.topic.clone(),
            c.topic.clone()
        ])
    );

    session.close().await;
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_unknown_ca_is_unreachable() {
    let server = broker();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Some(incoming) = server.accept().await {
            let _ = incoming.await;
        }
    });

    // The leaf is not a trust anchor on its own
    let connector = QuicConnector::new(
        BrokerEndpoint::new("127.0.0.1", port),
        client_config(SERVER_PEM).unwrap(),
    );
    let result = tokio::time::timeout(Duration::from_secs(10), connector.open(&handshake()))
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(quicfall::transport::HandshakeError::Unreachable(_))
    ));
}
