//! Discovery overlay integration: registrars exchanging entries and
//! answering SRV/A queries through the encrypted DNS framing.

use simurgh::dns::client::{DnsClient, OverlayContext};
use simurgh::dns::nameservers::NsAddr;
use simurgh::{
    EnvelopeCodec, RecordData, RecordType, Registrar, SimurghConfig, SnowflakeGenerator,
};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "discovery-test-secret";

fn config() -> SimurghConfig {
    let mut config = SimurghConfig::with_secret(SECRET);
    config.registration_timeout = Duration::from_secs(5);
    config.discovery_poll_interval = Duration::from_millis(100);
    config.tcp_connect_retries = 0;
    config
}

fn overlay_client() -> DnsClient {
    DnsClient::new(Duration::from_secs(2)).with_overlay(OverlayContext {
        codec: Arc::new(EnvelopeCodec::new(SECRET)),
        id_gen: Arc::new(SnowflakeGenerator::new(7)),
        host: "127.0.0.1".to_string(),
        port: 0,
    })
}

#[tokio::test]
async fn test_peers_discover_each_other_by_service_name() {
    let mut seed_config = config();
    seed_config.expected_nodes = 2;

    let seed = Registrar::new("127.0.0.1", 18300, "gateway", "cluster.local", &seed_config)
        .unwrap();
    seed.start().await.unwrap();

    let joiner = Registrar::new("127.0.0.1", 18310, "gateway", "cluster.local", &config())
        .unwrap();
    joiner.start().await.unwrap();

    let nameservers = joiner
        .register_with(&("127.0.0.1".to_string(), 18300))
        .await
        .unwrap();
    assert!(!nameservers.is_empty());

    let entries = seed.discover().await.unwrap();
    assert_eq!(entries.len(), 2);

    let ports: Vec<u16> = entries.iter().map(|entry| entry.service_port).collect();
    assert!(ports.contains(&18300));
    assert!(ports.contains(&18310));

    joiner.close().await;
    seed.close().await;
}

#[tokio::test]
async fn test_external_client_queries_the_overlay() {
    let registrar = Registrar::new("127.0.0.1", 18320, "gateway", "cluster.local", &config())
        .unwrap();
    registrar.start().await.unwrap();

    let client = overlay_client();
    let (dns_udp, dns_tcp) = registrar.dns_ports();
    assert_eq!(dns_udp, 18322);
    assert_eq!(dns_tcp, 18323);

    // SRV enumeration over UDP.
    let udp_addr = NsAddr::parse(&format!("udp://127.0.0.1:{dns_udp}")).unwrap();
    let response = client
        .query("_gateway._udp.cluster.local", RecordType::Srv, &udp_addr)
        .await
        .unwrap();

    assert_eq!(response.answers.len(), 1);
    match &response.answers[0].data {
        RecordData::Srv { port, target, .. } => {
            assert_eq!(*port, 18320);
            assert_eq!(target, "127-0-0-1-18320.cluster.local");
        }
        other => panic!("expected SRV data, got {other:?}"),
    }

    // Follow the SRV target over TCP.
    let tcp_addr = NsAddr::parse(&format!("tcp://127.0.0.1:{dns_tcp}")).unwrap();
    let response = client
        .query("127-0-0-1-18320.cluster.local", RecordType::A, &tcp_addr)
        .await
        .unwrap();

    assert_eq!(response.answers.len(), 1);
    assert_eq!(
        response.answers[0].data,
        RecordData::A("127.0.0.1".parse().unwrap())
    );

    // A plain-DNS client without the cluster secret gets nothing back.
    let plain = DnsClient::new(Duration::from_millis(500));
    let result = plain
        .query("127-0-0-1-18320.cluster.local", RecordType::A, &udp_addr)
        .await;
    assert!(result.is_err());

    registrar.close().await;
}
